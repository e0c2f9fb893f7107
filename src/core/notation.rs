//! ER-002: Recipe notation for expressions, conditions and text fields.
//!
//! Grammar (whitespace insignificant):
//!
//! ```text
//! condition := conj ("or" conj)*
//! conj      := cmp ("and" cmp)*
//! cmp       := "(" condition ")" | expr relop expr
//! expr      := term (("+" | "-") term)*
//! term      := unary (("*" | "/" | "%") unary)*
//! unary     := "-" unary | atom
//! atom      := number "?"? | varref "?"? | "(" expr ")"
//! varref    := NAME ("[" expr ("," expr)* "]")?
//! ```

use super::error::{EngineError, Result};
use super::types::{BinOp, Condition, Expr, RelOp, TextField, VarRef};
use super::value::Number;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Number),
    Ident(String),
    Op(BinOp),
    Rel(RelOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    And,
    Or,
}

fn err(input: &str, message: impl Into<String>) -> EngineError {
    EngineError::Notation {
        input: input.to_string(),
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => push(&mut tokens, &mut i, Token::Op(BinOp::Add)),
            '-' => push(&mut tokens, &mut i, Token::Op(BinOp::Sub)),
            '*' => push(&mut tokens, &mut i, Token::Op(BinOp::Mul)),
            '/' => push(&mut tokens, &mut i, Token::Op(BinOp::Div)),
            '%' => push(&mut tokens, &mut i, Token::Op(BinOp::Rem)),
            '(' => push(&mut tokens, &mut i, Token::LParen),
            ')' => push(&mut tokens, &mut i, Token::RParen),
            '[' => push(&mut tokens, &mut i, Token::LBracket),
            ']' => push(&mut tokens, &mut i, Token::RBracket),
            ',' => push(&mut tokens, &mut i, Token::Comma),
            '?' => push(&mut tokens, &mut i, Token::Question),
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    ('=', Some('=')) => (RelOp::Eq, 2),
                    ('!', Some('=')) => (RelOp::Ne, 2),
                    ('<', Some('=')) => (RelOp::Le, 2),
                    ('>', Some('=')) => (RelOp::Ge, 2),
                    ('<', _) => (RelOp::Lt, 1),
                    ('>', _) => (RelOp::Gt, 1),
                    _ => return Err(err(input, format!("unexpected '{}' at {}", c, i))),
                };
                tokens.push(Token::Rel(op));
                i += len;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let num = if is_float {
                    text.parse::<f64>()
                        .map(Number::Float)
                        .map_err(|_| err(input, format!("bad number {:?}", text)))?
                } else {
                    text.parse::<i64>()
                        .map(Number::Int)
                        .map_err(|_| err(input, format!("bad number {:?}", text)))?
                };
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(err(input, format!("unexpected '{}' at {}", other, i))),
        }
    }
    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, i: &mut usize, tok: Token) {
    tokens.push(tok);
    *i += 1;
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Parser<'a>> {
        Ok(Parser {
            input,
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(err(
                self.input,
                format!("expected {:?}, found {:?}", tok, self.peek()),
            ))
        }
    }

    fn finish(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(err(self.input, format!("trailing {:?}", tok))),
        }
    }

    fn condition(&mut self) -> Result<Condition> {
        let mut parts = vec![self.conjunction()?];
        while self.eat(&Token::Or) {
            parts.push(self.conjunction()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::Or(parts)
        })
    }

    fn conjunction(&mut self) -> Result<Condition> {
        let mut parts = vec![self.comparison()?];
        while self.eat(&Token::And) {
            parts.push(self.comparison()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::And(parts)
        })
    }

    fn comparison(&mut self) -> Result<Condition> {
        if self.peek() == Some(&Token::LParen) {
            // A parenthesis opens either a grouped condition or an arithmetic
            // bracket; try the former and rewind if it does not fit.
            let saved = self.pos;
            self.pos += 1;
            if let Ok(inner) = self.condition() {
                if self.eat(&Token::RParen)
                    && !matches!(self.peek(), Some(Token::Rel(_)) | Some(Token::Op(_)))
                {
                    return Ok(Condition::Group(Box::new(inner)));
                }
            }
            self.pos = saved;
        }
        let lhs = self.expr()?;
        let op = match self.bump() {
            Some(Token::Rel(op)) => op,
            other => {
                return Err(err(
                    self.input,
                    format!("expected comparison operator, found {:?}", other),
                ))
            }
        };
        let rhs = self.expr()?;
        Ok(Condition::Compare(lhs, op, rhs))
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Rem))) =
            self.peek().cloned()
        {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Op(BinOp::Sub)) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Op(BinOp::Add)) {
            return self.unary();
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Num(n)) => {
                if self.eat(&Token::Question) {
                    Ok(Expr::Desired(n))
                } else {
                    Ok(Expr::Number(n))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Bracket(Box::new(inner)))
            }
            Some(Token::Ident(name)) => {
                let var = self.var_tail(name)?;
                if self.eat(&Token::Question) {
                    Ok(Expr::Tolerant(var))
                } else {
                    Ok(Expr::Var(var))
                }
            }
            other => Err(err(self.input, format!("unexpected {:?}", other))),
        }
    }

    fn var_tail(&mut self, name: String) -> Result<VarRef> {
        let mut indices = Vec::new();
        if self.eat(&Token::LBracket) {
            indices.push(self.expr()?);
            while self.eat(&Token::Comma) {
                indices.push(self.expr()?);
            }
            self.expect(&Token::RBracket)?;
        }
        Ok(VarRef { name, indices })
    }

    fn varref(&mut self) -> Result<VarRef> {
        match self.bump() {
            Some(Token::Ident(name)) => self.var_tail(name),
            other => Err(err(self.input, format!("expected a name, found {:?}", other))),
        }
    }
}

/// Parse an arithmetic slot expression such as `NWD-5` or `AWR?`.
pub fn parse_expr(input: &str) -> Result<Expr> {
    let mut p = Parser::new(input)?;
    let e = p.expr()?;
    p.finish()?;
    Ok(e)
}

/// Parse a condition such as `LTY==0 and (NK>1 or LB<=4)`.
pub fn parse_condition(input: &str) -> Result<Condition> {
    let mut p = Parser::new(input)?;
    let c = p.condition()?;
    p.finish()?;
    Ok(c)
}

/// Parse a variable reference such as `xstable` or `subsection[k]`.
pub fn parse_varref(input: &str) -> Result<VarRef> {
    let mut p = Parser::new(input)?;
    let v = p.varref()?;
    p.finish()?;
    Ok(v)
}

/// Parse a TEXT field: `NAME{11}`, `{1}` or open-ended `NAME`.
pub fn parse_text_field(input: &str) -> Result<TextField> {
    let trimmed = input.trim();
    let (name_part, width) = match trimmed.find('{') {
        Some(open) => {
            let close = trimmed
                .rfind('}')
                .filter(|c| *c == trimmed.len() - 1 && *c > open)
                .ok_or_else(|| err(input, "unclosed width"))?;
            let width = trimmed[open + 1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| err(input, "width must be a positive integer"))?;
            if width == 0 {
                return Err(err(input, "width must be a positive integer"));
            }
            (&trimmed[..open], Some(width))
        }
        None => (trimmed, None),
    };
    let name = if name_part.trim().is_empty() {
        None
    } else {
        Some(parse_varref(name_part)?)
    };
    if name.is_none() && width.is_none() {
        return Err(err(input, "empty text field"));
    }
    Ok(TextField { name, width })
}
