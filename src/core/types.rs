//! ER-001: Recipe AST and engine options.
//!
//! Recipes are loaded from YAML. Expressions, conditions, variable references
//! and text fields are written in a compact notation (see `notation`) and
//! parsed while deserializing, so a loaded recipe is a fully built AST that
//! is shared read-only between executions.

use super::error::EngineError;
use super::notation;
use super::value::{ArrayMode, Number};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Expressions
// ============================================================================

/// Binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            BinOp::Add => '+',
            BinOp::Sub => '-',
            BinOp::Mul => '*',
            BinOp::Div => '/',
            BinOp::Rem => '%',
        };
        write!(f, "{}", c)
    }
}

/// A variable reference, optionally indexed: `E[i]`, `KIJ[m,k]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct VarRef {
    pub name: String,
    pub indices: Vec<Expr>,
}

impl VarRef {
    pub fn new(name: &str) -> VarRef {
        VarRef {
            name: name.to_string(),
            indices: Vec::new(),
        }
    }
}

impl TryFrom<String> for VarRef {
    type Error = EngineError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        notation::parse_varref(&s)
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.indices.is_empty() {
            let idx: Vec<String> = self.indices.iter().map(|e| e.to_string()).collect();
            write!(f, "[{}]", idx.join(","))?;
        }
        Ok(())
    }
}

/// Slot expression.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ExprRepr")]
pub enum Expr {
    Number(Number),
    /// `N?`: a literal whose mismatch is tolerated as "desired".
    Desired(Number),
    Var(VarRef),
    /// `X?`: a variable whose mismatch falls in the varspec class.
    Tolerant(VarRef),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Neg(Box<Expr>),
    Bracket(Box<Expr>),
}

impl Expr {
    pub fn int(v: i64) -> Expr {
        Expr::Number(Number::Int(v))
    }

    pub fn var(name: &str) -> Expr {
        Expr::Var(VarRef::new(name))
    }

    /// Visit every variable reference (including those in indices).
    pub fn for_each_var<'a>(&'a self, f: &mut impl FnMut(&'a VarRef)) {
        match self {
            Expr::Number(_) | Expr::Desired(_) => {}
            Expr::Var(v) | Expr::Tolerant(v) => {
                f(v);
                for idx in &v.indices {
                    idx.for_each_var(f);
                }
            }
            Expr::Binary(l, _, r) => {
                l.for_each_var(f);
                r.for_each_var(f);
            }
            Expr::Neg(e) | Expr::Bracket(e) => e.for_each_var(f),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExprRepr {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TryFrom<ExprRepr> for Expr {
    type Error = EngineError;
    fn try_from(repr: ExprRepr) -> Result<Self, Self::Error> {
        match repr {
            ExprRepr::Int(i) => Ok(Expr::Number(Number::Int(i))),
            ExprRepr::Float(f) => Ok(Expr::Number(Number::Float(f))),
            ExprRepr::Text(s) => notation::parse_expr(&s),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Desired(n) => write!(f, "{}?", n),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Tolerant(v) => write!(f, "{}?", v),
            Expr::Binary(l, op, r) => write!(f, "{}{}{}", l, op, r),
            Expr::Neg(e) => write!(f, "-{}", e),
            Expr::Bracket(e) => write!(f, "({})", e),
        }
    }
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Eq => "==",
            RelOp::Ne => "!=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// Boolean condition of `if` branches and `until` clauses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub enum Condition {
    Compare(Expr, RelOp, Expr),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Group(Box<Condition>),
}

impl TryFrom<String> for Condition {
    type Error = EngineError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        notation::parse_condition(&s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare(l, op, r) => write!(f, "{}{}{}", l, op, r),
            Condition::And(parts) => join(f, parts, " and "),
            Condition::Or(parts) => join(f, parts, " or "),
            Condition::Group(c) => write!(f, "({})", c),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, parts: &[Condition], sep: &str) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", part)?;
    }
    Ok(())
}

// ============================================================================
// Records
// ============================================================================

fn default_ctrl() -> Vec<Expr> {
    vec![Expr::var("MAT"), Expr::var("MF"), Expr::var("MT")]
}

fn fmt_ctrl(f: &mut fmt::Formatter<'_>, ctrl: &[Expr]) -> fmt::Result {
    let parts: Vec<String> = ctrl.iter().map(|e| e.to_string()).collect();
    write!(f, "[{}/ ", parts.join(", "))
}

fn fmt_exprs(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// HEAD and CONT records: six slots C1, C2, L1, L2, N1, N2.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContRecord {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<Expr>,
}

/// One field of a TEXT record: `NAME{width}`, `{width}` (skipped) or an
/// open-ended `NAME` taking the rest of the line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct TextField {
    pub name: Option<VarRef>,
    pub width: Option<usize>,
}

impl TryFrom<String> for TextField {
    type Error = EngineError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        notation::parse_text_field(&s)
    }
}

impl fmt::Display for TextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}", name)?;
        }
        if let Some(w) = self.width {
            write!(f, "{{{}}}", w)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextRecord {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<TextField>,
}

/// DIR record: slots L1, L2, N1, N2 after two blank fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirRecord {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<Expr>,
}

/// INTG record: II, JJ and the KIJ vector packed per NDIGIT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntgRecord {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<Expr>,
    pub ndigit: Expr,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tab1Record {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<Expr>,
    #[serde(default)]
    pub table: Option<VarRef>,
    pub x: VarRef,
    pub y: VarRef,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tab2Record {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<Expr>,
    #[serde(default)]
    pub table: Option<VarRef>,
}

/// `{body}{var=from to to}` inside a LIST body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListLoop {
    pub var: String,
    pub from: Expr,
    pub to: Expr,
    pub body: Vec<ListItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ListItemRepr")]
pub enum ListItem {
    Value(Expr),
    Loop(ListLoop),
    /// Skip to the next line boundary (multiple of six values).
    PadLine,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListItemRepr {
    Loop {
        #[serde(rename = "loop")]
        inner: ListLoop,
    },
    Expr(Expr),
}

impl TryFrom<ListItemRepr> for ListItem {
    type Error = EngineError;
    fn try_from(repr: ListItemRepr) -> Result<Self, Self::Error> {
        Ok(match repr {
            ListItemRepr::Loop { inner } => ListItem::Loop(inner),
            ListItemRepr::Expr(Expr::Var(v)) if v.name == "PADLINE" && v.indices.is_empty() => {
                ListItem::PadLine
            }
            ListItemRepr::Expr(e) => ListItem::Value(e),
        })
    }
}

impl fmt::Display for ListItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListItem::Value(e) => write!(f, "{}", e),
            ListItem::PadLine => write!(f, "PADLINE"),
            ListItem::Loop(l) => {
                let body: Vec<String> = l.body.iter().map(|i| i.to_string()).collect();
                write!(f, "{{{}}}{{{}={} to {}}}", body.join(", "), l.var, l.from, l.to)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListRecord {
    #[serde(default = "default_ctrl")]
    pub ctrl: Vec<Expr>,
    pub fields: Vec<Expr>,
    #[serde(default)]
    pub name: Option<VarRef>,
    #[serde(default)]
    pub body: Vec<ListItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopRecord {
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Control flow
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionNode {
    pub name: VarRef,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForLoop {
    pub var: String,
    pub from: Expr,
    pub to: Expr,
    pub body: Vec<Node>,
}

fn default_repeat_start() -> Expr {
    Expr::int(1)
}

/// Open-ended loop; `until` is checked after every iteration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeatLoop {
    #[serde(default)]
    pub var: Option<String>,
    #[serde(default = "default_repeat_start")]
    pub from: Expr,
    pub body: Vec<Node>,
    pub until: Condition,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Branch {
    pub when: Condition,
    /// Number of leaf records to read speculatively before deciding.
    #[serde(default)]
    pub lookahead: Option<Expr>,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IfClause {
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub otherwise: Option<Vec<Node>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Abbreviation {
    pub name: String,
    pub expr: Expr,
}

/// Recipe AST node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Section(SectionNode),
    #[serde(rename = "for")]
    ForLoop(ForLoop),
    #[serde(rename = "repeat")]
    RepeatLoop(RepeatLoop),
    #[serde(rename = "if")]
    IfClause(IfClause),
    #[serde(rename = "let")]
    Abbreviation(Abbreviation),
    Head(ContRecord),
    Cont(ContRecord),
    Text(TextRecord),
    Dir(DirRecord),
    Intg(IntgRecord),
    Tab1(Tab1Record),
    Tab2(Tab2Record),
    List(ListRecord),
    Send,
    Stop(StopRecord),
    Comment(String),
}

impl Node {
    /// Record nodes consume lines; they count as lookahead steps.
    pub fn is_record(&self) -> bool {
        matches!(
            self,
            Node::Head(_)
                | Node::Cont(_)
                | Node::Text(_)
                | Node::Dir(_)
                | Node::Intg(_)
                | Node::Tab1(_)
                | Node::Tab2(_)
                | Node::List(_)
                | Node::Send
                | Node::Stop(_)
        )
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Section(s) => write!(f, "(section {})", s.name),
            Node::ForLoop(l) => write!(f, "for {}={} to {}:", l.var, l.from, l.to),
            Node::RepeatLoop(r) => match &r.var {
                Some(v) => write!(f, "repeat {}={}: ... until {}", v, r.from, r.until),
                None => write!(f, "repeat: ... until {}", r.until),
            },
            Node::IfClause(c) => match c.branches.first() {
                Some(b) => write!(f, "if {}:", b.when),
                None => write!(f, "if:"),
            },
            Node::Abbreviation(a) => write!(f, "{} := {}", a.name, a.expr),
            Node::Head(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                write!(f, "{}]HEAD", fmt_exprs(&r.fields))
            }
            Node::Cont(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                write!(f, "{}]CONT", fmt_exprs(&r.fields))
            }
            Node::Text(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                let parts: Vec<String> = r.fields.iter().map(|t| t.to_string()).collect();
                write!(f, "{}]TEXT", parts.join(", "))
            }
            Node::Dir(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                write!(f, "blank, blank, {}]DIR", fmt_exprs(&r.fields))
            }
            Node::Intg(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                write!(f, "{}]INTG{{{}}}", fmt_exprs(&r.fields), r.ndigit)
            }
            Node::Tab1(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                write!(f, "{}/ {} / {}]TAB1", fmt_exprs(&r.fields), r.x, r.y)?;
                if let Some(t) = &r.table {
                    write!(f, " ({})", t)?;
                }
                Ok(())
            }
            Node::Tab2(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                write!(f, "{}]TAB2", fmt_exprs(&r.fields))?;
                if let Some(t) = &r.table {
                    write!(f, " ({})", t)?;
                }
                Ok(())
            }
            Node::List(r) => {
                fmt_ctrl(f, &r.ctrl)?;
                let body: Vec<String> = r.body.iter().map(|i| i.to_string()).collect();
                write!(f, "{}/ {}]LIST", fmt_exprs(&r.fields), body.join(", "))?;
                if let Some(n) = &r.name {
                    write!(f, " ({})", n)?;
                }
                Ok(())
            }
            Node::Send => write!(f, "SEND"),
            Node::Stop(s) => write!(f, "STOP({})", s.message.as_deref().unwrap_or("")),
            Node::Comment(c) => write!(f, "{}", c),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Which mismatch classes are demoted to warnings while decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tolerance {
    pub exact: bool,
    pub zero: bool,
    pub desired: bool,
    pub varspec: bool,
    pub fuzzy: bool,
    /// Compare decoded floats with `rtol=1e-5, atol=1e-7`.
    pub fuzzy_matching: bool,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            exact: false,
            zero: true,
            desired: false,
            varspec: true,
            fuzzy: false,
            fuzzy_matching: false,
        }
    }
}

impl Tolerance {
    /// Demote every class (used inside lookahead windows).
    pub fn permissive() -> Tolerance {
        Tolerance {
            exact: true,
            zero: true,
            desired: true,
            varspec: true,
            fuzzy: true,
            fuzzy_matching: false,
        }
    }
}

/// Fixed-width numeric formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatOptions {
    pub width: usize,
    pub keep_e: bool,
    pub abuse_signpos: bool,
    pub prefer_noexp: bool,
    pub skip_intzero: bool,
    pub accept_spaces: bool,
    pub strict_datatypes: bool,
    /// Leave the zero fields of SEND/FEND/MEND/TEND blank.
    pub zero_as_blank: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            width: 11,
            keep_e: false,
            abuse_signpos: false,
            prefer_noexp: false,
            skip_intzero: false,
            accept_spaces: true,
            strict_datatypes: false,
            zero_as_blank: false,
        }
    }
}

/// Engine and document options, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub array_mode: ArrayMode,
    pub max_slot_passes: usize,
    pub trail_capacity: usize,
    pub best_effort: bool,
    pub include_linenum: bool,
    pub ignore_blank_lines: bool,
    pub ignore_send_records: bool,
    pub ignore_missing_tpid: bool,
    /// Encoding fails when an array holds elements no record wrote.
    pub check_arrays: bool,
    pub tolerance: Tolerance,
    pub format: FormatOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            array_mode: ArrayMode::Sparse,
            max_slot_passes: 3,
            trail_capacity: 20,
            best_effort: false,
            include_linenum: true,
            ignore_blank_lines: false,
            ignore_send_records: false,
            ignore_missing_tpid: false,
            check_arrays: true,
            tolerance: Tolerance::default(),
            format: FormatOptions::default(),
        }
    }
}

/// Parse recipe YAML. Nodes are written as single-key maps (`- cont: {...}`)
/// or bare names (`- send`) at any depth.
pub fn parse_yaml<T: DeserializeOwned>(source: &str) -> Result<T, serde_yaml_ng::Error> {
    serde_yaml_ng::with::singleton_map_recursive::deserialize(serde_yaml_ng::Deserializer::from_str(source))
}

impl Options {
    /// Load options from a YAML file.
    pub fn load(path: &std::path::Path) -> Result<Options, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read options {}: {}", path.display(), e))?;
        serde_yaml_ng::from_str(&content).map_err(|e| format!("options parse error: {}", e))
    }
}

// ============================================================================
// Tests
// ============================================================================
