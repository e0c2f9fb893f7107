//! ER-005: Expression evaluator: affine partial evaluation and binding.
//!
//! A slot expression evaluates to `constant + coefficient * unknown` where
//! `unknown` is at most one variable that is not bound yet. Reading solves
//! that equation for the unknown from the decoded field; writing evaluates
//! the expression fully from bound variables.

use super::error::{EngineError, Result};
use super::scope::{Binding, Lookup, Scope};
use super::types::{BinOp, Condition, Expr, RelOp, VarRef};
use super::value::{Number, Value};
use std::fmt;

/// Abbreviations referencing each other deeper than this are cyclic.
const MAX_ABBREV_DEPTH: usize = 64;

/// An unbound variable with its indices already evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Unknown {
    pub name: String,
    pub indices: Vec<i64>,
}

impl fmt::Display for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.indices.is_empty() {
            let idx: Vec<String> = self.indices.iter().map(|i| i.to_string()).collect();
            write!(f, "[{}]", idx.join(","))?;
        }
        Ok(())
    }
}

/// `constant + coefficient * unbound`.
#[derive(Debug, Clone, PartialEq)]
pub struct Affine {
    pub constant: Number,
    pub coefficient: Number,
    pub unbound: Option<Unknown>,
}

impl Affine {
    pub fn constant(n: Number) -> Affine {
        Affine {
            constant: n,
            coefficient: Number::Int(0),
            unbound: None,
        }
    }

    pub fn unknown(var: Unknown) -> Affine {
        Affine {
            constant: Number::Int(0),
            coefficient: Number::Int(1),
            unbound: Some(var),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.unbound.is_none()
    }

    /// The value if no variable is unbound.
    pub fn value(&self) -> Option<Number> {
        self.is_bound().then_some(self.constant)
    }

    fn neg(self) -> Affine {
        Affine {
            constant: self.constant.neg(),
            coefficient: self.coefficient.neg(),
            unbound: self.unbound,
        }
    }

    /// A zero coefficient means the unknown no longer matters.
    fn normalized(mut self) -> Affine {
        if self.coefficient.is_zero() {
            self.unbound = None;
            self.coefficient = Number::Int(0);
        }
        self
    }
}

/// What to do when a variable is not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissing {
    /// Leave it as the unknown of the affine form (reading slots).
    Unbound,
    /// Raise `VariableNotFound` / `UnavailableIndex`.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalCtx {
    pub lookup: Lookup,
    pub on_missing: OnMissing,
    /// Integer division of integers must be exact.
    pub strict_int: bool,
}

impl EvalCtx {
    /// Slot evaluation while decoding.
    pub fn read_slot(strict_int: bool) -> EvalCtx {
        EvalCtx {
            lookup: Lookup::Local,
            on_missing: OnMissing::Unbound,
            strict_int,
        }
    }

    /// Slot evaluation while encoding.
    pub fn write_slot() -> EvalCtx {
        EvalCtx {
            lookup: Lookup::Local,
            on_missing: OnMissing::Fail,
            strict_int: false,
        }
    }

    /// Indices, loop bounds, conditions and other control expressions.
    pub fn control() -> EvalCtx {
        EvalCtx {
            lookup: Lookup::Chain,
            on_missing: OnMissing::Fail,
            strict_int: true,
        }
    }
}

/// Direction of a slot binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Partially evaluate `expr` against `scope`.
pub fn evaluate(expr: &Expr, scope: &Scope, ctx: EvalCtx) -> Result<Affine> {
    eval_inner(expr, scope, ctx, 0)
}

fn eval_inner(expr: &Expr, scope: &Scope, ctx: EvalCtx, depth: usize) -> Result<Affine> {
    match expr {
        Expr::Number(n) | Expr::Desired(n) => Ok(Affine::constant(*n)),
        Expr::Var(v) | Expr::Tolerant(v) => eval_var(v, scope, ctx, depth),
        Expr::Bracket(e) => eval_inner(e, scope, ctx, depth),
        Expr::Neg(e) => Ok(eval_inner(e, scope, ctx, depth)?.neg()),
        Expr::Binary(lhs, op, rhs) => {
            let a = eval_inner(lhs, scope, ctx, depth)?;
            let b = eval_inner(rhs, scope, ctx, depth)?;
            combine(a, *op, b, expr, ctx.strict_int)
        }
    }
}

fn eval_var(var: &VarRef, scope: &Scope, ctx: EvalCtx, depth: usize) -> Result<Affine> {
    let indices = var
        .indices
        .iter()
        .map(|e| evaluate_index(e, scope))
        .collect::<Result<Vec<_>>>()?;
    match scope.get(&var.name, &indices, ctx.lookup)? {
        Some(Binding::Loop(i)) => Ok(Affine::constant(Number::Int(i))),
        Some(Binding::Abbrev(e)) => {
            if depth >= MAX_ABBREV_DEPTH {
                return Err(EngineError::InvalidRecipe(format!(
                    "abbreviation {} is cyclic",
                    var.name
                )));
            }
            eval_inner(e, scope, ctx, depth + 1)
        }
        Some(Binding::Data(Value::Number(n))) => Ok(Affine::constant(*n)),
        Some(Binding::Data(_)) => Err(EngineError::NotNumeric(var.to_string())),
        None => match ctx.on_missing {
            OnMissing::Unbound => Ok(Affine::unknown(Unknown {
                name: var.name.clone(),
                indices,
            })),
            OnMissing::Fail => Err(missing(&var.name, &indices)),
        },
    }
}

pub(crate) fn missing(name: &str, indices: &[i64]) -> EngineError {
    if indices.is_empty() {
        EngineError::VariableNotFound(name.to_string())
    } else {
        EngineError::UnavailableIndex {
            name: name.to_string(),
            index: indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

fn combine(a: Affine, op: BinOp, b: Affine, expr: &Expr, strict_int: bool) -> Result<Affine> {
    let both_unbound = !a.is_bound() && !b.is_bound();
    let out = match op {
        BinOp::Add | BinOp::Sub => {
            if both_unbound {
                return Err(EngineError::SeveralUnboundVariables(expr.to_string()));
            }
            let b = if op == BinOp::Sub { b.neg() } else { b };
            Affine {
                constant: a.constant.add(b.constant),
                coefficient: a.coefficient.add(b.coefficient),
                unbound: a.unbound.or(b.unbound),
            }
        }
        BinOp::Mul => {
            if both_unbound {
                return Err(EngineError::SeveralUnboundVariables(expr.to_string()));
            }
            let (k, other) = if a.is_bound() { (a.constant, b) } else { (b.constant, a) };
            Affine {
                constant: other.constant.mul(k),
                coefficient: other.coefficient.mul(k),
                unbound: other.unbound,
            }
        }
        BinOp::Div => {
            if !b.is_bound() {
                return Err(EngineError::VariableInDenominator(expr.to_string()));
            }
            let k = b.constant;
            if k.is_zero() {
                return Err(EngineError::DivisionByZero(expr.to_string()));
            }
            Affine {
                constant: a.constant.div(k, strict_int)?,
                coefficient: a.coefficient.div(k, false)?,
                unbound: a.unbound,
            }
        }
        BinOp::Rem => {
            if !a.is_bound() || !b.is_bound() {
                return Err(EngineError::ModuloEquation(expr.to_string()));
            }
            Affine::constant(a.constant.rem(b.constant)?)
        }
    };
    Ok(out.normalized())
}

/// Value of the unknown given the decoded field: `(field - c) / coef`.
pub fn solve(affine: &Affine, field: Number, strict_int: bool) -> Result<Number> {
    let var = affine.unbound.as_ref().ok_or_else(|| {
        EngineError::InvalidRecipe("no unbound variable to solve for".into())
    })?;
    if affine.constant.is_zero() && affine.coefficient == Number::Int(1) {
        return Ok(field);
    }
    field
        .sub(affine.constant)
        .div(affine.coefficient, strict_int)
        .map_err(|e| match e {
            EngineError::InvalidInteger(msg) => {
                EngineError::InvalidInteger(format!("{} (variable {})", msg, var))
            }
            other => other,
        })
}

/// Field value given the variable's value: `c + coef * value`.
pub fn apply(affine: &Affine, value: Number) -> Number {
    affine.constant.add(affine.coefficient.mul(value))
}

/// Bind in either direction: solve for the variable when reading, compute
/// the field when writing.
pub fn bind(affine: &Affine, value: Number, direction: Direction, strict_int: bool) -> Result<Number> {
    match direction {
        Direction::Read => solve(affine, value, strict_int),
        Direction::Write => Ok(apply(affine, value)),
    }
}

/// Fully evaluate `expr`; every variable must be bound.
pub fn evaluate_number(expr: &Expr, scope: &Scope, ctx: EvalCtx) -> Result<Number> {
    let ctx = EvalCtx {
        on_missing: OnMissing::Fail,
        ..ctx
    };
    let affine = evaluate(expr, scope, ctx)?;
    affine
        .value()
        .ok_or_else(|| EngineError::SeveralUnboundVariables(expr.to_string()))
}

/// Evaluate an integer-valued control expression (index, loop bound,
/// lookahead budget, NDIGIT).
pub fn evaluate_index(expr: &Expr, scope: &Scope) -> Result<i64> {
    let n = evaluate_number(expr, scope, EvalCtx::control())?;
    n.as_exact_int()
        .ok_or_else(|| EngineError::InvalidInteger(format!("{} evaluates to {}", expr, n)))
}

/// Evaluate a condition. A comparison that refers to a missing variable is
/// false.
pub fn evaluate_condition(cond: &Condition, scope: &Scope) -> Result<bool> {
    match cond {
        Condition::Compare(lhs, op, rhs) => {
            let ctx = EvalCtx::control();
            let pair = evaluate_number(lhs, scope, ctx)
                .and_then(|l| evaluate_number(rhs, scope, ctx).map(|r| (l, r)));
            let (l, r) = match pair {
                Ok(pair) => pair,
                Err(EngineError::VariableNotFound(_)) | Err(EngineError::UnavailableIndex { .. }) => {
                    return Ok(false)
                }
                Err(e) => return Err(e),
            };
            Ok(match op {
                RelOp::Eq => l == r,
                RelOp::Ne => l != r,
                RelOp::Lt => l < r,
                RelOp::Le => l <= r,
                RelOp::Gt => l > r,
                RelOp::Ge => l >= r,
            })
        }
        Condition::And(parts) => {
            for part in parts {
                if !evaluate_condition(part, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or(parts) => {
            for part in parts {
                if evaluate_condition(part, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Group(inner) => evaluate_condition(inner, scope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notation::{parse_condition, parse_expr};
    use crate::core::value::ArrayMode;
    use proptest::prelude::*;

    fn scope_with(vars: &[(&str, Number)]) -> Scope {
        let mut scope = Scope::new(ArrayMode::Sparse);
        for (name, v) in vars {
            scope.set(name, &[], Value::Number(*v)).unwrap();
        }
        scope
    }

    fn read(expr: &str, scope: &Scope) -> Result<Affine> {
        evaluate(&parse_expr(expr).unwrap(), scope, EvalCtx::read_slot(true))
    }

    #[test]
    fn test_er005_bound_expression() {
        let scope = scope_with(&[("NWD", Number::Int(12))]);
        let a = read("NWD-5", &scope).unwrap();
        assert_eq!(a.value(), Some(Number::Int(7)));
    }

    #[test]
    fn test_er005_single_unknown_is_affine() {
        let scope = scope_with(&[("K", Number::Int(3))]);
        let a = read("2*X+K", &scope).unwrap();
        assert_eq!(a.constant, Number::Int(3));
        assert_eq!(a.coefficient, Number::Int(2));
        assert_eq!(a.unbound.as_ref().unwrap().name, "X");
    }

    #[test]
    fn test_er005_several_unbound() {
        let scope = Scope::new(ArrayMode::Sparse);
        assert!(matches!(read("X+Y", &scope), Err(EngineError::SeveralUnboundVariables(_))));
        assert!(matches!(read("X*Y", &scope), Err(EngineError::SeveralUnboundVariables(_))));
        assert!(matches!(read("X-Y", &scope), Err(EngineError::SeveralUnboundVariables(_))));
    }

    #[test]
    fn test_er005_unsolvable_forms() {
        let scope = Scope::new(ArrayMode::Sparse);
        assert!(matches!(read("1/X", &scope), Err(EngineError::VariableInDenominator(_))));
        assert!(matches!(read("X%2", &scope), Err(EngineError::ModuloEquation(_))));
        assert!(matches!(read("X/0", &scope), Err(EngineError::DivisionByZero(_))));
    }

    #[test]
    fn test_er005_strict_integer_division() {
        let scope = scope_with(&[("N", Number::Int(7))]);
        assert!(matches!(read("N/2", &scope), Err(EngineError::InvalidInteger(_))));
        let relaxed = evaluate(
            &parse_expr("N/2").unwrap(),
            &scope,
            EvalCtx::read_slot(false),
        )
        .unwrap();
        assert_eq!(relaxed.value(), Some(Number::Float(3.5)));
    }

    #[test]
    fn test_er005_zero_coefficient_drops_unknown() {
        let scope = Scope::new(ArrayMode::Sparse);
        let a = read("0*X+4", &scope).unwrap();
        assert_eq!(a.value(), Some(Number::Int(4)));
    }

    #[test]
    fn test_er005_solve_and_apply() {
        let scope = Scope::new(ArrayMode::Sparse);
        let a = read("3*X-2", &scope).unwrap();
        let x = bind(&a, Number::Int(13), Direction::Read, true).unwrap();
        assert_eq!(x, Number::Int(5));
        let field = bind(&a, Number::Int(5), Direction::Write, true).unwrap();
        assert_eq!(field, Number::Int(13));
        assert!(matches!(
            solve(&a, Number::Int(12), true),
            Err(EngineError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_er005_write_mode_missing_variable() {
        let scope = Scope::new(ArrayMode::Sparse);
        let err = evaluate(&parse_expr("AWR").unwrap(), &scope, EvalCtx::write_slot()).unwrap_err();
        assert!(matches!(err, EngineError::VariableNotFound(ref n) if n == "AWR"));
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.declare_loop_var("i", 4).unwrap();
        let err = evaluate(&parse_expr("E[i]").unwrap(), &scope, EvalCtx::write_slot()).unwrap_err();
        assert!(matches!(err, EngineError::UnavailableIndex { .. }));
    }

    #[test]
    fn test_er005_indexed_lookup_and_loop_vars() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.set("E", &[2], Value::Number(Number::Float(1.5))).unwrap();
        scope.declare_loop_var("i", 1).unwrap();
        let a = read("E[i+1]", &scope).unwrap();
        assert_eq!(a.value(), Some(Number::Float(1.5)));
    }

    #[test]
    fn test_er005_abbreviation_reevaluated() {
        let mut scope = scope_with(&[("NK", Number::Int(2))]);
        scope
            .register_abbreviation("TWICE", parse_expr("2*NK").unwrap())
            .unwrap();
        assert_eq!(read("TWICE", &scope).unwrap().value(), Some(Number::Int(4)));
        scope.set("NK", &[], Value::Number(Number::Int(5))).unwrap();
        assert_eq!(read("TWICE", &scope).unwrap().value(), Some(Number::Int(10)));
    }

    #[test]
    fn test_er005_cyclic_abbreviation() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.register_abbreviation("A", parse_expr("A+1").unwrap()).unwrap();
        assert!(matches!(read("A", &scope), Err(EngineError::InvalidRecipe(_))));
    }

    #[test]
    fn test_er005_index_must_be_integer() {
        let scope = scope_with(&[("H", Number::Float(0.5))]);
        assert!(matches!(
            evaluate_index(&parse_expr("H").unwrap(), &scope),
            Err(EngineError::InvalidInteger(_))
        ));
        let scope = scope_with(&[("H", Number::Float(2.0))]);
        assert_eq!(evaluate_index(&parse_expr("H+1").unwrap(), &scope).unwrap(), 3);
    }

    #[test]
    fn test_er005_conditions() {
        let scope = scope_with(&[("LTY", Number::Int(0)), ("NK", Number::Int(3))]);
        let t = |s: &str| evaluate_condition(&parse_condition(s).unwrap(), &scope).unwrap();
        assert!(t("LTY==0 and NK>1"));
        assert!(!t("LTY!=0 or NK<=2"));
        assert!(t("(LTY>0 or NK>=3) and NK<4"));
        assert!(!t("MISSING==1"));
        assert!(t("MISSING==1 or NK==3"));
    }

    proptest! {
        #[test]
        fn prop_er005_affine_solving_exact(
            a in (-50i64..50).prop_filter("nonzero", |a| *a != 0),
            b in -1000i64..1000,
            x in -1000i64..1000,
        ) {
            let scope = scope_with(&[("A", Number::Int(a)), ("B", Number::Int(b))]);
            let affine = read("A*X+B", &scope).unwrap();
            let v = a * x + b;
            let solved = bind(&affine, Number::Int(v), Direction::Read, true).unwrap();
            prop_assert_eq!(solved, Number::Int(x));
            let back = bind(&affine, solved, Direction::Write, true).unwrap();
            prop_assert_eq!(back, Number::Int(v));
        }

        #[test]
        fn prop_er005_affine_solving_float(
            a in 0.5f64..100.0,
            b in -100.0f64..100.0,
            x in -100.0f64..100.0,
        ) {
            let scope = scope_with(&[("A", Number::Float(a)), ("B", Number::Float(b))]);
            let affine = read("A*X+B", &scope).unwrap();
            let solved = solve(&affine, Number::Float(a * x + b), true).unwrap();
            prop_assert!((solved.as_f64() - x).abs() <= 1e-9 * (1.0 + x.abs()));
        }
    }
}
