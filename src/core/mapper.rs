//! ER-011: Record mapper: binds the slots of one record template to the
//! fields of one record.
//!
//! Reading decodes a line (or a record body) and, slot by slot, either
//! checks the decoded value against the expression or solves the
//! expression for its single unbound variable. Slots whose expression
//! still has several unbound variables are deferred to a later pass, so a
//! slot may depend on a variable bound further right on the same line.
//! Writing evaluates every slot from bound variables and renders the line.

use super::error::{EngineError, Mismatch, MismatchClass, Result};
use super::expr::{self, evaluate, evaluate_index, evaluate_number, EvalCtx};
use super::lookahead::{Lookahead, Step};
use super::scope::{Binding, Lookup, Scope};
use super::types::{
    ContRecord, DirRecord, Expr, IntgRecord, ListItem, ListLoop, ListRecord, Node, Options,
    Tab1Record, Tab2Record, TextRecord, VarRef,
};
use super::value::{Number, Value};
use crate::format::records::{
    self, deinterleave, interleave, read_ctrl, Ctrl, End, CONT_SLOTS, PER_LINE,
};
use crate::format::{FieldCodec, FieldKind};
use tracing::{debug, trace, warn};

const CTRL_SLOTS: [&str; 3] = ["MAT", "MF", "MT"];

/// Absolute and relative tolerance of fuzzy matching.
const FUZZY_ATOL: f64 = 1e-7;
const FUZZY_RTOL: f64 = 1e-5;

/// Where lines come from or go to.
pub enum Io<'a> {
    Read { lines: &'a [String], ofs: &'a mut usize },
    Write { out: &'a mut Vec<String> },
}

/// Result of binding one slot in one pass.
enum SlotOutcome {
    Solved,
    /// Several unbound variables; may resolve once other slots are bound.
    Deferred(EngineError),
}

/// One slot of a decoded record: its label, template expression and the
/// decoded value.
struct Slot<'e> {
    label: String,
    expr: &'e Expr,
    field: Number,
}

pub struct RecordMapper<'a> {
    pub scope: &'a mut Scope,
    pub lookahead: &'a mut Lookahead,
    pub io: Io<'a>,
    pub opts: &'a Options,
    pub codec: &'a dyn FieldCodec,
    pub warnings: &'a mut Vec<Mismatch>,
}

fn is_close(expected: Number, found: Number) -> bool {
    let (a, b) = (found.as_f64(), expected.as_f64());
    (a - b).abs() <= FUZZY_ATOL + FUZZY_RTOL * b.abs()
}

/// Whether an expression carries `N?` or `X?` markers.
fn markers(expr: &Expr) -> (bool, bool) {
    match expr {
        Expr::Desired(_) => (true, false),
        Expr::Tolerant(_) => (false, true),
        Expr::Number(_) | Expr::Var(_) => (false, false),
        Expr::Neg(e) | Expr::Bracket(e) => markers(e),
        Expr::Binary(l, _, r) => {
            let (a, b) = markers(l);
            let (c, d) = markers(r);
            (a || c, b || d)
        }
    }
}

fn expect_fields<T>(fields: &[T], n: usize, what: &str) -> Result<()> {
    if fields.len() != n {
        return Err(EngineError::InvalidRecipe(format!(
            "{} takes {} fields, template has {}",
            what,
            n,
            fields.len()
        )));
    }
    Ok(())
}

/// A non-negative count field (NR, NP, NPL).
fn count(n: Number, what: &str) -> Result<usize> {
    n.as_exact_int()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| EngineError::SizeMismatch(format!("{} = {} is not a valid count", what, n)))
}

impl<'a> RecordMapper<'a> {
    /// Map one record node in the direction given by the stream.
    pub fn map(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Head(r) => self.cont(r, "HEAD"),
            Node::Cont(r) => self.cont(r, "CONT"),
            Node::Text(r) => self.text(r),
            Node::Dir(r) => self.dir(r),
            Node::Intg(r) => self.intg(r),
            Node::Tab1(r) => self.tab1(r),
            Node::Tab2(r) => self.tab2(r),
            Node::List(r) => self.list(r),
            Node::Send => self.send(),
            Node::Stop(s) => Err(EngineError::Stop(
                s.message.clone().unwrap_or_else(|| "stop instruction".to_string()),
            )),
            other => Err(EngineError::InvalidRecipe(format!("{} is not a record", other))),
        }
    }

    fn reading(&self) -> bool {
        matches!(self.io, Io::Read { .. })
    }

    /// Mismatches are not reported while speculating.
    fn speculative(&self) -> bool {
        self.lookahead.is_active()
    }

    // ========================================================================
    // Stream access
    // ========================================================================

    fn read_line(&mut self, what: &str) -> Result<&'a str> {
        match &mut self.io {
            Io::Read { lines, ofs } => {
                let lines: &'a [String] = *lines;
                records::next_line(lines, ofs, what).map(|(_, line)| line)
            }
            Io::Write { .. } => Err(EngineError::InvalidRecipe(format!(
                "{} read while encoding",
                what
            ))),
        }
    }

    fn read_body(&mut self, n: usize, kind: FieldKind) -> Result<Vec<Number>> {
        let codec = self.codec;
        match &mut self.io {
            Io::Read { lines, ofs } => records::read_numbers(lines, ofs, n, kind, codec),
            Io::Write { .. } => Err(EngineError::InvalidRecipe("record body read while encoding".into())),
        }
    }

    fn emit(&mut self, body: String, ctrl: Ctrl) -> Result<()> {
        match &mut self.io {
            Io::Write { out } => {
                out.push(format!("{}{}", body, ctrl));
                Ok(())
            }
            Io::Read { .. } => Err(EngineError::InvalidRecipe("line written while decoding".into())),
        }
    }

    fn emit_body(&mut self, values: &[Number], kind: FieldKind, ctrl: Ctrl) -> Result<()> {
        for line in records::write_numbers(values, kind, self.codec)? {
            self.emit(line, ctrl)?;
        }
        Ok(())
    }

    // ========================================================================
    // Control triple
    // ========================================================================

    /// Compare the control triple of `line` with the template. Expressions
    /// that cannot be evaluated yet are not checked.
    fn check_ctrl(&self, exprs: &[Expr], line: &str) -> Result<()> {
        let actual = read_ctrl(line, self.codec.width())?.as_array();
        for ((expr, found), label) in exprs.iter().zip(actual).zip(CTRL_SLOTS) {
            match evaluate_number(expr, self.scope, EvalCtx::control()) {
                Ok(expected) if expected != Number::Int(found) => {
                    return Err(EngineError::UnexpectedControlRecord(format!(
                        "expected {}={} but found {}",
                        label, expected, found
                    )))
                }
                Ok(_)
                | Err(EngineError::VariableNotFound(_))
                | Err(EngineError::UnavailableIndex { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_ctrl(&self, exprs: &[Expr]) -> Result<Ctrl> {
        let mut out = [0i64; 3];
        for ((slot, expr), label) in out.iter_mut().zip(exprs).zip(CTRL_SLOTS) {
            let n = evaluate_number(expr, self.scope, EvalCtx::control())?;
            *slot = n.as_exact_int().ok_or_else(|| {
                EngineError::InvalidInteger(format!("{} evaluates to {}", label, n))
            })?;
        }
        Ok(Ctrl::new(out[0], out[1], out[2]))
    }

    fn ctrl_line(&mut self, exprs: &[Expr], what: &str) -> Result<&'a str> {
        let line = self.read_line(what)?;
        self.check_ctrl(exprs, line)?;
        Ok(line)
    }

    // ========================================================================
    // Scalar slots
    // ========================================================================

    /// Bind decoded values to their slots, retrying slots that still have
    /// several unbound variables.
    fn read_slots(&mut self, slots: &[Slot<'_>]) -> Result<()> {
        let mut solved = vec![false; slots.len()];
        let mut pending: Option<EngineError> = None;
        for pass in 0..self.opts.max_slot_passes.max(1) {
            pending = None;
            for (i, slot) in slots.iter().enumerate() {
                if solved[i] {
                    continue;
                }
                match self.read_slot(slot)? {
                    SlotOutcome::Solved => solved[i] = true,
                    SlotOutcome::Deferred(e) => {
                        trace!(pass, slot = %slot.label, "slot deferred");
                        pending.get_or_insert(e);
                    }
                }
            }
            if pending.is_none() {
                return Ok(());
            }
        }
        match pending {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_slot(&mut self, slot: &Slot<'_>) -> Result<SlotOutcome> {
        let strict = !self.speculative();
        let affine = match evaluate(slot.expr, self.scope, EvalCtx::read_slot(strict)) {
            Ok(a) => a,
            Err(e) if e.is_retryable() => return Ok(SlotOutcome::Deferred(e)),
            Err(e) => return Err(e),
        };
        match (&affine.unbound, affine.value()) {
            (_, Some(expected)) => {
                self.check(&slot.label, slot.expr, expected, slot.field)?;
            }
            (Some(var), None) => {
                let value = expr::solve(&affine, slot.field, strict)?;
                trace!(var = %var, %value, "slot solved");
                self.scope.set(&var.name, &var.indices, Value::Number(value))?;
            }
            (None, None) => {}
        }
        Ok(SlotOutcome::Solved)
    }

    /// Compare a predicted value with a decoded one, demoting tolerated
    /// mismatch classes to warnings.
    fn check(&mut self, label: &str, expr: &Expr, expected: Number, found: Number) -> Result<()> {
        let tol = &self.opts.tolerance;
        let close = is_close(expected, found);
        if expected == found || (tol.fuzzy_matching && close) {
            return Ok(());
        }
        if self.speculative() {
            debug!(slot = label, %expected, %found, "mismatch ignored in lookahead");
            return Ok(());
        }
        let (desired, varspec) = markers(expr);
        let candidates = [
            (MismatchClass::Zero, expected.is_zero(), tol.zero),
            (MismatchClass::Desired, desired, tol.desired),
            (MismatchClass::Varspec, varspec, tol.varspec),
            (MismatchClass::Fuzzy, close, tol.fuzzy),
            (MismatchClass::Exact, true, tol.exact),
        ];
        let mismatch = |class| Mismatch {
            class,
            slot: label.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        };
        if let Some((class, _, _)) = candidates.iter().find(|(_, applies, ok)| *applies && *ok) {
            let m = mismatch(*class);
            warn!("{}", m);
            self.warnings.push(m);
            return Ok(());
        }
        let class = candidates
            .iter()
            .find(|(_, applies, _)| *applies)
            .map_or(MismatchClass::Exact, |(c, _, _)| *c);
        Err(EngineError::ValueMismatch(mismatch(class)))
    }

    fn write_slots(&self, exprs: &[Expr]) -> Result<Vec<Number>> {
        exprs
            .iter()
            .map(|e| evaluate_number(e, self.scope, EvalCtx::write_slot()))
            .collect()
    }

    // ========================================================================
    // Vector slots (KIJ, NBT/INT, X/Y)
    // ========================================================================

    fn indices_of(&self, var: &VarRef) -> Result<Vec<i64>> {
        var.indices.iter().map(|e| evaluate_index(e, self.scope)).collect()
    }

    fn read_vector(&mut self, var: &VarRef, values: Vec<Number>) -> Result<()> {
        let idx = self.indices_of(var)?;
        let existing = match self.scope.get(&var.name, &idx, Lookup::Local)? {
            Some(Binding::Data(v)) => Some(v.clone()),
            Some(_) => {
                return Err(EngineError::SizeMismatch(format!(
                    "{} is not an array variable",
                    var
                )))
            }
            None => None,
        };
        let Some(existing) = existing else {
            return self.scope.set(&var.name, &idx, Value::sequence(values));
        };
        let known = existing
            .as_array()
            .and_then(|a| a.numbers())
            .ok_or_else(|| EngineError::SizeMismatch(format!("{} is not a vector of numbers", var)))?;
        if known.len() != values.len() {
            return Err(EngineError::SizeMismatch(format!(
                "{} has {} elements, record has {}",
                var,
                known.len(),
                values.len()
            )));
        }
        let template = Expr::Var(var.clone());
        for (i, (expected, found)) in known.into_iter().zip(values).enumerate() {
            self.check(&format!("{}[{}]", var, i), &template, expected, found)?;
        }
        Ok(())
    }

    fn write_vector(&self, var: &VarRef) -> Result<Vec<Number>> {
        let idx = self.indices_of(var)?;
        match self.scope.get(&var.name, &idx, Lookup::Local)? {
            Some(Binding::Data(Value::Array(a))) => a
                .numbers()
                .ok_or_else(|| EngineError::NotNumeric(var.to_string())),
            Some(_) => Err(EngineError::SizeMismatch(format!("{} is not an array variable", var))),
            None => Err(expr::missing(&var.name, &idx)),
        }
    }

    /// Run `f` inside the optional named section of a TAB1/TAB2/LIST body.
    fn within<T>(&mut self, section: &Option<VarRef>, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let Some(name) = section else {
            return f(self);
        };
        let idx = self.indices_of(name)?;
        let create = self.reading();
        self.scope.open_section(&name.name, &idx, create)?;
        let out = f(self);
        let closed = self.scope.close_section();
        let out = out?;
        closed?;
        Ok(out)
    }

    // ========================================================================
    // HEAD / CONT / DIR
    // ========================================================================

    fn cont(&mut self, r: &ContRecord, what: &str) -> Result<()> {
        expect_fields(&r.fields, 6, what)?;
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, what)?;
            let values = records::read_cont(line, self.codec)?;
            let slots: Vec<Slot<'_>> = r
                .fields
                .iter()
                .zip(values)
                .zip(CONT_SLOTS)
                .map(|((expr, field), label)| Slot {
                    label: label.to_string(),
                    expr,
                    field,
                })
                .collect();
            self.read_slots(&slots)
        } else {
            let v = self.write_slots(&r.fields)?;
            let fields = [v[0], v[1], v[2], v[3], v[4], v[5]];
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_cont(&fields, self.codec)?;
            self.emit(line, ctrl)
        }
    }

    fn dir(&mut self, r: &DirRecord) -> Result<()> {
        expect_fields(&r.fields, 4, "DIR")?;
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, "DIR")?;
            let values = records::read_dir(line, self.codec)?;
            let slots: Vec<Slot<'_>> = r
                .fields
                .iter()
                .zip(values)
                .zip(&CONT_SLOTS[2..])
                .map(|((expr, field), label)| Slot {
                    label: label.to_string(),
                    expr,
                    field,
                })
                .collect();
            self.read_slots(&slots)
        } else {
            let v = self.write_slots(&r.fields)?;
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_dir(&[v[0], v[1], v[2], v[3]], self.codec)?;
            self.emit(line, ctrl)
        }
    }

    // ========================================================================
    // TEXT
    // ========================================================================

    fn text(&mut self, r: &TextRecord) -> Result<()> {
        let width = self.codec.width();
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, "TEXT")?;
            let chars: Vec<char> = records::read_text(line, width).chars().collect();
            let mut pos = 0usize;
            for field in &r.fields {
                let end = match field.width {
                    Some(w) => pos + w,
                    None => chars.len(),
                };
                if pos >= end {
                    return Err(EngineError::SizeMismatch(format!(
                        "TEXT field {} starts at column {} past the end of the line",
                        field, pos
                    )));
                }
                if let Some(name) = &field.name {
                    let seg: String = chars[pos.min(chars.len())..end.min(chars.len())].iter().collect();
                    let idx = self.indices_of(name)?;
                    self.scope.set(&name.name, &idx, Value::Text(seg))?;
                }
                pos = end;
            }
            Ok(())
        } else {
            let mut text = String::new();
            for field in &r.fields {
                match (&field.name, field.width) {
                    (Some(name), width) => {
                        let idx = self.indices_of(name)?;
                        let s = match self.scope.get(&name.name, &idx, Lookup::Local)? {
                            Some(Binding::Data(Value::Text(s))) => s.clone(),
                            Some(_) => {
                                return Err(EngineError::SizeMismatch(format!(
                                    "{} does not hold text",
                                    name
                                )))
                            }
                            None => return Err(expr::missing(&name.name, &idx)),
                        };
                        if let Some(w) = width {
                            if s.chars().count() != w {
                                return Err(EngineError::SizeMismatch(format!(
                                    "{} has {} characters, field width is {}",
                                    name,
                                    s.chars().count(),
                                    w
                                )));
                            }
                        }
                        text.push_str(&s);
                    }
                    (None, Some(w)) => text.push_str(&" ".repeat(w)),
                    (None, None) => {
                        return Err(EngineError::InvalidRecipe(
                            "TEXT field without name or width".into(),
                        ))
                    }
                }
            }
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_text(&text, width)?;
            self.emit(line, ctrl)
        }
    }

    // ========================================================================
    // INTG
    // ========================================================================

    fn intg(&mut self, r: &IntgRecord) -> Result<()> {
        expect_fields(&r.fields, 3, "INTG")?;
        let kij = match &r.fields[2] {
            Expr::Var(v) => v,
            other => {
                return Err(EngineError::InvalidRecipe(format!(
                    "INTG vector slot must be a variable, got {}",
                    other
                )))
            }
        };
        let ndigit = evaluate_index(&r.ndigit, self.scope)?;
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, "INTG")?;
            let (ii, jj, values) = records::read_intg(line, ndigit)?;
            self.read_slots(&[
                Slot {
                    label: "II".into(),
                    expr: &r.fields[0],
                    field: Number::Int(ii),
                },
                Slot {
                    label: "JJ".into(),
                    expr: &r.fields[1],
                    field: Number::Int(jj),
                },
            ])?;
            self.read_vector(kij, values.into_iter().map(Number::Int).collect())
        } else {
            let v = self.write_slots(&r.fields[..2])?;
            let as_int = |n: Number, what: &str| {
                n.as_exact_int()
                    .ok_or_else(|| EngineError::InvalidInteger(format!("{} evaluates to {}", what, n)))
            };
            let ii = as_int(v[0], "II")?;
            let jj = as_int(v[1], "JJ")?;
            let values = self
                .write_vector(kij)?
                .into_iter()
                .map(|n| as_int(n, "KIJ"))
                .collect::<Result<Vec<_>>>()?;
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_intg(ii, jj, &values, ndigit, self.codec.width())?;
            self.emit(line, ctrl)
        }
    }

    // ========================================================================
    // TAB1 / TAB2
    // ========================================================================

    fn head_slots<'e>(fields: &'e [Expr], values: &[Number; 6], which: &[usize]) -> Vec<Slot<'e>> {
        which
            .iter()
            .map(|&i| Slot {
                label: CONT_SLOTS[i].to_string(),
                expr: &fields[i],
                field: values[i],
            })
            .collect()
    }

    fn tab1(&mut self, r: &Tab1Record) -> Result<()> {
        expect_fields(&r.fields, 6, "TAB1")?;
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, "TAB1")?;
            let head = records::read_cont(line, self.codec)?;
            let nr = count(head[4], "NR")?;
            let np = count(head[5], "NP")?;
            let (nbt, int) = deinterleave(&self.read_body(2 * nr, FieldKind::Int)?);
            let (x, y) = deinterleave(&self.read_body(2 * np, FieldKind::Float)?);
            self.read_slots(&Self::head_slots(&r.fields, &head, &[0, 1, 2, 3]))?;
            if !self.lookahead.proceed(Step::Leaf) {
                return Ok(());
            }
            self.within(&r.table, |m| {
                m.read_vector(&VarRef::new("NBT"), nbt)?;
                m.read_vector(&VarRef::new("INT"), int)?;
                m.read_vector(&r.x, x)?;
                m.read_vector(&r.y, y)
            })
        } else {
            let v = self.write_slots(&r.fields[..4])?;
            let (nbt, int, x, y) = self.within(&r.table, |m| {
                Ok((
                    m.write_vector(&VarRef::new("NBT"))?,
                    m.write_vector(&VarRef::new("INT"))?,
                    m.write_vector(&r.x)?,
                    m.write_vector(&r.y)?,
                ))
            })?;
            if nbt.len() != int.len() || x.len() != y.len() {
                return Err(EngineError::SizeMismatch(format!(
                    "TAB1 columns differ in length: NBT={} INT={} {}={} {}={}",
                    nbt.len(),
                    int.len(),
                    r.x,
                    x.len(),
                    r.y,
                    y.len()
                )));
            }
            let head = [
                v[0],
                v[1],
                v[2],
                v[3],
                Number::Int(nbt.len() as i64),
                Number::Int(x.len() as i64),
            ];
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_cont(&head, self.codec)?;
            self.emit(line, ctrl)?;
            self.emit_body(&interleave(&nbt, &int), FieldKind::Int, ctrl)?;
            self.emit_body(&interleave(&x, &y), FieldKind::Float, ctrl)
        }
    }

    fn tab2(&mut self, r: &Tab2Record) -> Result<()> {
        expect_fields(&r.fields, 6, "TAB2")?;
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, "TAB2")?;
            let head = records::read_cont(line, self.codec)?;
            let nr = count(head[4], "NR")?;
            let (nbt, int) = deinterleave(&self.read_body(2 * nr, FieldKind::Int)?);
            self.read_slots(&Self::head_slots(&r.fields, &head, &[0, 1, 2, 3, 5]))?;
            if !self.lookahead.proceed(Step::Leaf) {
                return Ok(());
            }
            self.within(&r.table, |m| {
                m.read_vector(&VarRef::new("NBT"), nbt)?;
                m.read_vector(&VarRef::new("INT"), int)
            })
        } else {
            let v = self.write_slots(&r.fields)?;
            let (nbt, int) = self.within(&r.table, |m| {
                Ok((
                    m.write_vector(&VarRef::new("NBT"))?,
                    m.write_vector(&VarRef::new("INT"))?,
                ))
            })?;
            if nbt.len() != int.len() {
                return Err(EngineError::SizeMismatch(format!(
                    "TAB2 columns differ in length: NBT={} INT={}",
                    nbt.len(),
                    int.len()
                )));
            }
            let head = [v[0], v[1], v[2], v[3], Number::Int(nbt.len() as i64), v[5]];
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_cont(&head, self.codec)?;
            self.emit(line, ctrl)?;
            self.emit_body(&interleave(&nbt, &int), FieldKind::Int, ctrl)
        }
    }

    // ========================================================================
    // LIST
    // ========================================================================

    fn list(&mut self, r: &ListRecord) -> Result<()> {
        expect_fields(&r.fields, 6, "LIST")?;
        if self.reading() {
            let line = self.ctrl_line(&r.ctrl, "LIST")?;
            let head = records::read_cont(line, self.codec)?;
            let npl = count(head[4], "NPL")?;
            let values = self.read_body(npl, FieldKind::Float)?;
            self.read_slots(&Self::head_slots(&r.fields, &head, &[0, 1, 2, 3, 4, 5]))?;
            if !self.lookahead.proceed(Step::Leaf) {
                return Ok(());
            }
            let mut idx = 0usize;
            self.within(&r.name, |m| m.read_items(&r.body, &values, &mut idx))?;
            if idx < npl {
                return Err(EngineError::UnconsumedListElements {
                    npl,
                    remaining: npl - idx,
                });
            }
            Ok(())
        } else {
            let head = self.write_slots(&r.fields)?;
            let mut values = Vec::new();
            self.within(&r.name, |m| m.write_items(&r.body, &mut values))?;
            let npl = count(head[4], "NPL")?;
            if npl < values.len() {
                return Err(EngineError::UnconsumedListElements {
                    npl,
                    remaining: values.len() - npl,
                });
            }
            if npl > values.len() {
                return Err(EngineError::MoreListElementsExpected(npl));
            }
            let fields = [head[0], head[1], head[2], head[3], head[4], head[5]];
            let ctrl = self.write_ctrl(&r.ctrl)?;
            let line = records::write_cont(&fields, self.codec)?;
            self.emit(line, ctrl)?;
            self.emit_body(&values, FieldKind::Float, ctrl)
        }
    }

    fn read_items(&mut self, items: &[ListItem], values: &[Number], idx: &mut usize) -> Result<()> {
        for item in items {
            match item {
                ListItem::Value(expr) => {
                    let field = *values
                        .get(*idx)
                        .ok_or(EngineError::MoreListElementsExpected(values.len()))?;
                    self.read_slots(&[Slot {
                        label: format!("LIST[{}]", idx),
                        expr,
                        field,
                    }])?;
                    *idx += 1;
                }
                ListItem::PadLine => *idx += (PER_LINE - *idx % PER_LINE) % PER_LINE,
                ListItem::Loop(l) => self.list_loop(l, |m| m.read_items(&l.body, values, idx))?,
            }
        }
        Ok(())
    }

    fn write_items(&mut self, items: &[ListItem], out: &mut Vec<Number>) -> Result<()> {
        for item in items {
            match item {
                ListItem::Value(expr) => {
                    out.push(evaluate_number(expr, self.scope, EvalCtx::write_slot())?);
                }
                ListItem::PadLine => {
                    let n = (PER_LINE - out.len() % PER_LINE) % PER_LINE;
                    out.extend(std::iter::repeat(Number::Float(0.0)).take(n));
                }
                ListItem::Loop(l) => self.list_loop(l, |m| m.write_items(&l.body, out))?,
            }
        }
        Ok(())
    }

    /// Iterate a loop inside a LIST body; the loop variable is removed
    /// afterwards even on error.
    fn list_loop(&mut self, l: &ListLoop, mut f: impl FnMut(&mut Self) -> Result<()>) -> Result<()> {
        let from = evaluate_index(&l.from, self.scope)?;
        let to = evaluate_index(&l.to, self.scope)?;
        if from > to {
            return Ok(());
        }
        self.scope.declare_loop_var(&l.var, from)?;
        let mut res = Ok(());
        for i in from..=to {
            res = self.scope.set_loop_var(&l.var, i).and_then(|_| f(self));
            if res.is_err() {
                break;
            }
        }
        self.scope.remove_loop_var(&l.var);
        res
    }

    // ========================================================================
    // SEND
    // ========================================================================

    fn send(&mut self) -> Result<()> {
        if self.reading() {
            let line = self.read_line("SEND")?;
            records::check_send(line, self.codec).map(|_| ())
        } else {
            let ctrl_var = |name: &str| {
                let n = evaluate_number(&Expr::var(name), self.scope, EvalCtx::control())?;
                n.as_exact_int()
                    .ok_or_else(|| EngineError::InvalidInteger(format!("{} evaluates to {}", name, n)))
            };
            let mat = ctrl_var("MAT")?;
            let mf = ctrl_var("MF")?;
            let line = records::end_line(End::Send, mat, mf, self.codec, self.opts.include_linenum)?;
            match &mut self.io {
                Io::Write { out } => {
                    out.push(line);
                    Ok(())
                }
                Io::Read { .. } => Err(EngineError::InvalidRecipe("line written while decoding".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorClass;
    use crate::core::types::parse_yaml;
    use crate::core::value::ArrayMode;
    use crate::format::records::write_cont;
    use crate::format::FortranCodec;
    use proptest::prelude::*;

    fn node(yaml: &str) -> Node {
        parse_yaml(yaml).unwrap()
    }

    fn ctrl_root(mat: i64, mf: i64, mt: i64) -> Scope {
        let mut scope = Scope::new(ArrayMode::Sparse);
        for (k, v) in [("MAT", mat), ("MF", mf), ("MT", mt)] {
            scope.set(k, &[], Value::Number(Number::Int(v))).unwrap();
        }
        scope
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(|l| l.to_string()).collect()
    }

    struct Harness {
        scope: Scope,
        lookahead: Lookahead,
        opts: Options,
        codec: FortranCodec,
        warnings: Vec<Mismatch>,
    }

    impl Harness {
        fn new() -> Harness {
            let opts = Options::default();
            Harness {
                scope: ctrl_root(125, 3, 1),
                lookahead: Lookahead::new(),
                codec: FortranCodec::new(opts.format.clone()),
                opts,
                warnings: Vec::new(),
            }
        }

        fn read(&mut self, node: &Node, input: &[String]) -> Result<usize> {
            let mut ofs = 0;
            RecordMapper {
                scope: &mut self.scope,
                lookahead: &mut self.lookahead,
                io: Io::Read {
                    lines: input,
                    ofs: &mut ofs,
                },
                opts: &self.opts,
                codec: &self.codec,
                warnings: &mut self.warnings,
            }
            .map(node)?;
            Ok(ofs)
        }

        fn write(&mut self, node: &Node) -> Result<Vec<String>> {
            let mut out = Vec::new();
            RecordMapper {
                scope: &mut self.scope,
                lookahead: &mut self.lookahead,
                io: Io::Write { out: &mut out },
                opts: &self.opts,
                codec: &self.codec,
                warnings: &mut self.warnings,
            }
            .map(node)?;
            Ok(out)
        }

        fn num(&self, name: &str) -> Number {
            match self.scope.get(name, &[], Lookup::Chain).unwrap() {
                Some(Binding::Data(Value::Number(n))) => *n,
                other => panic!("{} not a number: {:?}", name, other),
            }
        }
    }

    const HEAD_LINE: &str = " 1.001000+3 9.991673-1          0          0          2          0 125 3  1";

    #[test]
    fn test_er011_head_binds_slots() {
        let mut h = Harness::new();
        let head = node("head: {fields: [ZA, AWR, 0, 0, NK, 0]}");
        let used = h.read(&head, &lines(HEAD_LINE)).unwrap();
        assert_eq!(used, 1);
        assert_eq!(h.num("ZA"), Number::Float(1001.0));
        assert_eq!(h.num("NK"), Number::Int(2));
        assert!(h.warnings.is_empty());
    }

    #[test]
    fn test_er011_head_write_matches_read() {
        let mut h = Harness::new();
        let head = node("head: {fields: [ZA, AWR, 0, 0, NK, 0]}");
        h.read(&head, &lines(HEAD_LINE)).unwrap();
        let out = h.write(&head).unwrap();
        assert_eq!(out, lines(HEAD_LINE));
    }

    #[test]
    fn test_er011_deferred_slot_resolves_on_later_pass() {
        // N1 needs NK, which is only bound by N2 to its right.
        let mut h = Harness::new();
        let cont = node("cont: {fields: [0, 0, 0, 0, NK+M, NK]}");
        let line = " 0.000000+0 0.000000+0          0          0          5          2 125 3  1";
        h.read(&cont, &lines(line)).unwrap();
        assert_eq!(h.num("NK"), Number::Int(2));
        assert_eq!(h.num("M"), Number::Int(3));
    }

    #[test]
    fn test_er011_several_unbound_after_passes() {
        let mut h = Harness::new();
        let cont = node("cont: {fields: [0, 0, 0, 0, A+B, 0]}");
        let line = " 0.000000+0 0.000000+0          0          0          5          0 125 3  1";
        let err = h.read(&cont, &lines(line)).unwrap_err();
        assert!(matches!(err, EngineError::SeveralUnboundVariables(_)));
    }

    #[test]
    fn test_er011_zero_mismatch_is_warning() {
        let mut h = Harness::new();
        let cont = node("cont: {fields: [0, 0, 0, 0, 0, 0]}");
        let line = " 0.000000+0 0.000000+0          0          7          0          0 125 3  1";
        h.read(&cont, &lines(line)).unwrap();
        assert_eq!(h.warnings.len(), 1);
        assert_eq!(h.warnings[0].class, MismatchClass::Zero);
        assert_eq!(h.warnings[0].slot, "L2");
    }

    #[test]
    fn test_er011_exact_mismatch_is_error() {
        let mut h = Harness::new();
        h.scope.set("LTT", &[], Value::Number(Number::Int(1))).unwrap();
        let cont = node("cont: {fields: [0, 0, 0, LTT, 0, 0]}");
        let line = " 0.000000+0 0.000000+0          0          2          0          0 125 3  1";
        let err = h.read(&cont, &lines(line)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ValueMismatch);
        match err {
            EngineError::ValueMismatch(m) => {
                assert_eq!(m.class, MismatchClass::Exact);
                assert_eq!(m.expected, "1");
                assert_eq!(m.found, "2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_er011_varspec_mismatch_tolerated() {
        let mut h = Harness::new();
        h.scope.set("LTT", &[], Value::Number(Number::Int(1))).unwrap();
        let cont = node("cont: {fields: [0, 0, 0, LTT?, 0, 0]}");
        let line = " 0.000000+0 0.000000+0          0          2          0          0 125 3  1";
        h.read(&cont, &lines(line)).unwrap();
        assert_eq!(h.warnings[0].class, MismatchClass::Varspec);
    }

    #[test]
    fn test_er011_fuzzy_matching_accepts_close_floats() {
        let mut h = Harness::new();
        h.opts.tolerance.fuzzy_matching = true;
        h.scope.set("AWR", &[], Value::Number(Number::Float(0.99916735))).unwrap();
        let cont = node("cont: {fields: [0, AWR, 0, 0, 0, 0]}");
        let line = " 0.000000+0 9.991673-1          0          0          0          0 125 3  1";
        h.read(&cont, &lines(line)).unwrap();
        assert!(h.warnings.is_empty());
    }

    #[test]
    fn test_er011_mismatch_ignored_in_lookahead() {
        let mut h = Harness::new();
        h.scope.set("LTT", &[], Value::Number(Number::Int(1))).unwrap();
        let mut state = crate::core::overlay::Overlay::new(0u8);
        h.lookahead.enter(5, &mut state).unwrap();
        let cont = node("cont: {fields: [0, 0, 0, LTT, 0, 0]}");
        let line = " 0.000000+0 0.000000+0          0          2          0          0 125 3  1";
        h.read(&cont, &lines(line)).unwrap();
        assert!(h.warnings.is_empty());
    }

    #[test]
    fn test_er011_control_record_mismatch() {
        let mut h = Harness::new();
        let head = node("head: {fields: [ZA, AWR, 0, 0, NK, 0]}");
        let line = " 1.001000+3 9.991673-1          0          0          2          0 125 4  1";
        let err = h.read(&head, &lines(line)).unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedControlRecord(_)));
    }

    #[test]
    fn test_er011_tab1_read_write() {
        let input = lines(
            " 0.000000+0 0.000000+0          0          0          1          3 125 3  1\n\
             \x20         3          2                                             125 3  1\n\
             \x201.000000-5 2.000000+1 1.000000+0 1.500000+1 2.000000+7 1.000000-1 125 3  1",
        );
        let tab1 = node("tab1: {fields: [QM, QI, 0, LR, NR, NP], table: xs, x: E, y: sig}");
        let mut h = Harness::new();
        assert_eq!(h.read(&tab1, &input).unwrap(), 3);
        assert_eq!(h.num("QM"), Number::Float(0.0));
        h.scope.open_section("xs", &[], false).unwrap();
        match h.scope.get("E", &[], Lookup::Local).unwrap() {
            Some(Binding::Data(Value::Array(a))) => {
                assert_eq!(a.numbers().unwrap()[2], Number::Float(2.0e7));
            }
            other => panic!("unexpected {:?}", other),
        }
        h.scope.close_section().unwrap();
        assert_eq!(h.write(&tab1).unwrap(), input);
    }

    #[test]
    fn test_er011_list_with_loop_and_padline() {
        let input = lines(
            " 0.000000+0 0.000000+0          0          0          8          2 125 3  1\n\
             \x201.000000+0 2.000000+0 3.000000+0 4.000000+0 0.000000+0 0.000000+0 125 3  1\n\
             \x205.000000+0 6.000000+0                                             125 3  1",
        );
        let list = node(
            "list:\n  fields: [0, 0, 0, 0, NPL, N]\n  body:\n    - loop: {var: i, from: 1, to: N, body: [\"A[i]\", \"B[i]\"]}\n    - PADLINE\n    - C\n    - D\n",
        );
        let mut h = Harness::new();
        h.read(&list, &input).unwrap();
        assert_eq!(h.num("C"), Number::Float(5.0));
        assert!(h.scope.loop_var("i").is_none());
        assert_eq!(h.write(&list).unwrap(), input);
    }

    #[test]
    fn test_er011_list_unconsumed_and_exhausted() {
        let input = lines(
            " 0.000000+0 0.000000+0          0          0          3          0 125 3  1\n\
             \x201.000000+0 2.000000+0 3.000000+0                                  125 3  1",
        );
        let short = node("list: {fields: [0, 0, 0, 0, NPL, 0], body: [A, B]}");
        let err = Harness::new().read(&short, &input).unwrap_err();
        assert!(matches!(err, EngineError::UnconsumedListElements { npl: 3, remaining: 1 }));
        let long = node("list: {fields: [0, 0, 0, 0, NPL, 0], body: [A, B, C, D]}");
        let err = Harness::new().read(&long, &input).unwrap_err();
        assert!(matches!(err, EngineError::MoreListElementsExpected(3)));
    }

    #[test]
    fn test_er011_list_write_count_mismatch() {
        let mut h = Harness::new();
        for (k, v) in [("NPL", 1), ("A", 1), ("B", 2)] {
            h.scope.set(k, &[], Value::Number(Number::Int(v))).unwrap();
        }
        let list = node("list: {fields: [0, 0, 0, 0, NPL, 0], body: [A, B]}");
        assert!(matches!(
            h.write(&list),
            Err(EngineError::UnconsumedListElements { npl: 1, remaining: 1 })
        ));
    }

    #[test]
    fn test_er011_text_fields() {
        let line = format!(
            "{:<11}{:<11}{:<10} {:<33} 125 3  1",
            " 1-H -  1", "LANL", "EVAL-JUL16", "G.HALE"
        );
        let text = node("text: {fields: [\"ZSYMAM{11}\", \"ALAB{11}\", \"EDATE{10}\", \"{1}\", AUTH]}");
        let mut h = Harness::new();
        h.read(&text, &[line]).unwrap();
        match h.scope.get("ALAB", &[], Lookup::Local).unwrap() {
            Some(Binding::Data(Value::Text(s))) => assert_eq!(s, "LANL       "),
            other => panic!("unexpected {:?}", other),
        }
        match h.scope.get("AUTH", &[], Lookup::Local).unwrap() {
            Some(Binding::Data(Value::Text(s))) => assert_eq!(s.trim_end(), "G.HALE"),
            other => panic!("unexpected {:?}", other),
        }
        let out = h.write(&node("text: {ctrl: [125, 1, 451], fields: [\"ZSYMAM{11}\", \"ALAB{11}\"]}"));
        let out = out.unwrap();
        assert_eq!(out[0].len(), 75);
        assert!(out[0].ends_with(" 125 1451"));
    }

    #[test]
    fn test_er011_text_write_width_mismatch() {
        let mut h = Harness::new();
        h.scope.set("HSUB", &[], Value::Text("short".into())).unwrap();
        let text = node("text: {fields: [\"HSUB{11}\"]}");
        assert!(matches!(h.write(&text), Err(EngineError::SizeMismatch(_))));
    }

    #[test]
    fn test_er011_intg_read_write() {
        let mut kij = vec![0i64; 18];
        kij[0] = -3;
        kij[1] = 4;
        let line = records::write_intg(2, 1, &kij, 2, 11).unwrap() + " 125 3  1";
        let intg = node("intg: {fields: [II, JJ, \"KIJ[II]\"], ndigit: 2}");
        let mut h = Harness::new();
        h.read(&intg, &[line.clone()]).unwrap();
        assert_eq!(h.num("II"), Number::Int(2));
        match h.scope.get("KIJ", &[2], Lookup::Local).unwrap() {
            Some(Binding::Data(Value::Array(a))) => {
                assert_eq!(a.numbers().unwrap()[..2], [Number::Int(-3), Number::Int(4)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.write(&intg).unwrap(), vec![line]);
    }

    #[test]
    fn test_er011_send_read_and_write() {
        let mut h = Harness::new();
        let send = " 0.000000+0 0.000000+0          0          0          0          0 125 3  099999";
        h.read(&Node::Send, &lines(send)).unwrap();
        assert_eq!(h.write(&Node::Send).unwrap(), lines(send));
        let bad = " 0.000000+0 0.000000+0          0          0          1          0 125 3  0";
        assert!(matches!(
            h.read(&Node::Send, &lines(bad)),
            Err(EngineError::NotSectionEnd(_))
        ));
    }

    #[test]
    fn test_er011_stop_record() {
        let mut h = Harness::new();
        let err = h.read(&node("stop: {}"), &[]).unwrap_err();
        assert!(matches!(err, EngineError::Stop(ref m) if m == "stop instruction"));
    }

    #[test]
    fn test_er011_unexpected_end_of_input() {
        let mut h = Harness::new();
        let head = node("head: {fields: [ZA, AWR, 0, 0, NK, 0]}");
        assert!(matches!(h.read(&head, &[]), Err(EngineError::UnexpectedEndOfInput(_))));
    }

    proptest! {
        #[test]
        fn prop_er011_slot_order_does_not_change_bindings(
            nk in 0i64..500,
            m in 0i64..500,
            order in Just(vec!["NK+M", "NK", "2*M", "0"]).prop_shuffle(),
        ) {
            let value = |slot: &str| match slot {
                "NK+M" => nk + m,
                "NK" => nk,
                "2*M" => 2 * m,
                _ => 0,
            };
            let mut fields = [Number::Float(0.0), Number::Float(0.0), Number::Int(0), Number::Int(0), Number::Int(0), Number::Int(0)];
            for (i, slot) in order.iter().enumerate() {
                fields[i + 2] = Number::Int(value(slot));
            }
            let mut h = Harness::new();
            let line = format!("{} 125 3  1", write_cont(&fields, &h.codec).unwrap());
            let cont = node(&format!("cont: {{fields: [0, 0, {}]}}", order.join(", ")));
            h.read(&cont, &[line.clone()]).unwrap();
            prop_assert_eq!(h.num("NK"), Number::Int(nk));
            prop_assert_eq!(h.num("M"), Number::Int(m));
            prop_assert!(h.warnings.is_empty());
            prop_assert_eq!(h.write(&cont).unwrap(), vec![line]);
        }
    }
}
