//! ER-006: Variable scope: a stack of section frames plus loop variables.
//!
//! Each open section is a [`Frame`] owning the section's record while it is
//! being filled. Opening a section moves its record out of the parent (a
//! placeholder stays behind) and closing moves it back, so parent and child
//! are never borrowed at the same time. Lookup walks frames from the
//! innermost outward and never inward.
//!
//! Abbreviations and index-shift calibrations are side tables of the frame
//! and are dropped with it; they never appear in the decoded data.
//!
//! While encoding, the scope can track which array elements the recipe
//! reads, so that elements no record wrote are reported instead of being
//! dropped silently.

use super::error::{EngineError, Result};
use super::types::Expr;
use super::value::{Array, ArrayMode, Record, Value};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// How far a variable lookup may walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Current section only (slot variables).
    Local,
    /// Current section, then enclosing sections outward.
    Chain,
}

/// What a name resolved to.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'s> {
    Loop(i64),
    Abbrev(&'s Expr),
    Data(&'s Value),
}

/// Start-index calibration, one level per array dimension. The start of a
/// dimension is calibrated per position of the enclosing dimensions.
#[derive(Debug, Clone, Default)]
struct ShiftNode {
    start: Option<i64>,
    children: BTreeMap<i64, ShiftNode>,
}

impl ShiftNode {
    fn shift(&mut self, indices: &[i64]) -> Vec<i64> {
        let mut node = self;
        let mut out = Vec::with_capacity(indices.len());
        for &idx in indices {
            let start = *node.start.get_or_insert(idx);
            out.push(idx - start);
            node = node.children.entry(idx).or_default();
        }
        out
    }

    /// Calibration node of the level below `indices`.
    fn below(&mut self, indices: &[i64]) -> &mut ShiftNode {
        let mut node = self;
        for &idx in indices {
            node = node.children.entry(idx).or_default();
        }
        node
    }
}

/// Array elements read while encoding supplied data.
#[derive(Debug, Clone, Default)]
struct Retrieval {
    /// (array path, storage key)
    elements: FxHashSet<(String, i64)>,
    /// Arrays read as a whole.
    whole: FxHashSet<String>,
}

impl Retrieval {
    /// Every array with at least one element read must have had all of
    /// them read.
    fn verify(&self, path: &str, value: &Value) -> Result<()> {
        if self.whole.contains(path) {
            return Ok(());
        }
        match value {
            Value::Record(rec) => {
                for (name, v) in rec {
                    self.verify(&format!("{}/{}", path, name), v)?;
                }
            }
            Value::Array(array) => {
                let seen = |key: i64| self.elements.contains(&(path.to_string(), key));
                let touched = array.entries().any(|(key, _)| seen(key));
                for (key, v) in array.entries() {
                    if touched && !seen(key) {
                        return Err(EngineError::UnwrittenElement(format!("{}/{}", path, key)));
                    }
                    self.verify(&format!("{}/{}", path, key), v)?;
                }
            }
            Value::Number(_) | Value::Text(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Frame {
    /// Key of the section in the parent record (empty for the root).
    key: String,
    /// Storage keys below `key` for arrays of sections.
    slots: Vec<i64>,
    /// Indices as written in the recipe, for paths.
    indices: Vec<i64>,
    /// Storage path from the root (`/sub/2`), for retrieval tracking.
    path: String,
    data: Record,
    abbrevs: IndexMap<String, Expr>,
    shifts: RefCell<FxHashMap<String, ShiftNode>>,
}

impl Frame {
    fn new(key: &str, slots: Vec<i64>, indices: Vec<i64>, path: String, data: Record) -> Frame {
        Frame {
            key: key.to_string(),
            slots,
            indices,
            path,
            data,
            abbrevs: IndexMap::new(),
            shifts: RefCell::new(FxHashMap::default()),
        }
    }

    fn label(&self) -> String {
        if self.indices.is_empty() {
            self.key.clone()
        } else {
            let idx: Vec<String> = self.indices.iter().map(|i| i.to_string()).collect();
            format!("{}[{}]", self.key, idx.join(","))
        }
    }

    /// Storage keys for `indices` of array `name` living in this frame.
    /// Dense levels use calibrated positions, sparse levels raw indices.
    fn storage_keys(&self, name: &str, indices: &[i64]) -> Vec<i64> {
        let mut shifts = self.shifts.borrow_mut();
        shifts.entry(name.to_string()).or_default().shift(indices)
    }

    /// Vectors stored whole by a record are indexed from 1.
    fn calibrate_vector(&self, name: &str, indices: &[i64]) {
        let mut shifts = self.shifts.borrow_mut();
        let node = shifts.entry(name.to_string()).or_default().below(indices);
        node.start.get_or_insert(1);
    }
}

fn key_for(array: &Array, raw: i64, shifted: i64) -> i64 {
    if array.is_dense() {
        shifted
    } else {
        raw
    }
}

fn fmt_indices(indices: &[i64]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Nested variable scope used while executing one section recipe.
#[derive(Debug, Clone)]
pub struct Scope {
    frames: Vec<Frame>,
    loop_vars: IndexMap<String, i64>,
    mode: ArrayMode,
    /// Data was supplied up front: reads calibrate dense index shifts.
    supplied: bool,
    retrieval: Option<RefCell<Retrieval>>,
}

impl Scope {
    pub fn new(mode: ArrayMode) -> Scope {
        Scope::with_root(Record::new(), mode)
    }

    /// Start from preloaded control values (decoding).
    pub fn with_root(root: Record, mode: ArrayMode) -> Scope {
        Scope {
            frames: vec![Frame::new("", Vec::new(), Vec::new(), String::new(), root)],
            loop_vars: IndexMap::new(),
            mode,
            supplied: false,
            retrieval: None,
        }
    }

    /// Start from the data to encode. With `track` set, reads of array
    /// elements are recorded for [`Scope::verify_retrieval`].
    pub fn supplied(root: Record, mode: ArrayMode, track: bool) -> Scope {
        Scope {
            supplied: true,
            retrieval: track.then(|| RefCell::new(Retrieval::default())),
            ..Scope::with_root(root, mode)
        }
    }

    /// Fail on the first supplied array element that was never read.
    pub fn verify_retrieval(&self) -> Result<()> {
        let Some(seen) = &self.retrieval else {
            return Ok(());
        };
        let seen = seen.borrow();
        for frame in &self.frames {
            for (name, value) in &frame.data {
                seen.verify(&format!("{}/{}", frame.path, name), value)?;
            }
        }
        Ok(())
    }

    fn touch(&self, base: &str, name: &str, keys: &[i64], whole: bool) {
        let Some(seen) = &self.retrieval else {
            return;
        };
        let mut seen = seen.borrow_mut();
        let mut path = format!("{}/{}", base, name);
        for &key in keys {
            seen.elements.insert((path.clone(), key));
            path = format!("{}/{}", path, key);
        }
        if whole {
            seen.whole.insert(path);
        }
    }

    /// Labels of the open sections, outermost first.
    pub fn path(&self) -> Vec<String> {
        self.frames.iter().skip(1).map(Frame::label).collect()
    }

    fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    // ------------------------------------------------------------------
    // Sections
    // ------------------------------------------------------------------

    /// Enter section `name[indices]`. Missing sections are created when
    /// `create` is set, otherwise `MissingSection` is raised.
    pub fn open_section(&mut self, name: &str, indices: &[i64], create: bool) -> Result<()> {
        let mode = self.mode;
        let label = if indices.is_empty() {
            name.to_string()
        } else {
            format!("{}[{}]", name, fmt_indices(indices))
        };
        if self.loop_vars.contains_key(name) {
            return Err(EngineError::LoopVariable(format!(
                "section {} shadows a loop variable",
                name
            )));
        }
        let shifted = self.top().storage_keys(name, indices);
        let parent_path = self.top().path.clone();
        let parent = self.top_mut();

        if !parent.data.contains_key(name) {
            if !create {
                return Err(EngineError::MissingSection(label));
            }
            let fresh = if indices.is_empty() {
                Value::Record(Record::new())
            } else {
                Value::Array(Array::new(mode))
            };
            parent.data.insert(name.to_string(), fresh);
        }

        let mut slots = Vec::with_capacity(indices.len());
        let mut cursor = parent
            .data
            .get_mut(name)
            .ok_or_else(|| EngineError::MissingSection(label.clone()))?;
        for (level, (&raw, &shift)) in indices.iter().zip(shifted.iter()).enumerate() {
            let last = level + 1 == indices.len();
            let array = match cursor {
                Value::Array(a) => a,
                other => {
                    return Err(EngineError::SizeMismatch(format!(
                        "section {} expected an array, found {}",
                        label,
                        other.kind()
                    )))
                }
            };
            let key = key_for(array, raw, shift);
            slots.push(key);
            let next = if create {
                array.get_or_insert_with(key, || {
                    if last {
                        Value::Record(Record::new())
                    } else {
                        Value::Array(Array::new(mode))
                    }
                })
            } else {
                array.get_mut(key)
            };
            cursor = next.ok_or_else(|| EngineError::MissingSection(label.clone()))?;
        }

        let data = match cursor {
            Value::Record(r) => std::mem::take(r),
            other => {
                return Err(EngineError::MissingSection(format!(
                    "{} holds a {}, not a section",
                    label,
                    other.kind()
                )))
            }
        };
        self.touch(&parent_path, name, &slots, false);
        let path = slots
            .iter()
            .fold(format!("{}/{}", parent_path, name), |p, k| format!("{}/{}", p, k));
        self.frames
            .push(Frame::new(name, slots, indices.to_vec(), path, data));
        Ok(())
    }

    /// Leave the innermost section and store its record in the parent.
    pub fn close_section(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(EngineError::InconsistentSections(
                "close_section at the root scope".into(),
            ));
        }
        let frame = self.frames.pop().ok_or_else(|| {
            EngineError::InconsistentSections("no open section".into())
        })?;
        let label = frame.label();
        let parent = self.top_mut();
        let mut cursor = parent
            .data
            .get_mut(&frame.key)
            .ok_or_else(|| EngineError::InconsistentSections(label.clone()))?;
        for key in &frame.slots {
            cursor = match cursor {
                Value::Array(a) => a.get_mut(*key),
                _ => None,
            }
            .ok_or_else(|| EngineError::InconsistentSections(label.clone()))?;
        }
        *cursor = Value::Record(frame.data);
        Ok(())
    }

    /// Close all sections and return the root record.
    pub fn into_root(mut self) -> Result<Record> {
        while self.frames.len() > 1 {
            self.close_section()?;
        }
        let root = self
            .frames
            .pop()
            .ok_or_else(|| EngineError::InconsistentSections("empty scope".into()))?;
        Ok(root.data)
    }

    // ------------------------------------------------------------------
    // Loop variables
    // ------------------------------------------------------------------

    pub fn declare_loop_var(&mut self, name: &str, value: i64) -> Result<()> {
        if self.loop_vars.contains_key(name) {
            return Err(EngineError::LoopVariable(format!(
                "{} is already an active loop variable",
                name
            )));
        }
        if self.top().data.contains_key(name) || self.top().abbrevs.contains_key(name) {
            return Err(EngineError::LoopVariable(format!(
                "{} is both a loop variable and a record variable",
                name
            )));
        }
        self.loop_vars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_loop_var(&mut self, name: &str, value: i64) -> Result<()> {
        match self.loop_vars.get_mut(name) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => Err(EngineError::LoopVariable(format!(
                "{} is not an active loop variable",
                name
            ))),
        }
    }

    pub fn remove_loop_var(&mut self, name: &str) {
        self.loop_vars.shift_remove(name);
    }

    pub fn loop_var(&self, name: &str) -> Option<i64> {
        self.loop_vars.get(name).copied()
    }

    // ------------------------------------------------------------------
    // Abbreviations
    // ------------------------------------------------------------------

    pub fn register_abbreviation(&mut self, name: &str, expr: Expr) -> Result<()> {
        if self.loop_vars.contains_key(name) || self.top().data.contains_key(name) {
            return Err(EngineError::AbbreviationCollision(name.to_string()));
        }
        self.top_mut().abbrevs.insert(name.to_string(), expr);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Resolve `name[indices]`. `Ok(None)` means the variable (or the
    /// element) does not exist.
    pub fn get(&self, name: &str, indices: &[i64], lookup: Lookup) -> Result<Option<Binding<'_>>> {
        let top = self.top();
        if let Some(v) = self.loop_vars.get(name) {
            if top.data.contains_key(name) {
                return Err(EngineError::LoopVariable(format!(
                    "{} is both a loop variable and a record variable",
                    name
                )));
            }
            if !indices.is_empty() {
                return Err(EngineError::InvalidRecipe(format!(
                    "loop variable {} cannot be indexed",
                    name
                )));
            }
            return Ok(Some(Binding::Loop(*v)));
        }

        let frames: Box<dyn Iterator<Item = &Frame> + '_> = match lookup {
            Lookup::Local => Box::new(std::iter::once(top)),
            Lookup::Chain => Box::new(self.frames.iter().rev()),
        };
        for frame in frames {
            if let Some(expr) = frame.abbrevs.get(name) {
                if !indices.is_empty() {
                    return Err(EngineError::InvalidRecipe(format!(
                        "abbreviation {} cannot be indexed",
                        name
                    )));
                }
                return Ok(Some(Binding::Abbrev(expr)));
            }
            if let Some(value) = frame.data.get(name) {
                if indices.is_empty() {
                    if matches!(value, Value::Array(_)) {
                        self.touch(&frame.path, name, &[], true);
                    }
                    return Ok(Some(Binding::Data(value)));
                }
                return self.element(frame, name, value, indices).map(|v| v.map(Binding::Data));
            }
        }
        Ok(None)
    }

    /// Element lookup. Decoded arrays are calibrated when written, so a
    /// read only calibrates a dense level of supplied data.
    fn element<'f>(
        &self,
        frame: &Frame,
        name: &str,
        value: &'f Value,
        indices: &[i64],
    ) -> Result<Option<&'f Value>> {
        let mut keys = Vec::with_capacity(indices.len());
        let mut cursor = value;
        {
            let mut shifts = frame.shifts.borrow_mut();
            let mut node = shifts.entry(name.to_string()).or_default();
            for &raw in indices {
                let array = match cursor {
                    Value::Array(a) => a,
                    other => {
                        return Err(EngineError::SizeMismatch(format!(
                            "{} has fewer than {} dimensions (found {})",
                            name,
                            indices.len(),
                            other.kind()
                        )))
                    }
                };
                let key = if array.is_dense() {
                    match node.start {
                        Some(start) => raw - start,
                        None if self.supplied => {
                            node.start = Some(raw);
                            0
                        }
                        None => return Ok(None),
                    }
                } else {
                    raw
                };
                match array.get(key) {
                    Some(next) => cursor = next,
                    None => return Ok(None),
                }
                keys.push(key);
                node = node.children.entry(raw).or_default();
            }
        }
        self.touch(&frame.path, name, &keys, matches!(cursor, Value::Array(_)));
        Ok(Some(cursor))
    }

    /// Store `value` under `name[indices]` in the current section,
    /// creating intermediate array levels.
    pub fn set(&mut self, name: &str, indices: &[i64], value: Value) -> Result<()> {
        if self.loop_vars.contains_key(name) {
            return Err(EngineError::LoopVariable(format!(
                "{} is both a loop variable and a record variable",
                name
            )));
        }
        if self.top().abbrevs.contains_key(name) {
            return Err(EngineError::AbbreviationCollision(name.to_string()));
        }
        let mode = self.mode;
        if matches!(value, Value::Array(Array::Dense(_))) {
            self.top().calibrate_vector(name, indices);
        }
        if indices.is_empty() {
            self.top_mut().data.insert(name.to_string(), value);
            return Ok(());
        }

        let shifted = self.top().storage_keys(name, indices);
        let unavailable = || EngineError::UnavailableIndex {
            name: name.to_string(),
            index: fmt_indices(indices),
        };
        let frame = self.top_mut();
        let mut cursor = frame
            .data
            .entry(name.to_string())
            .or_insert_with(|| Value::Array(Array::new(mode)));
        let levels = indices.len();
        for (level, (&raw, &shift)) in indices.iter().zip(shifted.iter()).enumerate() {
            let array = match cursor {
                Value::Array(a) => a,
                other => {
                    return Err(EngineError::SizeMismatch(format!(
                        "{} holds a {}, cannot index it",
                        name,
                        other.kind()
                    )))
                }
            };
            let key = key_for(array, raw, shift);
            if level + 1 == levels {
                return if array.set(key, value) {
                    Ok(())
                } else {
                    Err(unavailable())
                };
            }
            cursor = array
                .get_or_insert_with(key, || Value::Array(Array::new(mode)))
                .ok_or_else(unavailable)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Number;

    fn int(v: i64) -> Value {
        Value::Number(Number::Int(v))
    }

    fn data<'a>(scope: &'a Scope, name: &str, idx: &[i64], lookup: Lookup) -> Option<&'a Value> {
        match scope.get(name, idx, lookup).unwrap() {
            Some(Binding::Data(v)) => Some(v),
            _ => None,
        }
    }

    #[test]
    fn test_er006_set_get_scalar() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.set("ZA", &[], int(1001)).unwrap();
        assert_eq!(data(&scope, "ZA", &[], Lookup::Local), Some(&int(1001)));
        assert!(scope.get("AWR", &[], Lookup::Chain).unwrap().is_none());
    }

    #[test]
    fn test_er006_section_lookup_walks_outward_only() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.set("NK", &[], int(2)).unwrap();
        scope.open_section("sub", &[], true).unwrap();
        scope.set("LAW", &[], int(1)).unwrap();
        assert!(data(&scope, "NK", &[], Lookup::Local).is_none());
        assert_eq!(data(&scope, "NK", &[], Lookup::Chain), Some(&int(2)));
        scope.close_section().unwrap();
        assert!(scope.get("LAW", &[], Lookup::Chain).unwrap().is_none());
        let root = scope.into_root().unwrap();
        assert_eq!(root["sub"].as_record().unwrap()["LAW"], int(1));
    }

    #[test]
    fn test_er006_array_of_sections() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        for k in 1..=2 {
            scope.open_section("subsection", &[k], true).unwrap();
            scope.set("ZAP", &[], int(k * 10)).unwrap();
            assert_eq!(scope.path(), vec![format!("subsection[{}]", k)]);
            scope.close_section().unwrap();
        }
        let root = scope.into_root().unwrap();
        let arr = root["subsection"].as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.get(2).unwrap().as_record().unwrap()["ZAP"], int(20));
    }

    #[test]
    fn test_er006_missing_section_when_not_creating() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        let err = scope.open_section("table", &[], false).unwrap_err();
        assert!(matches!(err, EngineError::MissingSection(_)));
    }

    #[test]
    fn test_er006_close_root_is_error() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        assert!(matches!(
            scope.close_section(),
            Err(EngineError::InconsistentSections(_))
        ));
    }

    #[test]
    fn test_er006_dense_shift_calibrated_once() {
        let mut scope = Scope::new(ArrayMode::Dense);
        for i in 1..=3 {
            scope.set("E", &[i], int(i * 100)).unwrap();
        }
        assert_eq!(data(&scope, "E", &[1], Lookup::Local), Some(&int(100)));
        assert_eq!(data(&scope, "E", &[3], Lookup::Local), Some(&int(300)));
        assert!(data(&scope, "E", &[4], Lookup::Local).is_none());
        let err = scope.set("E", &[7], int(0)).unwrap_err();
        assert!(matches!(err, EngineError::UnavailableIndex { .. }));
    }

    #[test]
    fn test_er006_dense_per_row_calibration() {
        let mut scope = Scope::new(ArrayMode::Dense);
        scope.set("X", &[1, 5], int(15)).unwrap();
        scope.set("X", &[1, 6], int(16)).unwrap();
        scope.set("X", &[2, 3], int(23)).unwrap();
        assert_eq!(data(&scope, "X", &[2, 3], Lookup::Local), Some(&int(23)));
        let root = scope.into_root().unwrap();
        let rows = root["X"].as_array().unwrap();
        assert_eq!(rows.get(1).unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_er006_read_before_write_keeps_calibration_open() {
        let mut scope = Scope::new(ArrayMode::Dense);
        scope.set("X", &[1, 1], int(11)).unwrap();
        // row 2 does not exist yet; looking at X[2,4] must not pin its start
        assert!(data(&scope, "X", &[2, 4], Lookup::Local).is_none());
        scope.set("X", &[2, 2], int(22)).unwrap();
        scope.set("X", &[2, 3], int(23)).unwrap();
        assert_eq!(data(&scope, "X", &[2, 3], Lookup::Local), Some(&int(23)));
        assert!(data(&scope, "X", &[2, 4], Lookup::Local).is_none());
    }

    #[test]
    fn test_er006_stored_vectors_count_from_one() {
        let mut scope = Scope::new(ArrayMode::Dense);
        let seq = Value::sequence(vec![Number::Int(10), Number::Int(20), Number::Int(30)]);
        scope.set("E", &[], seq).unwrap();
        assert_eq!(data(&scope, "E", &[3], Lookup::Local), Some(&int(30)));
        assert_eq!(data(&scope, "E", &[1], Lookup::Local), Some(&int(10)));
        assert!(data(&scope, "E", &[0], Lookup::Local).is_none());
    }

    #[test]
    fn test_er006_supplied_data_calibrates_on_first_read() {
        let mut root = Record::new();
        let seq = Value::sequence(vec![Number::Int(10), Number::Int(20)]);
        root.insert("C".into(), seq);
        let scope = Scope::supplied(root, ArrayMode::Dense, true);
        assert_eq!(data(&scope, "C", &[0], Lookup::Local), Some(&int(10)));
        assert_eq!(data(&scope, "C", &[1], Lookup::Local), Some(&int(20)));
        scope.verify_retrieval().unwrap();
    }

    #[test]
    fn test_er006_verify_retrieval_reports_unread_elements() {
        let mut root = Record::new();
        let seq = Value::sequence(vec![Number::Int(10), Number::Int(20), Number::Int(30)]);
        root.insert("C".into(), seq.clone());
        root.insert("W".into(), seq);
        let scope = Scope::supplied(root.clone(), ArrayMode::Dense, true);
        assert!(data(&scope, "C", &[1], Lookup::Local).is_some());
        assert!(data(&scope, "W", &[], Lookup::Local).is_some());
        let err = scope.verify_retrieval().unwrap_err();
        assert!(matches!(err, EngineError::UnwrittenElement(ref p) if p == "/C/1"), "{:?}", err);

        let untracked = Scope::supplied(root, ArrayMode::Dense, false);
        assert!(data(&untracked, "C", &[1], Lookup::Local).is_some());
        untracked.verify_retrieval().unwrap();
    }

    #[test]
    fn test_er006_sparse_multi_index() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.set("KIJ", &[2, 7], int(27)).unwrap();
        assert_eq!(data(&scope, "KIJ", &[2, 7], Lookup::Local), Some(&int(27)));
        assert!(data(&scope, "KIJ", &[2, 8], Lookup::Local).is_none());
    }

    #[test]
    fn test_er006_loop_var_collisions() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.set("i", &[], int(3)).unwrap();
        assert!(matches!(
            scope.declare_loop_var("i", 1),
            Err(EngineError::LoopVariable(_))
        ));
        scope.declare_loop_var("j", 1).unwrap();
        assert!(matches!(
            scope.declare_loop_var("j", 1),
            Err(EngineError::LoopVariable(_))
        ));
        assert!(matches!(scope.get("j", &[], Lookup::Local).unwrap(), Some(Binding::Loop(1))));
        assert!(matches!(scope.set("j", &[], int(1)), Err(EngineError::LoopVariable(_))));
        scope.remove_loop_var("j");
        assert!(scope.get("j", &[], Lookup::Local).unwrap().is_none());
    }

    #[test]
    fn test_er006_abbreviations_scoped_to_section() {
        let mut scope = Scope::new(ArrayMode::Sparse);
        scope.set("NK", &[], int(2)).unwrap();
        assert!(matches!(
            scope.register_abbreviation("NK", Expr::int(1)),
            Err(EngineError::AbbreviationCollision(_))
        ));
        scope.open_section("sub", &[], true).unwrap();
        scope.register_abbreviation("TWO_NK", Expr::var("NK")).unwrap();
        assert!(matches!(
            scope.get("TWO_NK", &[], Lookup::Local).unwrap(),
            Some(Binding::Abbrev(_))
        ));
        scope.close_section().unwrap();
        assert!(scope.get("TWO_NK", &[], Lookup::Chain).unwrap().is_none());
        let root = scope.into_root().unwrap();
        assert!(root["sub"].as_record().unwrap().is_empty());
    }
}
