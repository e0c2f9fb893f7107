//! ER-016: Tape plumbing: tolerance-based comparison of decoded tapes and
//! recomputation of the MF1/MT451 directory.

use super::document::{self, SectionData, Selection, Tape};
use super::error::{EngineError, Result};
use super::recipe::Catalogue;
use super::types::Options;
use super::value::{Array, ArrayMode, Number, Record, Value};
use crate::format::records::{columns, CTRL_WIDTH, PER_LINE};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

// ============================================================================
// Compare
// ============================================================================

/// Absolute and relative tolerance for numbers: `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompareTolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Default for CompareTolerance {
    fn default() -> Self {
        Self {
            atol: 1e-8,
            rtol: 1e-6,
        }
    }
}

impl CompareTolerance {
    fn close(&self, a: Number, b: Number) -> bool {
        if let (Number::Int(x), Number::Int(y)) = (a, b) {
            return x == y;
        }
        let (x, y) = (a.as_f64(), b.as_f64());
        (x - y).abs() <= self.atol + self.rtol * y.abs()
    }
}

/// One difference between two tapes, located by a `/MF/MT/...` path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub path: String,
    pub message: String,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

struct Comparer {
    tol: CompareTolerance,
    /// Columns of a raw line that carry data (sequence number excluded).
    cut: usize,
    diffs: Vec<Difference>,
}

impl Comparer {
    fn differ(&mut self, path: &str, message: String) {
        self.diffs.push(Difference {
            path: path.to_string(),
            message,
        });
    }

    fn keys<K: Ord + Copy + fmt::Display, V>(
        &mut self,
        path: &str,
        left: impl Iterator<Item = (K, V)>,
        right: impl Iterator<Item = (K, V)>,
    ) -> Vec<(K, V, V)> {
        let mut right: std::collections::BTreeMap<K, V> = right.collect();
        let mut common = Vec::new();
        let mut only_left = Vec::new();
        for (k, a) in left {
            match right.remove(&k) {
                Some(b) => common.push((k, a, b)),
                None => only_left.push(k.to_string()),
            }
        }
        if !only_left.is_empty() {
            self.differ(path, format!("only the first tape has {}", only_left.join(", ")));
        }
        if !right.is_empty() {
            let only_right: Vec<String> = right.keys().map(|k| k.to_string()).collect();
            self.differ(path, format!("only the second tape has {}", only_right.join(", ")));
        }
        common
    }

    fn section(&mut self, path: &str, a: &SectionData, b: &SectionData) {
        match (a, b) {
            (SectionData::Parsed(x), SectionData::Parsed(y)) => self.record(path, x, y),
            (SectionData::Raw(x), SectionData::Raw(y)) => {
                if x.len() != y.len() {
                    self.differ(path, format!("{} vs {} lines", x.len(), y.len()));
                }
                for (i, (l, r)) in x.iter().zip(y).enumerate() {
                    let (l, r) = (columns(l, 0, self.cut), columns(r, 0, self.cut));
                    if l != r {
                        self.differ(&format!("{}/line {}", path, i + 1), format!("{:?} != {:?}", l, r));
                    }
                }
            }
            _ => self.differ(path, "decoded in one tape, kept raw in the other".into()),
        }
    }

    fn record(&mut self, path: &str, a: &Record, b: &Record) {
        // names are compared in the order of the first record
        let mut only_left = Vec::new();
        for (name, x) in a {
            match b.get(name) {
                Some(y) => self.value(&format!("{}/{}", path, name), x, y),
                None => only_left.push(name.as_str()),
            }
        }
        if !only_left.is_empty() {
            self.differ(path, format!("only the first tape has {}", only_left.join(", ")));
        }
        let only_right: Vec<&str> = b.keys().filter(|k| !a.contains_key(*k)).map(String::as_str).collect();
        if !only_right.is_empty() {
            self.differ(path, format!("only the second tape has {}", only_right.join(", ")));
        }
    }

    fn array(&mut self, path: &str, a: &Array, b: &Array) {
        for (key, x, y) in self.keys(path, a.entries(), b.entries()) {
            self.value(&format!("{}/{}", path, key), x, y);
        }
    }

    fn value(&mut self, path: &str, a: &Value, b: &Value) {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                if !self.tol.close(*x, *y) {
                    self.differ(path, format!("{} != {}", x, y));
                }
            }
            (Value::Text(x), Value::Text(y)) => {
                if x != y {
                    self.differ(path, format!("{:?} != {:?}", x, y));
                }
            }
            (Value::Array(x), Value::Array(y)) => self.array(path, x, y),
            (Value::Record(x), Value::Record(y)) => self.record(path, x, y),
            _ => self.differ(path, format!("{} vs {}", a.kind(), b.kind())),
        }
    }
}

/// Compare two tapes section by section. Numbers match within `tol`,
/// text and raw lines must be identical. An empty result means the tapes
/// agree.
pub fn compare_tapes(a: &Tape, b: &Tape, tol: CompareTolerance, opts: &Options) -> Vec<Difference> {
    let mut cmp = Comparer {
        tol,
        cut: PER_LINE * opts.format.width + CTRL_WIDTH,
        diffs: Vec::new(),
    };
    let files = cmp.keys("/", a.iter().map(|(k, v)| (*k, v)), b.iter().map(|(k, v)| (*k, v)));
    for (mf, x, y) in files {
        let path = format!("/{}", mf);
        let sections = cmp.keys(&path, x.iter().map(|(k, v)| (*k, v)), y.iter().map(|(k, v)| (*k, v)));
        for (mt, s, t) in sections {
            cmp.section(&format!("{}/{}", path, mt), s, t);
        }
    }
    debug!(differences = cmp.diffs.len(), "compared tapes");
    cmp.diffs
}

// ============================================================================
// Directory
// ============================================================================

/// One directory line of MF1/MT451.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub mf: i64,
    pub mt: i64,
    /// Lines in the section, SEND excluded.
    pub nc: i64,
    pub modn: i64,
}

fn int_field(rec: &Record, name: &str) -> Option<i64> {
    rec.get(name)
        .and_then(Value::as_number)
        .and_then(Number::as_exact_int)
}

fn array_of(values: Vec<i64>, mode: ArrayMode) -> Value {
    let values = values.into_iter().map(|v| Value::Number(Number::Int(v)));
    Value::Array(match mode {
        ArrayMode::Sparse => Array::Sparse((1..).zip(values).collect()),
        ArrayMode::Dense => Array::Dense(values.collect()),
    })
}

/// Previous modification numbers by (MF, MT).
fn previous_mods(desc: &Record) -> FxHashMap<(i64, i64), i64> {
    let column = |name: &str| match desc.get(name) {
        Some(Value::Array(a)) => a
            .entries()
            .filter_map(|(k, v)| v.as_number().and_then(Number::as_exact_int).map(|v| (k, v)))
            .collect::<FxHashMap<i64, i64>>(),
        _ => FxHashMap::default(),
    };
    let (mfs, mts, mods) = (column("MFx"), column("MTx"), column("MOD"));
    mfs.iter()
        .filter_map(|(k, mf)| Some(((*mf, *mts.get(k)?), *mods.get(k).unwrap_or(&0))))
        .collect()
}

/// Recompute the MF1/MT451 directory (`NXC`, `MFx`, `MTx`, `NCx`, `MOD`)
/// from the sections of the tape. Line counts come from encoding the tape;
/// MF1/MT451 counts itself as `4 + NWD + NXC`. Modification numbers of
/// sections already listed are kept, new sections get 0.
pub fn update_directory(tape: &mut Tape, catalogue: &Catalogue, opts: &Options) -> Result<Vec<DirEntry>> {
    let Some(SectionData::Parsed(desc)) = tape.get(&1).and_then(|m| m.get(&451)) else {
        return Err(EngineError::MissingSection("MF=1/MT=451 (decoded)".into()));
    };
    let nwd = int_field(desc, "NWD").ok_or_else(|| EngineError::VariableNotFound("NWD".into()))?;
    let mods = previous_mods(desc);

    let mut plain = opts.clone();
    plain.include_linenum = false;
    let lines = document::encode(tape, catalogue, &plain, &Selection::all())?;
    let sections = document::split_sections(&lines, &plain)?;

    let mut entries: Vec<DirEntry> = sections
        .iter()
        .filter(|(mf, _)| **mf != 0)
        .flat_map(|(&mf, by_mt)| {
            by_mt
                .iter()
                .filter(|(mt, _)| **mt != 0)
                .map(move |(&mt, raw)| (mf, mt, raw.len() as i64))
        })
        .map(|(mf, mt, nc)| DirEntry {
            mf,
            mt,
            nc,
            modn: mods.get(&(mf, mt)).copied().unwrap_or(0),
        })
        .collect();
    let nxc = entries.len() as i64;
    if let Some(own) = entries.iter_mut().find(|e| e.mf == 1 && e.mt == 451) {
        own.nc = 4 + nwd + nxc;
    }

    let mode = opts.array_mode;
    let column = |f: fn(&DirEntry) -> i64| array_of(entries.iter().map(f).collect(), mode);
    let updates = [
        ("MFx", column(|e| e.mf)),
        ("MTx", column(|e| e.mt)),
        ("NCx", column(|e| e.nc)),
        ("MOD", column(|e| e.modn)),
    ];
    if let Some(SectionData::Parsed(desc)) = tape.get_mut(&1).and_then(|m| m.get_mut(&451)) {
        desc.insert("NXC".into(), Value::Number(Number::Int(nxc)));
        for (name, value) in updates {
            desc.insert(name.into(), value);
        }
    }
    info!(sections = nxc, "updated MF1/MT451 directory");
    Ok(entries)
}

// ============================================================================
// Tests
// ============================================================================
