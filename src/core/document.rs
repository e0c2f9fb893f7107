//! ER-014: Tape documents: section splitting, per-section decode and
//! encode, and the SEND/FEND/MEND/TEND end records.
//!
//! A tape is one material: a TPID line (MF=0, MT=0) followed by MF files,
//! each made of MT sections. Sections with a recipe are decoded into
//! records; all others are carried as raw lines and written back as they
//! came, renumbered.

use super::error::{EngineError, Mismatch, Result};
use super::executor;
use super::recipe::Catalogue;
use super::types::{Node, Options};
use super::value::{Number, Record, Value};
use crate::format::records::{self, end_line, is_blank, number_lines, read_ctrl, End};
use crate::format::{FieldCodec, FortranCodec};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Contents of one MF/MT section.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SectionData {
    Parsed(Record),
    /// Lines kept verbatim (no recipe, deselected or failed in best-effort
    /// mode). End records are not part of it.
    Raw(Vec<String>),
}

/// Sections by MF, then MT.
pub type Tape = BTreeMap<i64, BTreeMap<i64, SectionData>>;

/// Raw lines by MF, then MT, as produced by [`split_sections`].
pub type Sections = BTreeMap<i64, BTreeMap<i64, Vec<String>>>;

// ============================================================================
// Selection
// ============================================================================

/// A whole MF file or a single MF/MT section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKey {
    File(i64),
    Section(i64, i64),
}

impl SectionKey {
    fn matches(&self, mf: i64, mt: i64) -> bool {
        match *self {
            SectionKey::File(f) => f == mf,
            SectionKey::Section(f, t) => f == mf && t == mt,
        }
    }
}

impl FromStr for SectionKey {
    type Err = String;

    /// `3` or `3/102`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let num = |t: &str| {
            t.trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid section key {:?} (expected MF or MF/MT)", s))
        };
        match s.split_once('/') {
            Some((mf, mt)) => Ok(SectionKey::Section(num(mf)?, num(mt)?)),
            None => Ok(SectionKey::File(num(s)?)),
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKey::File(mf) => write!(f, "{}", mf),
            SectionKey::Section(mf, mt) => write!(f, "{}/{}", mf, mt),
        }
    }
}

/// Which sections to decode or encode. A non-empty exclude list wins over
/// the include list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub include: Vec<SectionKey>,
    pub exclude: Vec<SectionKey>,
}

impl Selection {
    pub fn all() -> Selection {
        Selection::default()
    }

    pub fn skips(&self, mf: i64, mt: i64) -> bool {
        if !self.exclude.is_empty() {
            return self.exclude.iter().any(|k| k.matches(mf, mt));
        }
        if !self.include.is_empty() {
            return !self.include.iter().any(|k| k.matches(mf, mt));
        }
        false
    }
}

// ============================================================================
// Splitting
// ============================================================================

/// Nesting depth while walking a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Ended,
    Tape,
    Material,
    File,
    Section,
}

impl Level {
    fn up(self) -> Level {
        match self {
            Level::Section => Level::File,
            Level::File => Level::Material,
            Level::Material => Level::Tape,
            Level::Tape | Level::Ended => Level::Ended,
        }
    }
}

/// Where the walker currently is, for consistency checks.
#[derive(Debug, Default, Clone, Copy)]
struct Open {
    mat: i64,
    mf: i64,
    mt: i64,
}

fn control_error(kind: &str, found: i64, open: i64, ofs: usize) -> EngineError {
    EngineError::UnexpectedControlRecord(format!(
        "currently in {kind}={open} but line {ofs} has {kind}={found}"
    ))
}

fn end_error(kind: &str, found: i64, expected: i64, ofs: usize) -> EngineError {
    EngineError::UnexpectedControlRecord(format!(
        "expected an end record with {kind}={expected} but line {ofs} has {kind}={found}"
    ))
}

/// Group tape lines by (MF, MT). End records are checked for consistency
/// and dropped. The TPID line is kept as section 0/0.
pub fn split_sections(lines: &[String], opts: &Options) -> Result<Sections> {
    let codec = FortranCodec::new(opts.format.clone());
    let width = codec.width();
    let mut sections = Sections::new();

    let mut ofs = 0usize;
    while lines.get(ofs).is_some_and(|l| is_blank(l)) {
        if !opts.ignore_blank_lines {
            return Err(EngineError::BlankLine(ofs));
        }
        ofs += 1;
    }
    let head = lines
        .get(ofs)
        .ok_or_else(|| EngineError::UnexpectedEndOfInput("tape head".into()))?;
    let tpid = read_ctrl(head, width)?;
    if tpid.mf != 0 || tpid.mt != 0 {
        if !opts.ignore_missing_tpid {
            return Err(EngineError::UnexpectedControlRecord(format!(
                "tape head must have MF=0, MT=0 but has MAT={}, MF={}, MT={}",
                tpid.mat, tpid.mf, tpid.mt
            )));
        }
    } else {
        sections.entry(0).or_default().insert(0, vec![head.clone()]);
        ofs += 1;
    }

    let mut level = Level::Tape;
    let mut open = Open::default();
    for (at, line) in lines.iter().enumerate().skip(ofs) {
        if is_blank(line) {
            if level == Level::Ended || opts.ignore_blank_lines {
                continue;
            }
            return Err(EngineError::BlankLine(at));
        }
        if level == Level::Ended {
            return Err(EngineError::UnexpectedControlRecord(format!(
                "line {} follows the tape end record",
                at
            )));
        }
        let ctrl = read_ctrl(line, width)?;
        let regular = ctrl.mat != 0 && ctrl.mf != 0 && ctrl.mt != 0;
        if regular {
            if !opts.ignore_send_records {
                if level >= Level::Section && open.mt != ctrl.mt {
                    return Err(control_error("MT", ctrl.mt, open.mt, at));
                }
                if level >= Level::File && open.mf != ctrl.mf {
                    return Err(control_error("MF", ctrl.mf, open.mf, at));
                }
                if level >= Level::Material && open.mat != ctrl.mat {
                    return Err(control_error("MAT", ctrl.mat, open.mat, at));
                }
            }
            sections
                .entry(ctrl.mf)
                .or_default()
                .entry(ctrl.mt)
                .or_default()
                .push(line.clone());
            level = Level::Section;
            open = Open {
                mat: ctrl.mat,
                mf: ctrl.mf,
                mt: ctrl.mt,
            };
            continue;
        }
        if opts.ignore_send_records {
            continue;
        }
        if level >= Level::File && ctrl.mat != open.mat {
            return Err(end_error("MAT", ctrl.mat, open.mat, at));
        }
        if level == Level::Material && ctrl.mat != 0 {
            return Err(end_error("MAT", ctrl.mat, 0, at));
        }
        if level >= Level::Section && ctrl.mf != open.mf {
            return Err(end_error("MF", ctrl.mf, open.mf, at));
        }
        if level < Level::Section && ctrl.mf != 0 {
            return Err(end_error("MF", ctrl.mf, 0, at));
        }
        if level == Level::Tape && ctrl.mat != -1 {
            return Err(end_error("MAT", ctrl.mat, -1, at));
        }
        if records::read_cont(line, &codec)?.iter().any(|f| !f.is_zero()) {
            return Err(EngineError::NotSectionEnd(line.clone()));
        }
        level = level.up();
    }

    if !opts.ignore_send_records {
        match level {
            Level::Ended => {}
            Level::Tape => return Err(EngineError::UnexpectedEndOfInput("tape end record".into())),
            Level::Material => {
                return Err(EngineError::UnexpectedEndOfInput(format!(
                    "end records of MAT={}",
                    open.mat
                )))
            }
            Level::File => {
                return Err(EngineError::UnexpectedEndOfInput(format!(
                    "end records of MF={}",
                    open.mf
                )))
            }
            Level::Section => {
                return Err(EngineError::UnexpectedEndOfInput(format!(
                    "end records of MT={}",
                    open.mt
                )))
            }
        }
    }
    Ok(sections)
}

// ============================================================================
// Decode
// ============================================================================

/// A demoted mismatch and the section it was found in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionWarning {
    pub mf: i64,
    pub mt: i64,
    #[serde(flatten)]
    pub mismatch: Mismatch,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedTape {
    pub tape: Tape,
    pub warnings: Vec<SectionWarning>,
    /// Variable descriptions per decoded section.
    pub descriptions: BTreeMap<(i64, i64), IndexMap<String, String>>,
    /// Sections kept raw after a failure in best-effort mode.
    pub fallbacks: Vec<(i64, i64)>,
}

fn ctrl_record(mat: i64, mf: i64, mt: i64) -> Record {
    let mut root = Record::new();
    for (name, v) in [("MAT", mat), ("MF", mf), ("MT", mt)] {
        root.insert(name.to_string(), Value::Number(Number::Int(v)));
    }
    root
}

/// Decode one section's lines (end record excluded) with a recipe body.
fn decode_section(
    body: &[Node],
    lines: &[String],
    opts: &Options,
    codec: &dyn FieldCodec,
) -> Result<executor::Decoded> {
    let first = lines
        .first()
        .ok_or_else(|| EngineError::UnexpectedEndOfInput("section".into()))?;
    let ctrl = read_ctrl(first, codec.width())?;
    let mut input = lines.to_vec();
    if ctrl.mf != 0 {
        input.push(end_line(End::Send, ctrl.mat, ctrl.mf, codec, true)?);
    }
    let decoded = executor::decode(body, &input, ctrl_record(ctrl.mat, ctrl.mf, ctrl.mt), opts, codec)?;
    if let Some(extra) = input[decoded.consumed..].iter().find(|l| !is_blank(l)) {
        return Err(EngineError::UnexpectedControlRecord(format!(
            "recipe finished before the end of the section at {:?}",
            extra
        )));
    }
    Ok(decoded)
}

/// Decode a tape. Sections without a recipe or outside `selection` stay raw.
pub fn decode(
    lines: &[String],
    catalogue: &Catalogue,
    opts: &Options,
    selection: &Selection,
) -> Result<DecodedTape> {
    let codec = FortranCodec::new(opts.format.clone());
    let sections = split_sections(lines, opts)?;
    let mut out = DecodedTape::default();
    for (mf, by_mt) in sections {
        for (mt, raw) in by_mt {
            let entry = match catalogue.lookup(mf, mt) {
                Some(entry) if !selection.skips(mf, mt) => entry,
                _ => {
                    debug!(mf, mt, lines = raw.len(), "section kept raw");
                    out.tape.entry(mf).or_default().insert(mt, SectionData::Raw(raw));
                    continue;
                }
            };
            debug!(mf, mt, recipe = %entry.key(), "decoding section");
            let data = match decode_section(&entry.body, &raw, opts, &codec) {
                Ok(decoded) => {
                    for mismatch in decoded.warnings {
                        out.warnings.push(SectionWarning { mf, mt, mismatch });
                    }
                    if !decoded.descriptions.is_empty() {
                        out.descriptions.insert((mf, mt), decoded.descriptions);
                    }
                    SectionData::Parsed(decoded.data)
                }
                Err(e) if opts.best_effort => {
                    let e = e.in_section(mf, mt);
                    warn!(mf, mt, error = %e, "section kept raw after failure");
                    out.fallbacks.push((mf, mt));
                    SectionData::Raw(raw)
                }
                Err(e) => return Err(e.in_section(mf, mt)),
            };
            out.tape.entry(mf).or_default().insert(mt, data);
        }
    }
    let parsed = out
        .tape
        .values()
        .flat_map(|m| m.values())
        .filter(|s| matches!(s, SectionData::Parsed(_)))
        .count();
    let total: usize = out.tape.values().map(|m| m.len()).sum();
    info!(
        sections = total,
        parsed,
        warnings = out.warnings.len(),
        fallbacks = out.fallbacks.len(),
        "decoded tape"
    );
    Ok(out)
}

// ============================================================================
// Encode
// ============================================================================

fn int_of(rec: &Record, name: &str) -> Option<i64> {
    rec.get(name)
        .and_then(Value::as_number)
        .and_then(Number::as_exact_int)
}

/// Fill in MF/MT from the tape keys and reject records that disagree.
fn with_ctrl(rec: &Record, mf: i64, mt: i64) -> Result<Record> {
    let mut rec = rec.clone();
    for (name, key) in [("MF", mf), ("MT", mt)] {
        match rec.get(name) {
            None => {
                rec.insert(name.to_string(), Value::Number(Number::Int(key)));
            }
            Some(_) => {
                let found = int_of(&rec, name);
                if found != Some(key) {
                    return Err(EngineError::UnexpectedControlRecord(format!(
                        "section stored under {}={} holds {}={}",
                        name,
                        key,
                        name,
                        found.map_or_else(|| "non-integer".to_string(), |v| v.to_string())
                    )));
                }
            }
        }
    }
    Ok(rec)
}

/// Encode a tape into numbered ENDF-6 lines, end records included.
pub fn encode(
    tape: &Tape,
    catalogue: &Catalogue,
    opts: &Options,
    selection: &Selection,
) -> Result<Vec<String>> {
    let codec = FortranCodec::new(opts.format.clone());
    let width = codec.width();
    let numbered = opts.include_linenum;
    let mut lines = Vec::new();
    let mut mat = 0i64;
    for (&mf, by_mt) in tape {
        let mut written = false;
        for (&mt, data) in by_mt {
            if selection.skips(mf, mt) {
                continue;
            }
            match data {
                SectionData::Parsed(rec) => {
                    let entry = catalogue.lookup(mf, mt).ok_or_else(|| {
                        EngineError::InvalidRecipe(format!("no recipe for parsed section MF={}/MT={}", mf, mt))
                    })?;
                    let rec = with_ctrl(rec, mf, mt).map_err(|e| e.in_section(mf, mt))?;
                    let out = executor::encode(&entry.body, &rec, opts, &codec)
                        .map_err(|e| e.in_section(mf, mt))?;
                    mat = int_of(&rec, "MAT").unwrap_or(mat);
                    // the SEND written by the recipe keeps its 99999 counter
                    match out.split_last() {
                        Some((send, body)) if mf != 0 && records::check_send(send, &codec).is_ok() => {
                            lines.extend(number_lines(body, width, numbered)?);
                            lines.push(send.clone());
                        }
                        _ => lines.extend(number_lines(&out, width, numbered)?),
                    }
                }
                SectionData::Raw(raw) => {
                    lines.extend(number_lines(raw, width, numbered)?);
                    if let Some(last) = raw.last() {
                        let ctrl = read_ctrl(last, width)?;
                        mat = ctrl.mat;
                        if mf != 0 {
                            lines.push(end_line(End::Send, ctrl.mat, ctrl.mf, &codec, numbered)?);
                        }
                    }
                }
            }
            debug!(mf, mt, "section encoded");
            written = true;
        }
        if written && mf != 0 {
            lines.push(end_line(End::Fend, mat, 0, &codec, numbered)?);
        }
    }
    lines.push(end_line(End::Mend, 0, 0, &codec, numbered)?);
    lines.push(end_line(End::Tend, -1, 0, &codec, numbered)?);
    info!(lines = lines.len(), "encoded tape");
    Ok(lines)
}

// ============================================================================
// JSON bridge
// ============================================================================

pub fn tape_to_json(tape: &Tape) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(tape)?)
}

fn section_key(key: &str, what: &str) -> Result<i64> {
    use serde::de::Error as _;
    key.parse::<i64>()
        .map_err(|_| serde_json::Error::custom(format!("{} key {:?} is not an integer", what, key)).into())
}

/// Read a tape from `{"MF": {"MT": section}}`. An array of strings is a
/// raw section, an object a parsed one.
pub fn tape_from_json(json: serde_json::Value) -> Result<Tape> {
    use serde::de::Error as _;
    use serde_json::Value as Json;
    let Json::Object(files) = json else {
        return Err(serde_json::Error::custom("tape must be a JSON object").into());
    };
    let mut tape = Tape::new();
    for (mf_key, file) in files {
        let mf = section_key(&mf_key, "MF")?;
        let Json::Object(sections) = file else {
            return Err(serde_json::Error::custom(format!("MF {} must be an object", mf)).into());
        };
        let by_mt = tape.entry(mf).or_default();
        for (mt_key, section) in sections {
            let mt = section_key(&mt_key, "MT")?;
            let data = match section {
                Json::Array(items) if items.iter().all(Json::is_string) => SectionData::Raw(
                    items
                        .into_iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect(),
                ),
                Json::Object(_) => match Value::from_json(section)? {
                    Value::Record(rec) => SectionData::Parsed(rec),
                    other => {
                        return Err(serde_json::Error::custom(format!(
                            "MF {}/MT {} decodes to a {}, expected a record",
                            mf,
                            mt,
                            other.kind()
                        ))
                        .into())
                    }
                },
                _ => {
                    return Err(serde_json::Error::custom(format!(
                        "MF {}/MT {} must be an object or an array of lines",
                        mf, mt
                    ))
                    .into())
                }
            };
            by_mt.insert(mt, data);
        }
    }
    Ok(tape)
}

/// Split file contents into lines, dropping carriage returns.
pub fn read_lines(text: &str) -> Vec<String> {
    text.lines().map(|l| l.trim_end_matches('\r').to_string()).collect()
}

// ============================================================================
// Tests
// ============================================================================
