//! ER-010: Line layouts of the ENDF-6 record shapes.
//!
//! Every line carries six fields of the codec width followed by the
//! MAT/MF/MT control triple (4, 2 and 3 columns) and an optional 5-column
//! line counter. Columns are counted in characters.

use super::field::{FieldCodec, FieldKind};
use crate::core::error::{EngineError, Result};
use crate::core::value::Number;
use std::fmt;

/// Values per line in LIST, TAB1 and TAB2 bodies.
pub const PER_LINE: usize = 6;
pub const CTRL_WIDTH: usize = 9;
pub const NS_WIDTH: usize = 5;
/// Line counter of a SEND record.
pub const SEND_NS: &str = "99999";

pub const CONT_SLOTS: [&str; 6] = ["C1", "C2", "L1", "L2", "N1", "N2"];
pub const CONT_KINDS: [FieldKind; 6] = [
    FieldKind::Float,
    FieldKind::Float,
    FieldKind::Int,
    FieldKind::Int,
    FieldKind::Int,
    FieldKind::Int,
];

/// The MAT/MF/MT control triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ctrl {
    pub mat: i64,
    pub mf: i64,
    pub mt: i64,
}

impl Ctrl {
    pub fn new(mat: i64, mf: i64, mt: i64) -> Ctrl {
        Ctrl { mat, mf, mt }
    }

    pub fn as_array(&self) -> [i64; 3] {
        [self.mat, self.mf, self.mt]
    }
}

impl fmt::Display for Ctrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4}{:>2}{:>3}", self.mat, self.mf, self.mt)
    }
}

/// Characters `start..end` of `line`; short lines give what is there.
pub fn columns(line: &str, start: usize, end: usize) -> String {
    line.chars()
        .skip(start)
        .take(end.saturating_sub(start))
        .collect()
}

fn ljust(mut s: String, width: usize) -> String {
    let n = s.chars().count();
    if n < width {
        s.extend(std::iter::repeat(' ').take(width - n));
    }
    s
}

pub fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn parse_ctrl_field(text: &str) -> Result<i64> {
    let t = text.trim();
    if t.is_empty() {
        return Ok(0);
    }
    t.parse::<i64>()
        .map_err(|_| EngineError::InvalidIntegerField(text.to_string()))
}

/// Read the control triple that follows the six data fields.
pub fn read_ctrl(line: &str, width: usize) -> Result<Ctrl> {
    let ofs = PER_LINE * width;
    Ok(Ctrl {
        mat: parse_ctrl_field(&columns(line, ofs, ofs + 4))?,
        mf: parse_ctrl_field(&columns(line, ofs + 4, ofs + 6))?,
        mt: parse_ctrl_field(&columns(line, ofs + 6, ofs + 9))?,
    })
}

/// The next non-blank line at or after `ofs`. Returns its offset and
/// advances `ofs` past it.
pub fn next_line<'a>(lines: &'a [String], ofs: &mut usize, what: &str) -> Result<(usize, &'a str)> {
    while let Some(line) = lines.get(*ofs) {
        if !is_blank(line) {
            let at = *ofs;
            *ofs += 1;
            return Ok((at, line.as_str()));
        }
        *ofs += 1;
    }
    Err(EngineError::UnexpectedEndOfInput(what.to_string()))
}

// ============================================================================
// CONT-shaped lines
// ============================================================================

/// The six fields of a HEAD, CONT, LIST, TAB1, TAB2 or SEND control line.
pub fn read_cont(line: &str, codec: &dyn FieldCodec) -> Result<[Number; 6]> {
    let w = codec.width();
    let mut out = [Number::Int(0); 6];
    for (i, kind) in CONT_KINDS.iter().enumerate() {
        out[i] = codec.decode(&columns(line, i * w, (i + 1) * w), *kind)?;
    }
    Ok(out)
}

/// Six fields without the control triple.
pub fn write_cont(fields: &[Number; 6], codec: &dyn FieldCodec) -> Result<String> {
    let mut line = String::with_capacity(PER_LINE * codec.width());
    for (value, kind) in fields.iter().zip(CONT_KINDS.iter()) {
        line.push_str(&codec.encode(*value, *kind)?);
    }
    Ok(line)
}

/// L1, L2, N1, N2 of a DIR line (the first two fields are blank).
pub fn read_dir(line: &str, codec: &dyn FieldCodec) -> Result<[Number; 4]> {
    let w = codec.width();
    let mut out = [Number::Int(0); 4];
    for (i, slot) in out.iter_mut().enumerate() {
        let col = (i + 2) * w;
        *slot = codec.decode(&columns(line, col, col + w), FieldKind::Int)?;
    }
    Ok(out)
}

pub fn write_dir(fields: &[Number; 4], codec: &dyn FieldCodec) -> Result<String> {
    let mut line = " ".repeat(2 * codec.width());
    for value in fields {
        line.push_str(&codec.encode(*value, FieldKind::Int)?);
    }
    Ok(line)
}

/// The zero-filled fields of SEND, FEND, MEND and TEND.
pub fn zero_fields(codec: &dyn FieldCodec) -> Result<String> {
    if codec.zero_as_blank() {
        return Ok(" ".repeat(6 * codec.width()));
    }
    let zero = Number::Int(0);
    write_cont(&[Number::Float(0.0), Number::Float(0.0), zero, zero, zero, zero], codec)
}

/// Check that a line is a section end: all fields zero and MT=0.
pub fn check_send(line: &str, codec: &dyn FieldCodec) -> Result<Ctrl> {
    let fields = read_cont(line, codec)?;
    let ctrl = read_ctrl(line, codec.width())?;
    if fields.iter().any(|f| !f.is_zero()) || ctrl.mt != 0 {
        return Err(EngineError::NotSectionEnd(line.to_string()));
    }
    Ok(ctrl)
}

// ============================================================================
// INTG
// ============================================================================

/// Column where the KIJ values start and how many fit in a line.
fn intg_layout(ndigit: i64) -> Result<(usize, usize)> {
    if !(2..=6).contains(&ndigit) {
        return Err(EngineError::InvalidInteger(format!(
            "NDIGIT must be between 2 and 6, got {}",
            ndigit
        )));
    }
    let step = ndigit as usize + 1;
    let start = if ndigit == 6 { 10 } else { 11 };
    let count = (66 - start) / step;
    Ok((start, count))
}

/// II, JJ and the KIJ vector of an INTG line.
pub fn read_intg(line: &str, ndigit: i64) -> Result<(i64, i64, Vec<i64>)> {
    let (start, count) = intg_layout(ndigit)?;
    let step = ndigit as usize + 1;
    let ii = parse_ctrl_field(&columns(line, 0, 5))?;
    let jj = parse_ctrl_field(&columns(line, 5, 10))?;
    let kij = (0..count)
        .map(|k| {
            let col = start + k * step;
            parse_ctrl_field(&columns(line, col, col + step))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((ii, jj, kij))
}

pub fn write_intg(ii: i64, jj: i64, kij: &[i64], ndigit: i64, width: usize) -> Result<String> {
    let (_, count) = intg_layout(ndigit)?;
    if kij.len() > count {
        return Err(EngineError::SizeMismatch(format!(
            "INTG with NDIGIT={} holds {} values, got {}",
            ndigit,
            count,
            kij.len()
        )));
    }
    let step = ndigit as usize + 1;
    let mut line = format!("{:>5}{:>5}", ii, jj);
    if ndigit != 6 {
        line.push(' ');
    }
    for k in kij {
        let item = format!("{:>step$}", k, step = step);
        if item.len() > step {
            return Err(EngineError::SizeMismatch(format!(
                "INTG value {} does not fit into {} digits",
                k, ndigit
            )));
        }
        line.push_str(&item);
    }
    Ok(ljust(line, PER_LINE * width))
}

// ============================================================================
// TEXT
// ============================================================================

/// The data part of a TEXT line.
pub fn read_text(line: &str, width: usize) -> String {
    columns(line, 0, PER_LINE * width)
}

pub fn write_text(text: &str, width: usize) -> Result<String> {
    let limit = PER_LINE * width;
    if text.chars().count() > limit {
        return Err(EngineError::SizeMismatch(format!(
            "text of {} characters exceeds {} columns",
            text.chars().count(),
            limit
        )));
    }
    Ok(ljust(text.to_string(), limit))
}

// ============================================================================
// Bodies of LIST, TAB1 and TAB2
// ============================================================================

/// Read `n` values, six per line.
pub fn read_numbers(
    lines: &[String],
    ofs: &mut usize,
    n: usize,
    kind: FieldKind,
    codec: &dyn FieldCodec,
) -> Result<Vec<Number>> {
    let w = codec.width();
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let (_, line) = next_line(lines, ofs, "record body")?;
        let m = (n - out.len()).min(PER_LINE);
        for i in 0..m {
            let text = columns(line, i * w, (i + 1) * w);
            let value = match kind {
                FieldKind::Float => codec.decode(&text, FieldKind::Float)?,
                // interpolation tables are written as plain integers but
                // some producers emit them in float notation
                FieldKind::Int => match codec.decode(&text, FieldKind::Int) {
                    Ok(v) => v,
                    Err(_) => {
                        let f = codec.decode(&text, FieldKind::Float)?;
                        Number::Int(f.as_exact_int().ok_or_else(|| {
                            EngineError::InvalidIntegerField(text.clone())
                        })?)
                    }
                },
            };
            out.push(value);
        }
    }
    Ok(out)
}

/// Write values six per line; the last line is padded with blanks.
pub fn write_numbers(values: &[Number], kind: FieldKind, codec: &dyn FieldCodec) -> Result<Vec<String>> {
    let mut lines = Vec::with_capacity(values.len().div_ceil(PER_LINE));
    for chunk in values.chunks(PER_LINE) {
        let mut line = String::with_capacity(PER_LINE * codec.width());
        for v in chunk {
            line.push_str(&codec.encode(*v, kind)?);
        }
        lines.push(ljust(line, PER_LINE * codec.width()));
    }
    Ok(lines)
}

/// Interleave two equally long columns (`NBT/INT`, `X/Y`).
pub fn interleave(a: &[Number], b: &[Number]) -> Vec<Number> {
    a.iter().zip(b.iter()).flat_map(|(x, y)| [*x, *y]).collect()
}

/// Split interleaved pairs back into two columns.
pub fn deinterleave(values: &[Number]) -> (Vec<Number>, Vec<Number>) {
    let a = values.iter().step_by(2).copied().collect();
    let b = values.iter().skip(1).step_by(2).copied().collect();
    (a, b)
}

// ============================================================================
// Section terminators and line numbers
// ============================================================================

/// Which terminator record to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// End of an MT section.
    Send,
    /// End of an MF file.
    Fend,
    /// End of a material.
    Mend,
    /// End of the tape.
    Tend,
}

/// A terminator line for material `mat` and file `mf`.
pub fn end_line(kind: End, mat: i64, mf: i64, codec: &dyn FieldCodec, with_ns: bool) -> Result<String> {
    let (ctrl, ns) = match kind {
        End::Send => (Ctrl::new(mat, mf, 0), SEND_NS),
        End::Fend => (Ctrl::new(mat, 0, 0), "    0"),
        End::Mend => (Ctrl::new(0, 0, 0), "    0"),
        End::Tend => (Ctrl::new(-1, 0, 0), "    0"),
    };
    let mut line = zero_fields(codec)?;
    line.push_str(&ctrl.to_string());
    if with_ns {
        line.push_str(ns);
    }
    Ok(line)
}

/// Cut lines after the control triple and, if asked, append a running
/// 5-digit counter. Counting starts at 1, or at 0 for the tape head.
pub fn number_lines(lines: &[String], width: usize, include: bool) -> Result<Vec<String>> {
    let cut = PER_LINE * width + CTRL_WIDTH;
    let first = match lines.first() {
        Some(l) => read_ctrl(l, width)?,
        None => return Ok(Vec::new()),
    };
    let base = usize::from(first.mf != 0);
    Ok(lines
        .iter()
        .enumerate()
        .map(|(i, l)| {
            let body = columns(l, 0, cut);
            if include {
                format!("{}{:>w$}", body, i % 99_999 + base, w = NS_WIDTH)
            } else {
                body
            }
        })
        .collect())
}
