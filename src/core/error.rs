//! ER-004: Error taxonomy for recipe execution.
//!
//! Every failure of the engine is an [`EngineError`]. Errors are grouped into
//! classes ([`ErrorClass`]) which decide how they are treated: binding errors
//! of the `SeveralUnboundVariables` kind are retried by the record mapper,
//! most classes reject a branch inside a lookahead window, and everything
//! else aborts the document unless best-effort mode keeps the section raw.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Tolerance class of a value mismatch. Each class can be demoted to a
/// warning independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchClass {
    /// Decoded value differs from the predicted one.
    Exact,
    /// Predicted value is zero (placeholder slots).
    Zero,
    /// Values agree within the fuzzy tolerance but not exactly.
    Fuzzy,
    /// Slot carries a desired-number marker (`N?`).
    Desired,
    /// Slot carries a tolerant variable marker (`X?`).
    Varspec,
}

impl fmt::Display for MismatchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MismatchClass::Exact => "exact",
            MismatchClass::Zero => "zero",
            MismatchClass::Fuzzy => "fuzzy",
            MismatchClass::Desired => "desired",
            MismatchClass::Varspec => "varspec",
        };
        write!(f, "{}", s)
    }
}

/// A decoded slot value that disagrees with the value predicted by the
/// recipe and the variables bound so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub class: MismatchClass,
    pub slot: String,
    pub expected: String,
    pub found: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mismatch in slot {}: expected {}, found {}",
            self.class, self.slot, self.expected, self.found
        )
    }
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Structural,
    ValueMismatch,
    Binding,
    MissingData,
    SizeMismatch,
    Recipe,
    Io,
}

/// One record template attempted by the executor, with the stream offset
/// and line it was matched against (read mode only).
#[derive(Debug, Clone, PartialEq)]
pub struct TrailEntry {
    pub offset: Option<usize>,
    pub line: Option<String>,
    pub template: String,
}

impl fmt::Display for TrailEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.offset, &self.line) {
            (Some(ofs), Some(line)) => {
                write!(f, "  line {:>5}: {}\n      template: {}", ofs, line, self.template)
            }
            _ => write!(f, "  template: {}", self.template),
        }
    }
}

/// Position information attached to an error leaving the executor.
#[derive(Debug)]
pub struct Location {
    pub mf: Option<i64>,
    pub mt: Option<i64>,
    pub offset: Option<usize>,
    pub trail: Vec<TrailEntry>,
    pub source: EngineError,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(mf), Some(mt)) = (self.mf, self.mt) {
            write!(f, "MF={}/MT={}: ", mf, mt)?;
        }
        if let Some(ofs) = self.offset {
            write!(f, "at line offset {}: ", ofs)?;
        }
        write!(f, "{}", self.source)?;
        if !self.trail.is_empty() {
            write!(f, "\nlast records attempted:")?;
            for entry in &self.trail {
                write!(f, "\n{}", entry)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    // -- structural --
    #[error("unexpected control record: {0}")]
    UnexpectedControlRecord(String),

    #[error("unexpected end of input while reading {0}")]
    UnexpectedEndOfInput(String),

    #[error("expected a SEND record, found: {0}")]
    NotSectionEnd(String),

    #[error("blank line at line {0}")]
    BlankLine(usize),

    #[error("inconsistent section brackets: {0}")]
    InconsistentSections(String),

    #[error("LIST with NPL={0} expects more elements than available")]
    MoreListElementsExpected(usize),

    #[error("LIST body left {remaining} of NPL={npl} elements unconsumed")]
    UnconsumedListElements { npl: usize, remaining: usize },

    #[error("invalid float field {0:?}")]
    InvalidFloat(String),

    #[error("invalid integer field {0:?}")]
    InvalidIntegerField(String),

    // -- value mismatch --
    #[error("{0}")]
    ValueMismatch(Mismatch),

    // -- binding --
    #[error("several unbound variables in {0}")]
    SeveralUnboundVariables(String),

    #[error("unbound variable in denominator of {0}")]
    VariableInDenominator(String),

    #[error("modulo with unbound operand in {0}")]
    ModuloEquation(String),

    #[error("value is not an integer: {0}")]
    InvalidInteger(String),

    #[error("division by zero in {0}")]
    DivisionByZero(String),

    #[error("variable {0} does not hold a number")]
    NotNumeric(String),

    // -- missing data --
    #[error("variable {0} not found")]
    VariableNotFound(String),

    #[error("index {index} of array {name} is not available")]
    UnavailableIndex { name: String, index: String },

    #[error("section {0} not found")]
    MissingSection(String),

    // -- size mismatch --
    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    #[error("array element {0} was supplied but never written")]
    UnwrittenElement(String),

    // -- recipe --
    #[error("loop variable collision: {0}")]
    LoopVariable(String),

    #[error("abbreviation {0} collides with an existing variable")]
    AbbreviationCollision(String),

    #[error("lookahead windows cannot be nested")]
    NestedLookahead,

    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("notation error in {input:?}: {message}")]
    Notation { input: String, message: String },

    #[error("repeat loop made no progress in iteration {0}")]
    StalledRepeat(i64),

    #[error("stop: {0}")]
    Stop(String),

    // -- io --
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("{0}")]
    Located(Box<Location>),
}

impl EngineError {
    /// Taxonomy class of this error. Located errors report their cause.
    pub fn class(&self) -> ErrorClass {
        use EngineError::*;
        match self {
            UnexpectedControlRecord(_)
            | UnexpectedEndOfInput(_)
            | NotSectionEnd(_)
            | BlankLine(_)
            | InconsistentSections(_)
            | MoreListElementsExpected(_)
            | UnconsumedListElements { .. }
            | InvalidFloat(_)
            | InvalidIntegerField(_) => ErrorClass::Structural,
            ValueMismatch(_) => ErrorClass::ValueMismatch,
            SeveralUnboundVariables(_)
            | VariableInDenominator(_)
            | ModuloEquation(_)
            | InvalidInteger(_)
            | DivisionByZero(_)
            | NotNumeric(_) => ErrorClass::Binding,
            VariableNotFound(_) | UnavailableIndex { .. } | MissingSection(_) => {
                ErrorClass::MissingData
            }
            SizeMismatch(_) | UnwrittenElement(_) => ErrorClass::SizeMismatch,
            LoopVariable(_)
            | AbbreviationCollision(_)
            | NestedLookahead
            | InvalidRecipe(_)
            | Notation { .. }
            | StalledRepeat(_)
            | Stop(_) => ErrorClass::Recipe,
            Io(_) | Json(_) | Yaml(_) => ErrorClass::Io,
            Located(loc) => loc.source.class(),
        }
    }

    /// Only `SeveralUnboundVariables` may resolve on a later slot pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), EngineError::SeveralUnboundVariables(_))
    }

    /// Errors that mean "this branch does not fit the stream" when raised
    /// inside a lookahead window. Binding errors stay fatal there too.
    pub fn rejects_branch(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Structural
                | ErrorClass::ValueMismatch
                | ErrorClass::MissingData
                | ErrorClass::SizeMismatch
        )
    }

    /// The innermost error, unwrapping location context.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Located(loc) => loc.source.root(),
            other => other,
        }
    }

    /// Attach position information unless already located.
    pub fn locate(self, offset: Option<usize>, trail: Vec<TrailEntry>) -> EngineError {
        match self {
            located @ EngineError::Located(_) => located,
            source => EngineError::Located(Box::new(Location {
                mf: None,
                mt: None,
                offset,
                trail,
                source,
            })),
        }
    }

    /// Record the section an error happened in.
    pub fn in_section(self, mf: i64, mt: i64) -> EngineError {
        match self {
            EngineError::Located(mut loc) => {
                loc.mf = Some(mf);
                loc.mt = Some(mt);
                EngineError::Located(loc)
            }
            source => EngineError::Located(Box::new(Location {
                mf: Some(mf),
                mt: Some(mt),
                offset: None,
                trail: Vec::new(),
                source,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_er004_classes() {
        assert_eq!(
            EngineError::UnexpectedControlRecord("x".into()).class(),
            ErrorClass::Structural
        );
        assert_eq!(
            EngineError::VariableNotFound("NP".into()).class(),
            ErrorClass::MissingData
        );
        assert_eq!(EngineError::NestedLookahead.class(), ErrorClass::Recipe);
        assert_eq!(
            EngineError::ModuloEquation("a%b".into()).class(),
            ErrorClass::Binding
        );
    }

    #[test]
    fn test_er004_retryable_only_several_unbound() {
        assert!(EngineError::SeveralUnboundVariables("a+b".into()).is_retryable());
        assert!(!EngineError::VariableInDenominator("1/a".into()).is_retryable());
        let located = EngineError::SeveralUnboundVariables("a*b".into()).locate(Some(3), vec![]);
        assert!(located.is_retryable());
    }

    #[test]
    fn test_er004_rejects_branch() {
        assert!(EngineError::MoreListElementsExpected(4).rejects_branch());
        assert!(EngineError::SizeMismatch("x".into()).rejects_branch());
        assert!(!EngineError::Stop("done".into()).rejects_branch());
        assert!(!EngineError::NestedLookahead.rejects_branch());
        assert!(!EngineError::ModuloEquation("X%2".into()).rejects_branch());
        assert!(!EngineError::VariableInDenominator("1/X".into()).rejects_branch());
        assert!(!EngineError::DivisionByZero("A/0".into()).rejects_branch());
        assert!(!EngineError::ModuloEquation("X%2".into())
            .locate(Some(0), Vec::new())
            .rejects_branch());
    }

    #[test]
    fn test_er004_located_display() {
        let err = EngineError::VariableNotFound("AWR".into())
            .locate(
                Some(2),
                vec![TrailEntry {
                    offset: Some(2),
                    line: Some(" 1.000000+0".into()),
                    template: "[MAT, 3, MT/ ZA, AWR, 0, 0, 0, 0]HEAD".into(),
                }],
            )
            .in_section(3, 1);
        let msg = err.to_string();
        assert!(msg.starts_with("MF=3/MT=1: at line offset 2: variable AWR not found"));
        assert!(msg.contains("HEAD"));
        assert_eq!(err.class(), ErrorClass::MissingData);
    }

    #[test]
    fn test_er004_mismatch_display() {
        let m = Mismatch {
            class: MismatchClass::Exact,
            slot: "C2".into(),
            expected: "9".into(),
            found: "10".into(),
        };
        assert_eq!(m.to_string(), "exact mismatch in slot C2: expected 9, found 10");
    }
}
