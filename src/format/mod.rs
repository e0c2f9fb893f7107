//! Fixed-width ENDF-6 text: field codec and record line layouts.

pub mod field;
pub mod records;

pub use field::{FieldCodec, FieldKind, FortranCodec};
pub use records::Ctrl;
