//! endf-recipe: recipe-driven ENDF-6 codec.
//!
//! A declarative recipe describes the record layout of an MF/MT section
//! once; the same recipe decodes fixed-width lines into nested data and
//! encodes the data back into lines.

pub mod cli;
pub mod core;
pub mod format;
