//! Core engine: recipe AST, expressions, scope, record mapping, execution
//! tape documents and tape plumbing.

pub mod document;
pub mod error;
pub mod executor;
pub mod expr;
pub mod lookahead;
pub mod mapper;
pub mod notation;
pub mod overlay;
pub mod plumbing;
pub mod recipe;
pub mod scope;
pub mod types;
pub mod value;
