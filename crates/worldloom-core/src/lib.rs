//! Worldloom Core - Types, text patching, and error handling

pub mod diff;
pub mod error;
pub mod text;
pub mod types;

pub use diff::{apply_diff, parse_instructions, DiffInstruction};
pub use error::{Error, Result};
pub use types::*;
