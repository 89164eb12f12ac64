//! Structural gate: the source parses and exposes an entry point.

use crate::domain::{SourceLocation, ValidationFault};

use super::syntax::SourceIndex;

/// Gate 1. Returns the index the later gates read.
pub fn check(source: &str) -> Result<SourceIndex, ValidationFault> {
    let index = SourceIndex::parse(source).map_err(|e| ValidationFault::Syntax {
        location: e.location,
        message: e.message,
    })?;
    if index.entry_point().is_none() {
        return Err(ValidationFault::Syntax {
            location: SourceLocation { line: 1, column: 1 },
            message: "no public top-level function to use as entry point".to_string(),
        });
    }
    Ok(index)
}
