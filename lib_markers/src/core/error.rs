//! # Export Errors
//!
//! Every failure the export pipeline can report. Configuration problems
//! (unknown columns, arity or type mismatches) are fatal to the encode call
//! that hit them; they surface as a single `Err` item on the output stream so
//! a consumer can always tell a failed export apart from a finished one.

use thiserror::Error;

use crate::core::codec::Column;

/// Errors raised while resolving column specs or encoding rows.
#[derive(Debug, Error)]
pub enum ExportError {
    /// A column name that has no codec. Indicates a schema/caller mismatch.
    #[error("unknown column `{0}`")]
    UnknownColumn(String),

    /// A row whose field count differs from the column spec.
    #[error("row has {found} fields but the column spec declares {expected}")]
    Arity {
        /// Number of columns in the spec.
        expected: usize,
        /// Number of fields in the offending row.
        found: usize,
    },

    /// A value whose kind the column's codec cannot represent.
    #[error("column `{column}` cannot encode a {found} value")]
    TypeMismatch {
        /// The column being encoded.
        column: Column,
        /// Kind of the value that was supplied.
        found: &'static str,
    },

    /// A user identifier that is not exactly 40 hexadecimal characters.
    #[error("invalid user identifier `{0}`: expected 40 hex characters")]
    InvalidIdentifier(String),

    /// The row source itself failed (e.g. a database cursor error).
    #[error("row source failed: {0}")]
    Source(String),

    /// The export was cancelled before the source was exhausted.
    #[error("export cancelled")]
    Cancelled,
}
