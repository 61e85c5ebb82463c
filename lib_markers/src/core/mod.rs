//! # Core Export Module
//!
//! Everything needed to turn rows of death markers into a response body, and
//! to decide whether a client may ask for one.
//!
//! ## Core Components:
//!
//! - **`codec`**: The column codec registry. Maps every exportable column to a
//!   fixed-width binary encoding and resolves comma-separated column lists into
//!   a [`ColumnSpec`].
//!
//! - **`encoder`**: The streaming row encoder. Pulls rows from a synchronous or
//!   asynchronous source and emits bounded chunks of CSV or versioned binary,
//!   holding at most one batch in memory.
//!
//! - **`admission`**: The per-address rate limiter with start-up grace period
//!   and escalation to timed bans.
//!
//! - **`anonymize`**: Salted identifier hashing for analysis exports.
//!
//! - **`error`**: The [`ExportError`] type shared by the above.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-address admission control with escalating bans.
pub mod admission;
/// Salted identifier hashing.
pub mod anonymize;
/// Fixed-width column codecs and column specs.
pub mod codec;
/// Chunked CSV and binary encoding over row sources.
pub mod encoder;
/// Export error type.
pub mod error;

// --- Public API Re-exports ---
pub use admission::{AdmissionConfig, AdmissionController, BanPolicy, Decision, Phase};
pub use anonymize::{create_user_ident, Anonymizer};
pub use codec::{Column, ColumnSpec, Row, Value};
pub use encoder::{encode_iter, encode_stream, encode_to_vec, EncodeOptions, OutputFormat};
pub use error::ExportError;
