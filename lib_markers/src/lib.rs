//! # lib_markers
//!
//! Building blocks for the death marker export service: column codecs, the
//! streaming row encoder, the admission controller, storage backends and
//! logging setup. Each area sits behind a cargo feature so binaries only pull
//! in what they use.

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "core")]
pub mod store;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "loggers")]
pub mod loggers;
