//! # Marker Stores
//!
//! The storage seam between the HTTP layer and whatever keeps death markers.
//! Every backend implements [`MarkerStore`]; handlers only ever see the trait
//! object, so swapping the dummy backend for PostgreSQL is a config change.
//!
//! Reads hand back a [`RowStream`] rather than a collected `Vec`, which lets
//! the encoder pull rows lazily and lets a dropped response release the
//! underlying cursor.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::core::codec::{ColumnSpec, Row};
use crate::core::error::ExportError;

/// The in-process backend used for development and tests.
pub mod dummy;
/// JSON submission parsing and validation.
pub mod submission;

pub use dummy::DummyStore;
pub use submission::{parse_submission, SubmitError, Submission};

/// Columns served by analysis exports, in order.
pub const ANALYSIS_COLUMNS: &str = "userident,levelversion,practice,x,y,percentage";

/// A lazily produced sequence of rows.
pub type RowStream = BoxStream<'static, Result<Row, ExportError>>;

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or set up.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// A statement failed.
    #[error("store query failed: {0}")]
    Query(String),
    /// A column list the backend cannot serve.
    #[error(transparent)]
    Columns(#[from] ExportError),
}

/// Filters for a public listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    /// Level to list.
    pub level_id: i32,
    /// Platformer levels carry no meaningful percentage.
    pub platformer: bool,
    /// Whether practice-mode deaths are included.
    pub include_practice: bool,
}

impl ListQuery {
    /// The position columns a listing exposes for this kind of level.
    pub fn position_columns(&self) -> &'static str {
        if self.platformer {
            "x,y"
        } else {
            "x,y,percentage"
        }
    }
}

/// A listing: the column layout and the rows that follow it.
pub struct Listing {
    /// Layout of every row in `rows`.
    pub columns: ColumnSpec,
    /// The rows, pulled on demand.
    pub rows: RowStream,
}

/// The storage layout a marker was submitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerFormat {
    /// Position, percentage and practice flag.
    V1,
    /// `V1` plus collected coins and item data.
    V2 {
        /// Bitmask of collected coins.
        coins: i16,
        /// Opaque item state.
        itemdata: i32,
    },
}

impl MarkerFormat {
    /// Numeric format tag as sent by clients.
    pub fn version(self) -> u8 {
        match self {
            MarkerFormat::V1 => 1,
            MarkerFormat::V2 { .. } => 2,
        }
    }
}

/// # Death Marker
///
/// One validated submission, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DeathMarker {
    /// 40 lowercase hex characters.
    pub userident: String,
    /// Level the death happened on.
    pub level_id: i32,
    /// Level revision.
    pub level_version: i16,
    /// Practice mode flag.
    pub practice: bool,
    /// Horizontal position.
    pub x: f32,
    /// Vertical position.
    pub y: f32,
    /// Progress percentage, 0..=99.
    pub percentage: i16,
    /// Storage layout and its extra fields.
    pub format: MarkerFormat,
}

/// # Marker Store
///
/// Backend-agnostic access to death markers.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Public listing for one level.
    async fn list(&self, query: ListQuery) -> Result<Listing, StoreError>;

    /// Full rows for one level, in the given column layout.
    async fn analyze(&self, level_id: i32, columns: &ColumnSpec) -> Result<RowStream, StoreError>;

    /// Persists one marker.
    async fn register(&self, marker: &DeathMarker) -> Result<(), StoreError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
