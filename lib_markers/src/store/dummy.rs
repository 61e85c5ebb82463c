//! A store with one hard-coded marker. Analysis is always empty and
//! registrations are accepted and dropped.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::core::codec::{ColumnSpec, Value};

use super::{DeathMarker, ListQuery, Listing, MarkerStore, RowStream, StoreError};

/// Identifier of the single listed marker.
pub const DUMMY_IDENT: &str = "0123456789abcdef0123456789abcdef01234567";

/// # Dummy Store
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyStore;

#[async_trait]
impl MarkerStore for DummyStore {
    async fn list(&self, query: ListQuery) -> Result<Listing, StoreError> {
        let mut row = vec![
            Value::from(DUMMY_IDENT),
            Value::from(0u16),
            Value::from(false),
            Value::from(100.0f32),
            Value::from(200.0f32),
        ];
        let mut columns = String::from("userident,levelversion,practice,x,y");
        if !query.platformer {
            row.push(Value::from(37u16));
            columns.push_str(",percentage");
        }
        Ok(Listing {
            columns: ColumnSpec::parse(&columns)?,
            rows: stream::iter([Ok(row)]).boxed(),
        })
    }

    async fn analyze(&self, _level_id: i32, _columns: &ColumnSpec) -> Result<RowStream, StoreError> {
        Ok(stream::empty().boxed())
    }

    async fn register(&self, marker: &DeathMarker) -> Result<(), StoreError> {
        debug!(level_id = marker.level_id, "Dummy store dropped a marker.");
        Ok(())
    }
}
