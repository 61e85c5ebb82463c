//! # Connections Module
//!
//! This module handles persistent connections to external services.

/// PostgreSQL-backed marker store with connection pooling.
pub mod db_postgres;

pub use db_postgres::PostgresStore;
