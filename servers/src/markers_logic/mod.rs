pub mod config;
pub mod limiter;
pub mod routes;
pub mod state;
