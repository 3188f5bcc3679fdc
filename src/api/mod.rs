//! HTTP API Module
//!
//! Provides a read-only REST API for replication status and metrics.

mod http;

pub use http::{AppState, HttpServer};
