//! HTTP server around the relay engine: YAML config, axum surface, and
//! server assembly shared between the binary and the integration tests.

pub mod config;
pub mod http;
