//! `CloudLens` HTTP server.
//!
//! Wires the credential vault, provider adapters, admission control, and the
//! stream session manager into an Axum application. Serves the JSON API at
//! `/v1/*` and telemetry streams at `/ws/stream`.

pub mod auth;
pub mod config;
pub mod error;
pub mod providers;
pub mod routes;
pub mod state;
