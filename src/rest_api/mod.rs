//! Health and status HTTP API
//!
//! Serves liveness, readiness, the operator status snapshot and, with the
//! `metrics` feature, the Prometheus registry.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server, ApiState};
