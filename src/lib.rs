//! machine-api-operator: converges the Cluster API components and the
//! bootstrap cluster topology from a single reconciliation key.
//!
//! Every watched change funnels into one queue key; a worker pool drives the
//! staged sync pipeline while a bootstrap loop creates the initial Cluster
//! and worker MachineSet.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
