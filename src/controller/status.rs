//! In-memory operator status fed by the error policy and startup milestones

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::conditions::{
    initial_conditions, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_AVAILABLE, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_PROGRESSING,
};
use crate::crd::Condition;
use crate::error::Error;

/// Point-in-time copy of the operator status
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub conditions: Vec<Condition>,
    pub caches_synced: bool,
    pub bootstrap_complete: bool,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

pub struct StatusTracker {
    conditions: RwLock<Vec<Condition>>,
    last_successful_sync: RwLock<Option<DateTime<Utc>>>,
    caches_synced: AtomicBool,
    bootstrap_complete: AtomicBool,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            conditions: RwLock::new(initial_conditions()),
            last_successful_sync: RwLock::new(None),
            caches_synced: AtomicBool::new(false),
            bootstrap_complete: AtomicBool::new(false),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Condition>)) {
        let mut conditions = self
            .conditions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut conditions);
    }

    /// A full pipeline run finished
    pub fn sync_succeeded(&self) {
        self.update(|c| {
            set_condition(
                c,
                CONDITION_TYPE_AVAILABLE,
                CONDITION_STATUS_TRUE,
                "SyncSucceeded",
                "All components converged",
            );
            set_condition(c, CONDITION_TYPE_PROGRESSING, CONDITION_STATUS_FALSE, "AsExpected", "");
            set_condition(c, CONDITION_TYPE_DEGRADED, CONDITION_STATUS_FALSE, "AsExpected", "");
        });
        *self
            .last_successful_sync
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// A pipeline run failed and will be retried
    pub fn sync_failed(&self, err: &Error) {
        let message = err.to_string();
        self.update(|c| {
            set_condition(
                c,
                CONDITION_TYPE_PROGRESSING,
                CONDITION_STATUS_TRUE,
                "Retrying",
                &message,
            );
            set_condition(
                c,
                CONDITION_TYPE_DEGRADED,
                CONDITION_STATUS_TRUE,
                "SyncFailed",
                &message,
            );
        });
    }

    /// Retries for the key were exhausted and it was dropped
    pub fn sync_abandoned(&self, err: &Error) {
        let message = err.to_string();
        self.update(|c| {
            set_condition(
                c,
                CONDITION_TYPE_PROGRESSING,
                CONDITION_STATUS_FALSE,
                "RetriesExhausted",
                &message,
            );
            set_condition(
                c,
                CONDITION_TYPE_DEGRADED,
                CONDITION_STATUS_TRUE,
                "RetriesExhausted",
                &message,
            );
        });
    }

    pub fn set_caches_synced(&self) {
        self.caches_synced.store(true, Ordering::Relaxed);
    }

    pub fn caches_synced(&self) -> bool {
        self.caches_synced.load(Ordering::Relaxed)
    }

    pub fn set_bootstrap_complete(&self) {
        self.bootstrap_complete.store(true, Ordering::Relaxed);
    }

    pub fn bootstrap_complete(&self) -> bool {
        self.bootstrap_complete.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            conditions: self
                .conditions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            caches_synced: self.caches_synced(),
            bootstrap_complete: self.bootstrap_complete(),
            last_successful_sync: *self
                .last_successful_sync
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}
