//! Informational per-node state for an embedding health responder.
//!
//! The core only maintains the booleans and counters; serving them over
//! HTTP is a collaborator's job.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Health {
    db_ok: AtomicBool,
    cdc_installed: AtomicBool,
    tracked_tables: AtomicUsize,
    schema_mismatch_paused: AtomicBool,
    last_published_at: AtomicI64,
    last_applied_at: AtomicI64,
}

/// Point-in-time copy of the node state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub db_ok: bool,
    pub cdc_installed: bool,
    pub tracked_tables: usize,
    pub schema_current: String,
    pub schema_previous: String,
    pub schema_mismatch_paused: bool,
    /// Microseconds since epoch; 0 when nothing happened yet.
    pub last_published_at: i64,
    pub last_applied_at: i64,
}

impl Health {
    pub fn set_db_ok(&self, ok: bool) {
        self.db_ok.store(ok, Ordering::Relaxed);
    }

    pub fn set_cdc_installed(&self, tables: usize) {
        self.cdc_installed.store(true, Ordering::Relaxed);
        self.tracked_tables.store(tables, Ordering::Relaxed);
    }

    pub fn set_paused(&self, paused: bool) {
        self.schema_mismatch_paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.schema_mismatch_paused.load(Ordering::Relaxed)
    }

    pub fn note_published(&self, at_micros: i64) {
        self.last_published_at.store(at_micros, Ordering::Relaxed);
    }

    pub fn note_applied(&self, at_micros: i64) {
        self.last_applied_at.store(at_micros, Ordering::Relaxed);
    }

    pub fn report(&self, schema_current: String, schema_previous: String) -> HealthReport {
        HealthReport {
            db_ok: self.db_ok.load(Ordering::Relaxed),
            cdc_installed: self.cdc_installed.load(Ordering::Relaxed),
            tracked_tables: self.tracked_tables.load(Ordering::Relaxed),
            schema_current,
            schema_previous,
            schema_mismatch_paused: self.schema_mismatch_paused.load(Ordering::Relaxed),
            last_published_at: self.last_published_at.load(Ordering::Relaxed),
            last_applied_at: self.last_applied_at.load(Ordering::Relaxed),
        }
    }
}
