//! Cooperative staleness detection for asynchronous session loads.
//!
//! Loading a session's history takes multiple awaits; in that window the
//! user may switch sessions or new data may be written. There is no true
//! cancellation of an in-flight read, so consumers instead take a
//! [`LoadTicket`] before reading and check [`LoadGuard::is_stale`] right
//! before applying the result. A stale result must be discarded without
//! side effects.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters; never persisted, reset on restart.
#[derive(Debug, Default)]
pub struct LoadGuard {
    load_token: AtomicU64,
    mutation_version: AtomicU64,
}

/// Snapshot taken at load initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub session_id: u64,
    pub load_token: u64,
    pub start_mutation_version: u64,
}

impl LoadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a load of `session_id`'s data. Each call issues a strictly
    /// increasing token, invalidating every ticket issued before it.
    pub fn begin_load(&self, session_id: u64) -> LoadTicket {
        let load_token = self.load_token.fetch_add(1, Ordering::SeqCst) + 1;
        LoadTicket {
            session_id,
            load_token,
            start_mutation_version: self.mutation_version.load(Ordering::SeqCst),
        }
    }

    /// Record a successful write of session-scoped data.
    pub fn mark_mutation(&self) {
        self.mutation_version.fetch_add(1, Ordering::SeqCst);
    }

    /// A load is stale when the active session changed, a newer load has
    /// begun, or any mutation landed since the ticket was issued.
    pub fn is_stale(&self, ticket: &LoadTicket, current_session_id: u64) -> bool {
        ticket.session_id != current_session_id
            || ticket.load_token != self.load_token.load(Ordering::SeqCst)
            || ticket.start_mutation_version != self.mutation_version.load(Ordering::SeqCst)
    }

    pub fn current_load_token(&self) -> u64 {
        self.load_token.load(Ordering::SeqCst)
    }

    pub fn mutation_version(&self) -> u64 {
        self.mutation_version.load(Ordering::SeqCst)
    }
}
