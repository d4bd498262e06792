//! Per-session and per-day guard against double credit.

use chrono::NaiveDate;
use rollcall_core::{AttendanceStore, StoreError};
use std::collections::HashSet;

/// Guards against crediting the same person twice.
///
/// Two checks must both pass: the id is not yet credited in this session,
/// and the store holds no record for it today. The guard lives exactly as
/// long as one active session.
#[derive(Debug, Default)]
pub struct DedupGuard {
    credited: HashSet<String>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-day check. It is a store read, so callers run it without
    /// holding the session lock.
    pub fn recorded_in_store<S>(id: &str, store: &S, today: NaiveDate) -> Result<bool, StoreError>
    where
        S: AttendanceStore + ?Sized,
    {
        let recorded = store.exists_for_date(id, today)?;
        if recorded {
            tracing::debug!(id, %today, "already recorded today");
        }
        Ok(recorded)
    }

    /// Credit `id` for the rest of the session. Returns `false` if it already was.
    pub fn record_marked(&mut self, id: &str) -> bool {
        self.credited.insert(id.to_string())
    }

    /// Undo [`record_marked`](Self::record_marked) after a failed write.
    pub(crate) fn withdraw(&mut self, id: &str) {
        self.credited.remove(id);
    }

    pub fn is_credited(&self, id: &str) -> bool {
        self.credited.contains(id)
    }

    pub fn credited_count(&self) -> usize {
        self.credited.len()
    }
}
