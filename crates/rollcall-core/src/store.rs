//! Persistence contracts for enrollments and attendance, plus an in-memory backend.
//!
//! All methods are blocking. Callers on an async runtime must move them onto
//! a blocking thread.

use crate::types::{AttendanceRecord, Embedding, Enrollment};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row for {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Source of the gallery loaded at session start.
pub trait GalleryStore {
    /// Every readable enrollment. Rows that cannot be decoded are skipped
    /// with a warning; only a failure of the store itself is an error.
    fn load_all_enrollments(&self) -> Result<Vec<Enrollment>, StoreError>;
}

/// Write side of the enrollment table.
pub trait EnrollmentStore {
    /// Insert or replace the embedding for `id`.
    fn upsert(&self, id: &str, embedding: &Embedding) -> Result<(), StoreError>;
    /// Returns whether an enrollment existed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
    /// Returns the number of enrollments removed.
    fn delete_all(&self) -> Result<usize, StoreError>;
}

/// Attendance records, at most one per (person, date).
pub trait AttendanceStore {
    fn exists_for_date(&self, person_id: &str, date: NaiveDate) -> Result<bool, StoreError>;
    /// Insert-if-absent. Returns `false` when a record for the same
    /// (person, date) already exists and nothing was written.
    fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError>;
    /// Returns the number of records removed.
    fn delete_all_attendance(&self) -> Result<usize, StoreError>;
}

/// Process-local store used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    enrollments: BTreeMap<String, Embedding>,
    attendance: Vec<AttendanceRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored attendance record, in insertion order.
    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.lock().attendance.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl GalleryStore for MemoryStore {
    fn load_all_enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
        Ok(self
            .lock()
            .enrollments
            .iter()
            .map(|(id, embedding)| Enrollment {
                id: id.clone(),
                embedding: embedding.clone(),
            })
            .collect())
    }
}

impl EnrollmentStore for MemoryStore {
    fn upsert(&self, id: &str, embedding: &Embedding) -> Result<(), StoreError> {
        self.lock()
            .enrollments
            .insert(id.to_string(), embedding.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().enrollments.remove(id).is_some())
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let n = inner.enrollments.len();
        inner.enrollments.clear();
        Ok(n)
    }
}

impl AttendanceStore for MemoryStore {
    fn exists_for_date(&self, person_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .attendance
            .iter()
            .any(|r| r.person_id == person_id && r.date == date))
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let exists = inner
            .attendance
            .iter()
            .any(|r| r.person_id == record.person_id && r.date == record.date);
        if exists {
            return Ok(false);
        }
        inner.attendance.push(record.clone());
        Ok(true)
    }

    fn delete_all_attendance(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let n = inner.attendance.len();
        inner.attendance.clear();
        Ok(n)
    }
}
