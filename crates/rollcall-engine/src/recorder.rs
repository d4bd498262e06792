//! Turning one query embedding into at most one attendance record.

use crate::dedup::DedupGuard;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rollcall_core::{
    AttendanceRecord, AttendanceStore, CosineMatcher, Embedding, Gallery, Match, Matcher,
    StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Result of processing one query embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// A new record was written for `id`.
    Credited { id: String, confidence: f32 },
    /// `id` matched but was already credited this session or today.
    AlreadyCredited { id: String },
    /// The gallery was scanned and nothing was under the threshold.
    NoMatch,
    /// Nothing is enrolled; no comparison was made.
    EmptyGallery,
}

/// A query after the in-memory checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Screening {
    /// Decided without the store.
    Settled(Outcome),
    /// Matched an id not yet credited this session; the per-day store
    /// check is still to come.
    Candidate(Match),
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("attendance lookup failed for {id}: {source}")]
    DedupCheck { id: String, source: StoreError },
    #[error("failed to persist attendance for {id}: {source}")]
    Persist { id: String, source: StoreError },
}

/// Orchestrates matcher, dedup guard and attendance store.
pub struct AttendanceRecorder<S, M = CosineMatcher> {
    store: Arc<S>,
    matcher: M,
    threshold: f32,
}

impl<S> AttendanceRecorder<S, CosineMatcher> {
    pub fn new(store: Arc<S>, threshold: f32) -> Self {
        Self::with_matcher(store, CosineMatcher, threshold)
    }
}

impl<S, M> AttendanceRecorder<S, M> {
    pub fn with_matcher(store: Arc<S>, matcher: M, threshold: f32) -> Self {
        Self {
            store,
            matcher,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl<S, M> AttendanceRecorder<S, M>
where
    S: AttendanceStore,
    M: Matcher,
{
    /// Match `query` against `gallery` and record attendance if allowed.
    ///
    /// Runs [`screen`](Self::screen), [`recorded_on`](Self::recorded_on) and
    /// [`commit`](Self::commit) back to back. Callers that must not hold a
    /// lock across store reads call the three steps themselves.
    pub fn process(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        guard: &mut DedupGuard,
        now: NaiveDateTime,
    ) -> Result<Outcome, RecordError> {
        let best = match self.screen(query, gallery, guard) {
            Screening::Settled(outcome) => return Ok(outcome),
            Screening::Candidate(best) => best,
        };
        if self.recorded_on(&best.id, now.date())? {
            return Ok(Outcome::AlreadyCredited { id: best.id });
        }
        self.commit(best, guard, now)
    }

    /// Everything that can be decided without touching the store: the
    /// empty-gallery shortcut, matching, and the session-local credit check.
    pub fn screen(&self, query: &Embedding, gallery: &Gallery, guard: &DedupGuard) -> Screening {
        if gallery.is_empty() {
            return Screening::Settled(Outcome::EmptyGallery);
        }

        let result = self.matcher.best_match(query, gallery, self.threshold);
        if result.skipped > 0 {
            tracing::warn!(
                skipped = result.skipped,
                compared = result.compared,
                "enrollments skipped on dimension mismatch"
            );
        }
        match result.best {
            None => Screening::Settled(Outcome::NoMatch),
            Some(best) if guard.is_credited(&best.id) => {
                tracing::debug!(id = %best.id, "already credited this session");
                Screening::Settled(Outcome::AlreadyCredited { id: best.id })
            }
            Some(best) => Screening::Candidate(best),
        }
    }

    /// Whether the store already holds a record for `id` on `date`.
    pub fn recorded_on(&self, id: &str, date: NaiveDate) -> Result<bool, RecordError> {
        DedupGuard::recorded_in_store(id, self.store.as_ref(), date).map_err(|source| {
            RecordError::DedupCheck {
                id: id.to_string(),
                source,
            }
        })
    }

    /// Credit `best` in `guard` and write its record.
    ///
    /// The id is credited before the store write; if the write fails the
    /// credit is withdrawn so a later frame can retry.
    pub fn commit(
        &self,
        best: Match,
        guard: &mut DedupGuard,
        now: NaiveDateTime,
    ) -> Result<Outcome, RecordError> {
        guard.record_marked(&best.id);
        let record = AttendanceRecord {
            person_id: best.id.clone(),
            date: now.date(),
            time: now.time().with_nanosecond(0).unwrap_or(now.time()),
            confidence: best.confidence,
            photo_path: None,
        };

        match self.store.insert(&record) {
            Ok(true) => {
                tracing::info!(
                    id = %best.id,
                    confidence = best.confidence,
                    distance = best.distance,
                    "attendance recorded"
                );
                Ok(Outcome::Credited {
                    id: best.id,
                    confidence: best.confidence,
                })
            }
            Ok(false) => {
                tracing::debug!(id = %best.id, "record already present at insert");
                Ok(Outcome::AlreadyCredited { id: best.id })
            }
            Err(source) => {
                guard.withdraw(&best.id);
                Err(RecordError::Persist {
                    id: best.id,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Enrollment, MatchResult, MemoryStore};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 4)
            .unwrap()
            .and_hms_milli_opt(8, 15, 30, 250)
            .unwrap()
    }

    fn gallery(entries: &[(&str, Vec<f32>)]) -> Gallery {
        Gallery::from_enrollments(entries.iter().map(|(id, v)| Enrollment {
            id: id.to_string(),
            embedding: Embedding::from_normalized(v.clone()),
        }))
    }

    fn query(v: Vec<f32>) -> Embedding {
        Embedding::from_normalized(v)
    }

    struct CountingMatcher {
        calls: Cell<usize>,
    }

    impl Matcher for CountingMatcher {
        fn best_match(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
            self.calls.set(self.calls.get() + 1);
            CosineMatcher.best_match(query, gallery, threshold)
        }
    }

    /// Accepts reads, fails writes while `fail_writes` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl AttendanceStore for FlakyStore {
        fn exists_for_date(&self, id: &str, date: NaiveDate) -> Result<bool, StoreError> {
            self.inner.exists_for_date(id, date)
        }
        fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.insert(record)
        }
        fn delete_all_attendance(&self) -> Result<usize, StoreError> {
            self.inner.delete_all_attendance()
        }
    }

    #[test]
    fn test_empty_gallery_skips_matcher() {
        let matcher = CountingMatcher { calls: Cell::new(0) };
        let recorder =
            AttendanceRecorder::with_matcher(Arc::new(MemoryStore::new()), matcher, 1.0);
        let outcome = recorder
            .process(&query(vec![1.0, 0.0]), &Gallery::default(), &mut DedupGuard::new(), now())
            .unwrap();
        assert_eq!(outcome, Outcome::EmptyGallery);
        assert_eq!(recorder.matcher.calls.get(), 0);
    }

    #[test]
    fn test_no_match_is_not_an_error() {
        let recorder = AttendanceRecorder::new(Arc::new(MemoryStore::new()), 0.5);
        let outcome = recorder
            .process(
                &query(vec![1.0, 0.0]),
                &gallery(&[("a", vec![0.0, 1.0])]),
                &mut DedupGuard::new(),
                now(),
            )
            .unwrap();
        assert_eq!(outcome, Outcome::NoMatch);
    }

    #[test]
    fn test_orthogonal_gallery_credits_exact_match() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AttendanceRecorder::new(Arc::clone(&store), 1.0);
        let outcome = recorder
            .process(
                &query(vec![1.0, 0.0]),
                &gallery(&[("A", vec![1.0, 0.0]), ("B", vec![0.0, 1.0])]),
                &mut DedupGuard::new(),
                now(),
            )
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Credited {
                id: "A".into(),
                confidence: 1.0
            }
        );
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].person_id, "A");
        assert_eq!(records[0].date, now().date());
        assert_eq!(records[0].time.to_string(), "08:15:30");
    }

    #[test]
    fn test_second_match_in_session_is_already_credited() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AttendanceRecorder::new(Arc::clone(&store), 1.0);
        let g = gallery(&[("a", vec![1.0, 0.0])]);
        let mut guard = DedupGuard::new();

        let first = recorder.process(&query(vec![1.0, 0.0]), &g, &mut guard, now()).unwrap();
        let second = recorder.process(&query(vec![1.0, 0.0]), &g, &mut guard, now()).unwrap();

        assert!(matches!(first, Outcome::Credited { ref id, .. } if id == "a"));
        assert_eq!(second, Outcome::AlreadyCredited { id: "a".into() });
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn test_record_from_earlier_session_blocks_credit() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AttendanceRecorder::new(Arc::clone(&store), 1.0);
        let g = gallery(&[("a", vec![1.0, 0.0])]);

        recorder.process(&query(vec![1.0, 0.0]), &g, &mut DedupGuard::new(), now()).unwrap();
        let fresh_session = recorder
            .process(&query(vec![1.0, 0.0]), &g, &mut DedupGuard::new(), now())
            .unwrap();
        assert_eq!(fresh_session, Outcome::AlreadyCredited { id: "a".into() });
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn test_screen_leaves_store_check_to_caller() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AttendanceRecorder::new(Arc::clone(&store), 1.0);
        let g = gallery(&[("a", vec![1.0, 0.0])]);
        recorder.process(&query(vec![1.0, 0.0]), &g, &mut DedupGuard::new(), now()).unwrap();

        // A fresh guard still yields a candidate; only the store knows about "a".
        let mut guard = DedupGuard::new();
        let Screening::Candidate(best) = recorder.screen(&query(vec![1.0, 0.0]), &g, &guard) else {
            panic!("expected a candidate");
        };
        assert_eq!(best.id, "a");
        assert!(recorder.recorded_on("a", now().date()).unwrap());

        guard.record_marked("a");
        assert_eq!(
            recorder.screen(&query(vec![1.0, 0.0]), &g, &guard),
            Screening::Settled(Outcome::AlreadyCredited { id: "a".into() })
        );
        assert_eq!(
            recorder.screen(&query(vec![1.0, 0.0]), &Gallery::default(), &guard),
            Screening::Settled(Outcome::EmptyGallery)
        );
    }

    #[test]
    fn test_failed_write_withdraws_session_credit() {
        let store = Arc::new(FlakyStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let recorder = AttendanceRecorder::new(Arc::clone(&store), 1.0);
        let g = gallery(&[("a", vec![1.0, 0.0])]);
        let mut guard = DedupGuard::new();

        let err = recorder.process(&query(vec![1.0, 0.0]), &g, &mut guard, now());
        assert!(matches!(err, Err(RecordError::Persist { ref id, .. }) if id == "a"));
        assert!(!guard.is_credited("a"));

        store.fail_writes.store(false, Ordering::SeqCst);
        let retry = recorder.process(&query(vec![1.0, 0.0]), &g, &mut guard, now()).unwrap();
        assert!(matches!(retry, Outcome::Credited { .. }));
        assert!(guard.is_credited("a"));
    }
}
