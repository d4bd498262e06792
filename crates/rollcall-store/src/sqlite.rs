use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use rollcall_core::{
    AttendanceRecord, AttendanceStore, Embedding, Enrollment, EnrollmentStore, GalleryStore,
    Person, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS enrollments (
    id          TEXT PRIMARY KEY NOT NULL,
    dim         INTEGER NOT NULL,
    embedding   BLOB NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS people (
    id           TEXT PRIMARY KEY NOT NULL,
    name         TEXT NOT NULL,
    group_name   TEXT NOT NULL DEFAULT '',
    photo_path   TEXT,
    enrolled_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    row         INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id   TEXT NOT NULL,
    date        TEXT NOT NULL,
    time        TEXT NOT NULL,
    confidence  REAL NOT NULL,
    photo_path  TEXT,
    UNIQUE (person_id, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance (date);
";

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("{}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path).map_err(backend)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write a person and their embedding together, replacing any previous enrollment.
    pub fn enroll(&self, person: &Person, embedding: &Embedding) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;
        upsert_embedding(&tx, &person.id, embedding)?;
        tx.execute(
            "INSERT INTO people (id, name, group_name, photo_path, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                group_name = excluded.group_name,
                photo_path = excluded.photo_path,
                enrolled_at = excluded.enrolled_at",
            params![
                person.id,
                person.name,
                person.group,
                person.photo_path,
                person.enrolled_at.to_rfc3339(),
            ],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)
    }

    /// All people, ordered by id.
    pub fn people(&self) -> Result<Vec<Person>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, group_name, photo_path, enrolled_at
                 FROM people ORDER BY id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend)?;

        let mut people = Vec::new();
        for row in rows {
            let (id, name, group, photo_path, enrolled_at) = row.map_err(backend)?;
            let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_at)
                .map_err(|e| StoreError::Corrupt {
                    id: id.clone(),
                    reason: format!("enrolled_at {enrolled_at:?}: {e}"),
                })?
                .with_timezone(&Local);
            people.push(Person {
                id,
                name,
                group,
                photo_path,
                enrolled_at,
            });
        }
        Ok(people)
    }

    /// Delete a person and their enrollment. Attendance history is kept.
    ///
    /// Returns whether anything was removed.
    pub fn remove_person(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;
        let people = tx
            .execute("DELETE FROM people WHERE id = ?1", params![id])
            .map_err(backend)?;
        let enrollments = tx
            .execute("DELETE FROM enrollments WHERE id = ?1", params![id])
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(people + enrollments > 0)
    }

    /// Delete every person and enrollment. Returns the number of people removed.
    pub fn clear_people(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;
        let removed = tx.execute("DELETE FROM people", []).map_err(backend)?;
        tx.execute("DELETE FROM enrollments", []).map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(removed)
    }

    /// Records for one day, newest first.
    pub fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            "SELECT person_id, date, time, confidence, photo_path FROM attendance
             WHERE date = ?1 ORDER BY time DESC, row DESC",
            &[&date.format(DATE_FMT).to_string()],
        )
    }

    /// Every record, newest first.
    pub fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            "SELECT person_id, date, time, confidence, photo_path FROM attendance
             ORDER BY date DESC, time DESC, row DESC",
            &[],
        )
    }

    pub fn count_for_date(&self, date: NaiveDate) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                params![date.format(DATE_FMT).to_string()],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(count as usize)
    }

    fn query_records(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(backend)?;

        let mut records = Vec::new();
        for row in rows {
            let (person_id, date, time, confidence, photo_path) = row.map_err(backend)?;
            let corrupt = |reason: String| StoreError::Corrupt {
                id: person_id.clone(),
                reason,
            };
            let date = NaiveDate::parse_from_str(&date, DATE_FMT)
                .map_err(|e| corrupt(format!("date {date:?}: {e}")))?;
            let time = NaiveTime::parse_from_str(&time, TIME_FMT)
                .map_err(|e| corrupt(format!("time {time:?}: {e}")))?;
            records.push(AttendanceRecord {
                person_id,
                date,
                time,
                confidence: confidence as f32,
                photo_path,
            });
        }
        Ok(records)
    }
}

fn upsert_embedding(conn: &Connection, id: &str, embedding: &Embedding) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO enrollments (id, dim, embedding, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            dim = excluded.dim,
            embedding = excluded.embedding,
            updated_at = excluded.updated_at",
        params![
            id,
            embedding.dim() as i64,
            encode_embedding(embedding.values()),
            Local::now().to_rfc3339(),
        ],
    )
    .map_err(backend)?;
    Ok(())
}

/// Little-endian f32s, four bytes each.
fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8], dim: usize) -> Result<Vec<f32>, String> {
    let expected = dim * std::mem::size_of::<f32>();
    if blob.len() != expected {
        return Err(format!(
            "embedding blob is {} bytes, expected {expected} for dim {dim}",
            blob.len()
        ));
    }
    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err("embedding contains non-finite values".to_string());
    }
    Ok(values)
}

impl GalleryStore for SqliteStore {
    fn load_all_enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, dim, embedding FROM enrollments ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(backend)?;

        let mut enrollments = Vec::new();
        for row in rows {
            let (id, dim, blob) = row.map_err(backend)?;
            let decoded = usize::try_from(dim)
                .map_err(|_| format!("negative dim {dim}"))
                .and_then(|dim| decode_embedding(&blob, dim));
            let values = match decoded {
                Ok(values) => values,
                Err(reason) => {
                    // One bad row must not take the whole gallery down.
                    tracing::warn!(id = %id, %reason, "skipping corrupt enrollment");
                    continue;
                }
            };
            enrollments.push(Enrollment {
                id,
                embedding: Embedding::from_normalized(values),
            });
        }
        tracing::debug!(count = enrollments.len(), "loaded enrollments");
        Ok(enrollments)
    }
}

impl EnrollmentStore for SqliteStore {
    fn upsert(&self, id: &str, embedding: &Embedding) -> Result<(), StoreError> {
        upsert_embedding(&self.conn(), id, embedding)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM enrollments WHERE id = ?1", params![id])
            .map_err(backend)?;
        Ok(removed > 0)
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        self.conn()
            .execute("DELETE FROM enrollments", [])
            .map_err(backend)
    }
}

impl AttendanceStore for SqliteStore {
    fn exists_for_date(&self, person_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM attendance WHERE person_id = ?1 AND date = ?2",
                params![person_id, date.format(DATE_FMT).to_string()],
                |_| Ok(()),
            )
            .optional()
            .map_err(backend)?;
        Ok(found.is_some())
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        let written = self
            .conn()
            .execute(
                "INSERT INTO attendance (person_id, date, time, confidence, photo_path)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(person_id, date) DO NOTHING",
                params![
                    record.person_id,
                    record.date.format(DATE_FMT).to_string(),
                    record.time.format(TIME_FMT).to_string(),
                    f64::from(record.confidence),
                    record.photo_path,
                ],
            )
            .map_err(backend)?;
        Ok(written == 1)
    }

    fn delete_all_attendance(&self) -> Result<usize, StoreError> {
        self.conn()
            .execute("DELETE FROM attendance", [])
            .map_err(backend)
    }
}
