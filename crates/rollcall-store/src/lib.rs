//! rollcall-store — SQLite persistence for enrollments, people and attendance.
//!
//! Implements the `rollcall_core` store traits on a single SQLite
//! connection, plus the person-metadata and history queries used by the
//! daemon and the CLI.

pub mod sqlite;

pub use sqlite::SqliteStore;
