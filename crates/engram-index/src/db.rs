use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;

use crate::schema::init_schema;
use crate::{Error, Result};

/// Single-writer handle over the daemon database.
///
/// WAL mode lets API readers run concurrently with the writer; the daemon
/// serializes writes by owning exactly one `Database` behind a lock.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self { conn };
        init_schema(&db.conn)?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        init_schema(&db.conn)?;
        Ok(db)
    }

    /// Quick writability probe used by preflight.
    pub fn check_writable(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _preflight (x INTEGER);
             INSERT INTO _preflight (x) VALUES (1);
             DELETE FROM _preflight;
             DROP TABLE _preflight;",
        )?;
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute("VACUUM", [])?;
        Ok(())
    }
}

/// RFC 3339 with fixed microsecond precision so stored timestamps compare
/// lexicographically.
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes() {
        let db = Database::open_in_memory().unwrap();
        db.check_writable().unwrap();
    }

    #[test]
    fn open_creates_parent_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("deep/nested/brain.db");
        let db = Database::open(&path).unwrap();
        db.check_writable().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn timestamps_compare_lexicographically() {
        let early = format_ts("2026-01-01T00:00:00Z".parse().unwrap());
        let late = format_ts("2026-01-01T00:00:01Z".parse().unwrap());
        assert!(early < late);
        assert!(parse_ts(&early).is_some());
    }
}
