//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Pipeline components call store methods; they never execute SQL directly.
//! Every status change that more than one process can race on is a single
//! conditional UPDATE, so the row count says who won.

use crate::{
    error::{SimError, SimResult},
    types::{BatchStatus, ExecutionMode, RunStatus},
};
use rusqlite::{
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    Connection, ToSql,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

mod batch;
mod message;
mod result;
mod run;

pub use batch::{BatchRow, NewBatch, TeamAggregate};
pub use message::StoredMessage;
pub use result::CompletedRun;
pub use run::{NewRun, RunRow, RunStatusCounts};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle. Clones share one connection; `reopen` gives a thread
/// its own connection to the same file.
#[derive(Clone)]
pub struct SimStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl SimStore {
    pub fn open(path: &str) -> SimResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// A handle for another thread.
    /// File databases get a fresh connection to the same file.
    /// In-memory databases share this handle, since a second `:memory:`
    /// connection would be a different, empty database.
    pub fn reopen(&self) -> SimResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Ok(self.clone()),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SimResult<()> {
        self.conn()?
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> SimResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SimError::Other(anyhow::anyhow!("store connection lock poisoned")))
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Text-backed enums ──────────────────────────────────────────

macro_rules! sql_text_enum {
    ($($ty:ty => $label:literal),* $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                <$ty>::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{raw}'", $label).into())
                })
            }
        }
    )*};
}

sql_text_enum! {
    BatchStatus   => "batch status",
    RunStatus     => "run status",
    ExecutionMode => "execution mode",
}
