use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use calculadora_core::{HistoryEntry, HistoryRecorder, NewHistoryEntry};
use rusqlite::{params, Connection};

const SCHEMA_HISTORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS historico (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operando1 REAL NOT NULL,
  operando2 REAL NOT NULL,
  operacao TEXT NOT NULL CHECK (operacao IN ('+', '-', '*', '/')),
  resultado REAL NOT NULL,
  timestamp TEXT
);

DROP INDEX IF EXISTS idx_historico_timestamp;
";

/// `SQLite` history table behind a single long-lived connection.
///
/// The connection is serialized through a mutex so the store can be shared
/// across request handlers; it is closed when the store is dropped.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open or create a `SQLite` history database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens the database and applies the schema in one step.
    ///
    /// # Errors
    /// Returns an error if [`Self::open`] or [`Self::ensure_schema`] fails.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.ensure_schema()?;
        Ok(store)
    }

    /// Creates the `historico` table when absent. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error if the schema statements fail.
    pub fn ensure_schema(&self) -> Result<()> {
        self.connection()?
            .execute_batch(SCHEMA_HISTORY_V1)
            .context("failed to apply history schema")?;
        Ok(())
    }

    /// Inserts one computation with bound parameters and returns the stored row.
    ///
    /// # Errors
    /// Returns an error if the insert fails or does not affect exactly one row.
    pub fn insert(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry> {
        let mut stored = entry.to_entry(None)?;
        let conn = self.connection()?;
        let rows_affected = conn
            .execute(
                "INSERT INTO historico(operando1, operando2, operacao, resultado, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stored.operando1,
                    stored.operando2,
                    stored.operacao,
                    stored.resultado,
                    stored.timestamp
                ],
            )
            .context("failed to insert history row")?;

        if rows_affected != 1 {
            return Err(anyhow!("history insert affected {rows_affected} rows, expected 1"));
        }

        stored.id = Some(conn.last_insert_rowid());
        Ok(stored)
    }

    /// Returns every stored row, newest timestamp first.
    ///
    /// # Errors
    /// Returns an error if the query or row decoding fails.
    pub fn query_all(&self) -> Result<Vec<HistoryEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, operando1, operando2, operacao, resultado, timestamp
                 FROM historico
                 ORDER BY timestamp IS NULL ASC, timestamp DESC, id DESC",
            )
            .context("failed to prepare history query")?;

        let rows = stmt.query_map([], parse_history_row).context("failed to query history")?;
        collect_rows(rows)
    }

    /// # Errors
    /// Returns an error if the count query fails.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .connection()?
            .query_row("SELECT COUNT(*) FROM historico", [], |row| row.get(0))
            .context("failed to count history rows")?;
        usize::try_from(count).context("history row count out of range")
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

impl HistoryRecorder for SqliteHistoryStore {
    fn record(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry> {
        self.insert(entry)
    }

    fn list(&self) -> Result<Vec<HistoryEntry>> {
        self.query_all()
    }
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: Some(row.get(0)?),
        operando1: row.get(1)?,
        operando2: row.get(2)?,
        operacao: row.get(3)?,
        resultado: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
