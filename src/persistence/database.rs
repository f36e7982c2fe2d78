//! SQLite database implementation for persistent storage

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::AppConfiguration;

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "launcher.db";

/// One recorded lifecycle transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: String,
    pub from_state: String,
    pub to_state: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .context(format!("Failed to open database at {:?}", path))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Throwaway database for tests and diagnostics-only runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Lifecycle transitions
            CREATE TABLE IF NOT EXISTS lifecycle_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // === Configuration ===

    /// Load the stored configuration, validated
    pub fn load_configuration(&self) -> Result<Option<AppConfiguration>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_configuration'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut config: AppConfiguration =
                    serde_json::from_str(&json).context("Failed to deserialize configuration")?;
                config.validate();
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    pub fn save_configuration(&self, config: &AppConfiguration) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(config)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_configuration', ?1)",
            params![json],
        )?;
        debug!("Configuration saved");
        Ok(())
    }

    // === Lifecycle history ===

    pub fn record_transition(
        &self,
        session_id: &str,
        from_state: &str,
        to_state: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO lifecycle_history (session_id, from_state, to_state, detail, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                session_id,
                from_state,
                to_state,
                detail,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent transitions, oldest first
    pub fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, from_state, to_state, detail, recorded_at FROM lifecycle_history ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let recorded_at: String = row.get(4)?;
            Ok(HistoryEntry {
                session_id: row.get(0)?,
                from_state: row.get(1)?,
                to_state: row.get(2)?,
                detail: row.get(3)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let mut result = Vec::new();
        for entry in rows {
            result.push(entry?);
        }
        result.reverse();
        Ok(result)
    }

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.lock()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM lifecycle_history WHERE recorded_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}
