//! Persistence layer - SQLite storage for configuration and lifecycle history

mod database;

pub use database::{Database, HistoryEntry, DATABASE_FILE};
