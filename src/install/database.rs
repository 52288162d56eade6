// src/install/database.rs

//! Installed-package database
//!
//! SQLite with a versioned schema. The installer is the only writer; it
//! takes [`DatabaseLock`](super::lock::DatabaseLock) around each batch of
//! inserts.

use crate::error::Result;
use crate::spec::Spec;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(version)
}

/// Bring the schema up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    for version in (current + 1)..=SCHEMA_VERSION {
        info!("Applying database migration to version {}", version);
        if version == 1 {
            migrate_v1(conn)?;
        }
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");
    conn.execute_batch(
        "
        CREATE TABLE installed (
            hash TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            prefix TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            explicit INTEGER NOT NULL DEFAULT 0,
            installed_at TEXT NOT NULL
        );

        CREATE INDEX idx_installed_name ON installed(name);
        ",
    )?;
    Ok(())
}

/// A row of the `installed` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub hash: String,
    pub name: String,
    pub version: String,
    pub prefix: PathBuf,
    pub spec_json: String,
    pub explicit: bool,
    pub installed_at: String,
}

impl InstallRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            hash: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            prefix: PathBuf::from(row.get::<_, String>(3)?),
            spec_json: row.get(4)?,
            explicit: row.get(5)?,
            installed_at: row.get(6)?,
        })
    }

    pub fn spec(&self) -> Result<Spec> {
        Spec::from_json(self.spec_json.as_bytes())
    }
}

const COLUMNS: &str = "hash, name, version, prefix, spec_json, explicit, installed_at";

/// Answers "is this hash already installed?" for graph construction
pub trait InstalledSet {
    fn is_installed(&self, hash: &str) -> bool;
}

impl InstalledSet for HashSet<String> {
    fn is_installed(&self, hash: &str) -> bool {
        self.contains(hash)
    }
}

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an installed spec; re-adding refreshes the row
    pub fn add(&self, spec: &Spec, prefix: &Path, explicit: bool) -> Result<()> {
        let spec_json = String::from_utf8_lossy(&spec.to_json()?).into_owned();
        self.conn.execute(
            "INSERT INTO installed (hash, name, version, prefix, spec_json, explicit, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(hash) DO UPDATE SET
                prefix = excluded.prefix,
                spec_json = excluded.spec_json,
                explicit = MAX(installed.explicit, excluded.explicit),
                installed_at = excluded.installed_at",
            params![
                spec.dag_hash(),
                spec.name(),
                spec.version(),
                prefix.to_string_lossy(),
                spec_json,
                explicit,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!("Recorded {} as installed", spec);
        Ok(())
    }

    pub fn get(&self, hash: &str) -> Result<Option<InstallRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM installed WHERE hash = ?1", COLUMNS),
                [hash],
                InstallRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn contains(&self, hash: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM installed WHERE hash = ?1",
            [hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn all(&self) -> Result<Vec<InstallRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM installed ORDER BY name, version", COLUMNS))?;
        let rows = stmt.query_map([], InstallRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn remove(&self, hash: &str) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM installed WHERE hash = ?1", [hash])?
            > 0)
    }
}

impl InstalledSet for Database {
    fn is_installed(&self, hash: &str) -> bool {
        match self.contains(hash) {
            Ok(found) => found,
            Err(e) => {
                warn!("Database lookup for {} failed: {}", hash, e);
                false
            }
        }
    }
}
