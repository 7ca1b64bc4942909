// src/db/schema.rs
//
// Idempotent schema bootstrap
//
// Creates the core tables when missing and adds columns introduced by later
// releases to databases created before them. Additive only: nothing here
// drops or renames. Destructive changes belong to versioned migrations.

use log::info;
use rusqlite::Connection;
use std::collections::HashSet;

use crate::error::AppResult;

/// Tables every valid database must contain.
pub const CORE_TABLES: [&str; 2] = ["clients", "files"];

const CREATE_CLIENTS: &str = "CREATE TABLE IF NOT EXISTS clients (
    ID BLOB(16) NOT NULL PRIMARY KEY,
    Name VARCHAR(255) UNIQUE NOT NULL,
    PublicKey BLOB(160),
    LastSeen TEXT NOT NULL,
    AESKey BLOB(32)
)";

const CREATE_FILES: &str = "CREATE TABLE IF NOT EXISTS files (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    FileName VARCHAR(255) NOT NULL,
    PathName VARCHAR(255) NOT NULL,
    Verified BOOLEAN NOT NULL DEFAULT 0,
    FileSize INTEGER,
    ModificationDate TEXT,
    CRC INTEGER,
    ClientID BLOB(16) NOT NULL,
    UNIQUE (ClientID, FileName),
    FOREIGN KEY (ClientID) REFERENCES clients(ID) ON DELETE CASCADE
)";

/// A column that older databases may lack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnUpgrade {
    pub table: &'static str,
    pub column: &'static str,
    /// Type and constraints used in `ALTER TABLE ... ADD COLUMN`
    pub definition: &'static str,
}

impl ColumnUpgrade {
    fn alter_sql(&self) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.table, self.column, self.definition
        )
    }
}

/// Columns added after the first release, oldest first.
pub const COLUMN_UPGRADES: &[ColumnUpgrade] = &[
    ColumnUpgrade {
        table: "clients",
        column: "AESKey",
        definition: "BLOB(32)",
    },
    ColumnUpgrade {
        table: "files",
        column: "FileSize",
        definition: "INTEGER",
    },
    ColumnUpgrade {
        table: "files",
        column: "ModificationDate",
        definition: "TEXT",
    },
    ColumnUpgrade {
        table: "files",
        column: "CRC",
        definition: "INTEGER",
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub created_tables: Vec<String>,
    /// `table.column` for every column added
    pub added_columns: Vec<String>,
}

impl BootstrapReport {
    pub fn is_noop(&self) -> bool {
        self.created_tables.is_empty() && self.added_columns.is_empty()
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

/// Lower-cased column names of `table`.
fn existing_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .map(|name| name.map(|n| n.to_ascii_lowercase()))
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

/// Upgrades whose column is absent from an existing table.
pub fn missing_columns(conn: &Connection) -> AppResult<Vec<ColumnUpgrade>> {
    let mut missing = Vec::new();
    for table in CORE_TABLES {
        if !table_exists(conn, table)? {
            continue;
        }
        let present = existing_columns(conn, table)?;
        missing.extend(
            COLUMN_UPGRADES
                .iter()
                .filter(|upgrade| upgrade.table == table)
                .filter(|upgrade| !present.contains(&upgrade.column.to_ascii_lowercase()))
                .copied(),
        );
    }
    Ok(missing)
}

/// Create missing tables and add missing columns.
///
/// Safe to run on every startup. Existing rows are preserved; added columns
/// are NULL for them.
pub fn bootstrap_schema(conn: &Connection) -> AppResult<BootstrapReport> {
    let tx = conn.unchecked_transaction()?;
    let mut report = BootstrapReport::default();

    for (table, ddl) in [("clients", CREATE_CLIENTS), ("files", CREATE_FILES)] {
        if !table_exists(&tx, table)? {
            tx.execute_batch(ddl)?;
            report.created_tables.push(table.to_string());
        }
    }

    for upgrade in missing_columns(&tx)? {
        tx.execute_batch(&upgrade.alter_sql())?;
        report
            .added_columns
            .push(format!("{}.{}", upgrade.table, upgrade.column));
    }

    tx.commit()?;

    if report.is_noop() {
        log::debug!("schema bootstrap: nothing to do");
    } else {
        info!(
            "schema bootstrap created {:?}, added columns {:?}",
            report.created_tables, report.added_columns
        );
    }
    Ok(report)
}
