// src/db/catalog.rs
//
// Identifier validation against the live catalog.
//
// Table and column names cannot be bound as SQL parameters. Any name that
// arrives at runtime is first matched against `sqlite_master` or
// `pragma_table_info`, and only the validated wrapper types can produce
// quoted identifiers for interpolation. Values are always bound.

use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{AppError, AppResult};

/// A table name known to exist in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

/// A column name known to exist in a validated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnName(String);

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// Column headers plus rows rendered as JSON values (blobs hex-encoded).
#[derive(Debug, Clone, Serialize)]
pub struct TableContent {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// User tables in the database, sorted by name.
pub fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl TableName {
    /// Validate `name` against the catalog.
    pub fn resolve(conn: &Connection, name: &str) -> AppResult<Self> {
        let tables = list_tables(conn)?;
        tables
            .into_iter()
            .find(|table| table == name)
            .map(TableName)
            .ok_or_else(|| AppError::InvalidIdentifier(format!("unknown table '{}'", name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form for interpolation into SQL text.
    pub fn quoted(&self) -> String {
        quote_identifier(&self.0)
    }

    pub fn columns(&self, conn: &Connection) -> AppResult<Vec<ColumnInfo>> {
        let mut stmt = conn.prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let columns = stmt
            .query_map([&self.0], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    primary_key: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Validate a column of this table. Matching is case-insensitive, like
    /// SQLite itself.
    pub fn column(&self, conn: &Connection, name: &str) -> AppResult<ColumnName> {
        self.columns(conn)?
            .into_iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
            .map(|column| ColumnName(column.name))
            .ok_or_else(|| {
                AppError::InvalidIdentifier(format!("unknown column '{}' in table '{}'", name, self.0))
            })
    }
}

impl ColumnName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        quote_identifier(&self.0)
    }
}

/// Render a stored value for read-only consumers.
pub fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(hex::encode(bytes)),
    }
}

/// Read every row of a validated table.
pub fn read_table(conn: &Connection, table: &TableName) -> AppResult<TableContent> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table.quoted()))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let width = columns.len();

    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(value_to_json))
                .collect::<Result<Vec<_>, _>>()
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TableContent {
        table: table.as_str().to_string(),
        columns,
        rows,
    })
}

/// Update one column of the rows whose `key_column` equals `key`.
pub fn update_row(
    conn: &Connection,
    table: &TableName,
    key_column: &ColumnName,
    key: &Value,
    column: &ColumnName,
    value: &Value,
) -> rusqlite::Result<usize> {
    let sql = format!(
        "UPDATE {} SET {} = ?1 WHERE {} = ?2",
        table.quoted(),
        column.quoted(),
        key_column.quoted()
    );
    conn.execute(&sql, rusqlite::params![value, key])
}

/// Delete the rows whose `key_column` equals `key`.
pub fn delete_row(
    conn: &Connection,
    table: &TableName,
    key_column: &ColumnName,
    key: &Value,
) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {} WHERE {} = ?1", table.quoted(), key_column.quoted());
    conn.execute(&sql, rusqlite::params![key])
}
