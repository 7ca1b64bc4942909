// src/repositories/columns.rs
//
// Column decoding shared by the repositories. Malformed stored values are
// explicit conversion errors; nothing falls back to a default.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use uuid::Uuid;

fn invalid_data(index: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// UUID stored as a 16-byte blob.
pub fn uuid_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let bytes: Vec<u8> = row.get(index)?;
    Uuid::from_slice(&bytes).map_err(|e| {
        invalid_data(
            index,
            Type::Blob,
            format!("Invalid id blob ({} bytes): {}", bytes.len(), e),
        )
    })
}

/// RFC 3339 timestamp stored as text.
pub fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(index, &raw)
}

pub fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(index)? {
        Some(raw) => parse_timestamp(index, &raw).map(Some),
        None => Ok(None),
    }
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid_data(index, Type::Text, format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Non-negative integer column that must fit `T`.
pub fn unsigned_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<T>>
where
    T: TryFrom<i64>,
{
    match row.get::<_, Option<i64>>(index)? {
        Some(raw) => T::try_from(raw)
            .map(Some)
            .map_err(|_| invalid_data(index, Type::Integer, format!("Value {} out of range", raw))),
        None => Ok(None),
    }
}
