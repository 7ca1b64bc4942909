use super::entity::FileRecord;
use crate::domain::{DomainError, DomainResult};

pub const MAX_FILE_NAME_LEN: usize = 255;

/// Validates all FileRecord invariants
pub fn validate_file(file: &FileRecord) -> DomainResult<()> {
    validate_file_name(file)?;
    validate_path(file)?;
    Ok(())
}

/// File name must be a bare, non-empty name
fn validate_file_name(file: &FileRecord) -> DomainResult<()> {
    if file.file_name.trim().is_empty() {
        return Err(DomainError::InvariantViolation(
            "File name cannot be empty".to_string(),
        ));
    }

    if file.file_name.chars().count() > MAX_FILE_NAME_LEN {
        return Err(DomainError::InvariantViolation(format!(
            "File name exceeds {} characters",
            MAX_FILE_NAME_LEN
        )));
    }

    if file.file_name.contains('\0') {
        return Err(DomainError::InvariantViolation(
            "File name cannot contain NUL".to_string(),
        ));
    }

    Ok(())
}

fn validate_path(file: &FileRecord) -> DomainResult<()> {
    if file.path_name.trim().is_empty() {
        return Err(DomainError::InvariantViolation(
            "Storage path cannot be empty".to_string(),
        ));
    }

    Ok(())
}
