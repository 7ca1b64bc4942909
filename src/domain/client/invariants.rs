use super::entity::ClientRecord;
use crate::domain::{DomainError, DomainResult};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_PUBLIC_KEY_LEN: usize = 160;
/// AES-128, AES-192 and AES-256 key sizes
pub const SESSION_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Validates all ClientRecord invariants
pub fn validate_client(client: &ClientRecord) -> DomainResult<()> {
    validate_name(client)?;
    validate_keys(client)?;
    Ok(())
}

fn validate_name(client: &ClientRecord) -> DomainResult<()> {
    if client.name.trim().is_empty() {
        return Err(DomainError::InvariantViolation(
            "Client name cannot be empty".to_string(),
        ));
    }

    if client.name.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::InvariantViolation(format!(
            "Client name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }

    if client.name.chars().any(char::is_control) {
        return Err(DomainError::InvariantViolation(
            "Client name cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_keys(client: &ClientRecord) -> DomainResult<()> {
    if let Some(key) = &client.public_key {
        if key.is_empty() || key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(DomainError::InvariantViolation(format!(
                "Public key must be 1..={} bytes, got {}",
                MAX_PUBLIC_KEY_LEN,
                key.len()
            )));
        }
    }

    if let Some(key) = &client.session_key {
        if !SESSION_KEY_LENGTHS.contains(&key.len()) {
            return Err(DomainError::InvariantViolation(format!(
                "Session key must be 16, 24 or 32 bytes, got {}",
                key.len()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_client() {
        let mut client = ClientRecord::new("alice");
        client.set_public_key(vec![7; 160]);
        client.set_session_key(vec![1; 32]);
        assert!(validate_client(&client).is_ok());
    }

    #[test]
    fn test_empty_name_fails() {
        let client = ClientRecord::new("   ");
        let result = validate_client(&client);

        if let Err(DomainError::InvariantViolation(msg)) = result {
            assert!(msg.contains("cannot be empty"));
        } else {
            panic!("Expected InvariantViolation error");
        }
    }

    #[test]
    fn test_long_name_fails() {
        let client = ClientRecord::new("x".repeat(256));
        assert!(validate_client(&client).is_err());
    }

    #[test]
    fn test_bad_key_sizes_fail() {
        let mut client = ClientRecord::new("bob");
        client.set_public_key(vec![0; 161]);
        assert!(validate_client(&client).is_err());

        let mut client = ClientRecord::new("bob");
        client.set_session_key(vec![0; 20]);
        assert!(validate_client(&client).is_err());
    }
}
