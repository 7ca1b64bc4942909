// src/domain/mod.rs
//
// Domain Root - records persisted by the server and their invariants
//
// All other modules import from `crate::domain::*`

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod client;
pub mod file;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Client Domain
pub use client::{validate_client, ClientRecord};

// File Domain
pub use file::{validate_file, FileRecord};

// ============================================================================
// DOMAIN ERROR TYPES
// ============================================================================

use thiserror::Error;

/// Domain-level errors
/// These represent violations of business rules and invariants
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Domain result type
pub type DomainResult<T> = Result<T, DomainError>;
