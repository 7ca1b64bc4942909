// src/error/mod.rs
//
// Crate-wide error types

pub mod types;

pub use types::{AppError, AppResult, DbFault};
