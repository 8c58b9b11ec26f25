//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when constructing domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Address is not a colon-separated hexadecimal Bluetooth address
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// RFCOMM channel outside the protocol's 1..=30 range
    #[error("Invalid RFCOMM channel {0} (expected 1-30)")]
    InvalidChannel(u16),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
