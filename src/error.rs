//! Error type definitions for the address manager.
//!
//! Mutation and selection paths never fail: an unknown endpoint, a
//! rejected insert, or an empty table are all represented as `false` /
//! `None`, per spec §7. The only operations that can actually fail are
//! persistence: reading or writing the on-disk form.

use thiserror::Error;

/// Errors surfaced from [`crate::manager::AddressManager::serialize`] and
/// [`crate::manager::AddressManager::unserialize`].
#[derive(Debug, Error)]
pub enum AddrManError {
    /// The underlying file could not be read or written.
    #[error("address manager I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted file does not have the expected shape: a count
    /// failed to parse, a bucket count mismatched, or a line was missing
    /// fields.
    #[error("corrupt address manager state: {0}")]
    Corrupt(String),
}

/// Result type for the address manager's fallible operations.
pub type AddrManResult<T> = Result<T, AddrManError>;
