//! Error types for the runtime core.
//!
//! The track loops never let an error escape: pipeline failures are converted
//! into `halt_and_fallback` decisions and recorded rows. These typed variants
//! cover the boundaries where an error is still a Rust error — storage setup,
//! state file IO, and provider transport.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResidentError {
    /// Database connection, schema, or query failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// State file read/write failure.
    #[error("state file error: {0}")]
    StateFile(#[from] std::io::Error),

    /// Provider call failed across all endpoint variants. Carried inline by
    /// the router and recorded in `orchestration.last_error`; never raised
    /// out of a track loop.
    #[error("provider error: {0}")]
    Provider(String),

    /// A typed contract failed schema/range validation.
    #[error("contract validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ResidentError>;
