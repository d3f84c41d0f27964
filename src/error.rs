use thiserror::Error;

/// Error taxonomy for the wish ledger core.
///
/// Variants carry their detail as owned strings so results can be cloned and
/// fanned out to concurrent cache waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WishError {
    /// The referenced banner does not exist. Used by both read and write paths.
    #[error("banner not found: {0}")]
    NotFound(String),

    /// A pull record in a write payload has the wrong shape.
    #[error("invalid wish data: {0}")]
    InvalidInput(String),

    /// The persistence layer failed during the atomic replace. The transaction
    /// has been rolled back; no partial write is visible.
    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    /// The aggregate tally computation failed.
    #[error("tally computation failed: {0}")]
    ComputationFailure(String),
}

impl From<rusqlite::Error> for WishError {
    fn from(err: rusqlite::Error) -> Self {
        WishError::TransactionFailure(err.to_string())
    }
}
