use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, Serialize)]
pub enum Error {
    #[error("lock wait timed out: tx {tx_id} on {resource}")]
    LockTimeout { tx_id: u64, resource: String },

    #[error("transaction {tx_id} aborted as deadlock victim")]
    DeadlockAborted { tx_id: u64 },

    #[error("serialization failure: tx {tx_id} conflicts with committed tx {conflicting_tx}")]
    SerializationFailure { tx_id: u64, conflicting_tx: u64 },

    #[error("foreign key violation: {table}.{column} references {parent_table}")]
    ForeignKeyViolation {
        table: String,
        column: String,
        parent_table: String,
    },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("transaction {id} not found")]
    TransactionNotFound { id: u64 },

    #[error("transaction limit reached: {limit}")]
    TransactionLimitReached { limit: usize },

    #[error("table {name} not found")]
    TableNotFound { name: String },

    #[error("table {name} already exists")]
    TableExists { name: String },

    #[error("row not found in {table}")]
    RowNotFound { table: String },

    #[error("duplicate key in {table}")]
    DuplicateKey { table: String },
}

impl Error {
    /// Whether the caller may retry the whole transaction from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::DeadlockAborted { .. }
                | Error::SerializationFailure { .. }
        )
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            reason: reason.into(),
        }
    }
}
