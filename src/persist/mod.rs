/// SQLite journal sink.
pub mod sqlite;

use thiserror::Error;

use crate::{core::store::StoreSnapshotV1, op::StoredOp, types::OpSeq};

/// Journal or snapshot failure.
#[derive(Error, Debug)]
pub enum PersistError {
    /// SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload (de)serialization failure.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, including rejected replays and queue overflow.
    #[error("{0}")]
    Message(String),
}

impl From<crate::core::store::StoreError> for PersistError {
    fn from(value: crate::core::store::StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Destination for committed ops.
pub trait OpSink: Send {
    /// Appends `ops` and returns the highest sequence written.
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;
    /// Makes appended ops durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    /// Stores a full image covering ops up to `last_seq`.
    fn write_snapshot(&mut self, _snapshot: &StoreSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }
    /// Drops journal rows up to `seq`; returns how many went.
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
