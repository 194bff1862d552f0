pub mod memory;
pub mod redis;
pub mod state;

pub use memory::InMemoryRowStore;
pub use redis::RedisRowStore;
pub use state::{Applied, apply};

use crate::report::ResultRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Processing => "processing",
            RowStatus::Done => "done",
            RowStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RowStatus::Done | RowStatus::Error)
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The externally observable state of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub row_key: String,
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Accept { correlation_id: Option<String> },
    Begin,
    Note(String),
    Complete(Box<ResultRecord>),
    Fail(String),
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Accept { .. } => "accept",
            Transition::Begin => "begin",
            Transition::Note(_) => "note",
            Transition::Complete(_) => "complete",
            Transition::Fail(_) => "fail",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("row {row_key} does not exist")]
    UnknownRow { row_key: String },
    #[error("row {row_key} is already processing")]
    AlreadyProcessing { row_key: String },
    #[error("row {row_key} is {status} and cannot change")]
    Terminal { row_key: String, status: RowStatus },
    #[error("row {row_key} is {status}, not processing")]
    NotProcessing { row_key: String, status: RowStatus },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("row store unavailable: {0}")]
    Backend(String),
    #[error("stored row is unreadable: {0}")]
    Corrupt(String),
    #[error("gave up on row {0} after repeated concurrent updates")]
    Contention(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Row-keyed persistence for `RowRecord`s. `transition` applies one
/// transition atomically and returns the row as stored afterwards.
#[async_trait]
pub trait RowStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, row_key: &str) -> Result<Option<RowRecord>, StoreError>;

    async fn transition(
        &self,
        row_key: &str,
        transition: Transition,
    ) -> Result<RowRecord, RowError>;

    /// Removes a row that is still `pending`, undoing an `Accept` whose run
    /// never got queued. Returns whether a row was removed; rows in any other
    /// state are left alone.
    async fn withdraw(&self, row_key: &str) -> Result<bool, StoreError>;
}
