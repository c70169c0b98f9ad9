use thiserror::Error;

use crate::ledger::{EntityId, FileId, GroupId};

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the drive core.
///
/// Synchronous operations return these directly. Failures inside the
/// synchronizer are asynchronous and travel over the notification bus
/// instead; `TransientSync` marks a refresh that left the cache on its
/// previous state and will be retried by the next event for the same file,
/// `FatalSync` a startup that must be retried by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("access denied for {0}")]
    AccessDenied(EntityId),

    #[error("no such file: {0}")]
    FileNotFound(FileId),

    #[error("no such group: {0}")]
    GroupNotFound(GroupId),

    #[error("file {0} is not a folder")]
    NotAFolder(FileId),

    #[error("parent chain of file {0} loops without reaching the root")]
    ParentCycle(FileId),

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("refresh of file {file} failed: {message}")]
    TransientSync { file: FileId, message: String },

    #[error("synchronizer start failed: {0}")]
    FatalSync(String),

    #[error("storage provider: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("encryption provider: {0}")]
    Encryption(#[source] anyhow::Error),

    #[error("ledger: {0}")]
    Ledger(#[source] anyhow::Error),
}

impl Error {
    /// True for failures that the event flow retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientSync { .. })
    }
}
