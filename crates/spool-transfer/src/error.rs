//! Transfer failure taxonomy and its mapping onto wire statuses.

use std::io;
use std::sync::Arc;

use spool_core::wire::Status;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("peer unresponsive after {attempts} retries")]
    Timeout { attempts: u32 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("resource I/O failed: {0}")]
    ResourceIo(#[source] Arc<io::Error>),
    #[error("no resource with id {0}")]
    ResourceNotFound(u32),
    #[error("peer aborted the transfer: {0}")]
    RemoteAborted(Status),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("too many concurrent transfers (limit {0})")]
    TooManyConcurrentTransfers(usize),
    #[error("connection lost")]
    ConnectionLost,
}

/// Coarse classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ProtocolViolation,
    ResourceIo,
    ResourceNotFound,
    RemoteAborted,
    Cancelled,
    TooManyConcurrentTransfers,
    ConnectionLost,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Timeout { .. } => ErrorKind::Timeout,
            TransferError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            TransferError::ResourceIo(_) => ErrorKind::ResourceIo,
            TransferError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            TransferError::RemoteAborted(_) => ErrorKind::RemoteAborted,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::TooManyConcurrentTransfers(_) => ErrorKind::TooManyConcurrentTransfers,
            TransferError::ConnectionLost => ErrorKind::ConnectionLost,
        }
    }

    /// Status reported to the peer when this error ends a transfer locally.
    pub fn status(&self) -> Status {
        match self {
            TransferError::Timeout { .. } => Status::DEADLINE_EXCEEDED,
            TransferError::ProtocolViolation(_) => Status::INVALID_ARGUMENT,
            TransferError::ResourceIo(e) => match e.kind() {
                io::ErrorKind::NotFound => Status::NOT_FOUND,
                io::ErrorKind::PermissionDenied => Status::PERMISSION_DENIED,
                io::ErrorKind::Unsupported => Status::UNIMPLEMENTED,
                _ => Status::DATA_LOSS,
            },
            TransferError::ResourceNotFound(_) => Status::NOT_FOUND,
            TransferError::RemoteAborted(status) => *status,
            TransferError::Cancelled => Status::CANCELLED,
            TransferError::TooManyConcurrentTransfers(_) => Status::RESOURCE_EXHAUSTED,
            TransferError::ConnectionLost => Status::UNAVAILABLE,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::ResourceIo(Arc::new(e))
    }
}
