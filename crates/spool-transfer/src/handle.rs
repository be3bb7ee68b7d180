//! Caller-side view of one transfer.

use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::engine::EngineHandle;
use crate::error::TransferError;
use crate::session::SessionState;

/// Snapshot of a transfer's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub transfer_id: u32,
    /// Offset reached: bytes committed (receiving) or sent (transmitting).
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub state: SessionState,
}

/// How a transfer ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every byte was delivered; `bytes` is the final offset.
    Done { bytes: u64 },
    /// Cancelled locally before completion.
    Cancelled,
}

pub struct TransferHandle {
    transfer_id: u32,
    progress: watch::Receiver<TransferProgress>,
    result: oneshot::Receiver<Result<Completion, TransferError>>,
    engine: EngineHandle,
}

impl TransferHandle {
    pub(crate) fn new(
        transfer_id: u32,
        progress: watch::Receiver<TransferProgress>,
        result: oneshot::Receiver<Result<Completion, TransferError>>,
        engine: EngineHandle,
    ) -> Self {
        Self {
            transfer_id,
            progress,
            result,
            engine,
        }
    }

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    /// Latest progress. Never blocks.
    pub fn poll_progress(&self) -> TransferProgress {
        self.progress.borrow().clone()
    }

    /// A receiver that observes every progress update.
    pub fn watch_progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    /// Cancel this transfer. Idempotent; never blocks.
    pub fn cancel(&self) {
        self.engine.cancel(self.transfer_id);
    }

    /// Wait for the terminal outcome.
    ///
    /// Local cancellation resolves to `Ok(Completion::Cancelled)`. If the
    /// engine stops without reporting, the transfer failed with
    /// [`TransferError::ConnectionLost`].
    pub async fn result(self) -> Result<Completion, TransferError> {
        self.result
            .await
            .unwrap_or(Err(TransferError::ConnectionLost))
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("transfer_id", &self.transfer_id)
            .field("progress", &*self.progress.borrow())
            .finish()
    }
}
