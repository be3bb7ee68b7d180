//! Blocking resource I/O.
//!
//! Every transfer gets a serial queue: its requests run one after another,
//! in submission order, on tokio's blocking pool. A shared semaphore bounds
//! how many run at once across all transfers on an engine.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tracing::trace;

use crate::error::TransferError;
use crate::resource::Resource;

/// Opens a transfer's resource. Runs on the blocking pool.
pub(crate) type Opener = Box<dyn FnOnce() -> Result<Resource, TransferError> + Send>;

#[derive(Debug, Clone)]
pub(crate) struct IoPool {
    permits: Arc<Semaphore>,
}

impl IoPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    async fn run<T, F>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("I/O pool closed"))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| io::Error::other(format!("I/O worker failed: {e}")))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum IoRequest {
    Read { offset: u64, max_len: u32 },
    Write { offset: u64, data: Bytes },
    Flush,
}

impl IoRequest {
    fn failed(self, err: Arc<io::Error>) -> IoOutcome {
        match self {
            IoRequest::Read { offset, .. } => IoOutcome::Read {
                offset,
                result: Err(err),
            },
            IoRequest::Write { offset, data } => IoOutcome::Write {
                end_offset: offset + data.len() as u64,
                result: Err(err),
            },
            IoRequest::Flush => IoOutcome::Flush(Err(err)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum IoOutcome {
    Opened { len: Option<u64> },
    OpenFailed(TransferError),
    Read {
        offset: u64,
        result: Result<Bytes, Arc<io::Error>>,
    },
    Write {
        end_offset: u64,
        result: Result<(), Arc<io::Error>>,
    },
    Flush(Result<(), Arc<io::Error>>),
}

/// An outcome tagged with the transfer it belongs to. `epoch` tells apart
/// transfers that reused the same key.
#[derive(Debug)]
pub(crate) struct IoCompletion<K> {
    pub key: K,
    pub epoch: u64,
    pub outcome: IoOutcome,
}

/// Submission side of one transfer's queue. Dropping it lets the worker
/// finish what was already submitted, then close the resource.
#[derive(Debug)]
pub(crate) struct IoQueue {
    tx: mpsc::UnboundedSender<IoRequest>,
}

impl IoQueue {
    pub fn submit(&self, request: IoRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

pub(crate) fn spawn_queue<K>(
    key: K,
    epoch: u64,
    opener: Opener,
    pool: IoPool,
    completions: mpsc::UnboundedSender<IoCompletion<K>>,
) -> IoQueue
where
    K: Copy + Send + std::fmt::Debug + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<IoRequest>();
    tokio::spawn(async move {
        let report = move |outcome| {
            let _ = completions.send(IoCompletion { key, epoch, outcome });
        };

        let mut resource = match pool.run(opener).await {
            Ok(Ok(resource)) => resource,
            Ok(Err(e)) => {
                report(IoOutcome::OpenFailed(e));
                return;
            }
            Err(e) => {
                report(IoOutcome::OpenFailed(e.into()));
                return;
            }
        };
        report(IoOutcome::Opened { len: resource.len() });

        // Requests already submitted still run after the engine goes away, so
        // every accepted write reaches the sink.
        while let Some(request) = rx.recv().await {
            let fallback = request.clone();
            let outcome = match pool
                .run(move || {
                    let outcome = perform(&mut resource, request);
                    (resource, outcome)
                })
                .await
            {
                Ok((back, outcome)) => {
                    resource = back;
                    outcome
                }
                Err(e) => {
                    report(fallback.failed(Arc::new(e)));
                    return;
                }
            };
            report(outcome);
        }
        trace!(?key, "I/O queue closed");
    });
    IoQueue { tx }
}

fn perform(resource: &mut Resource, request: IoRequest) -> IoOutcome {
    match (resource, request) {
        (Resource::Source(source), IoRequest::Read { offset, max_len }) => IoOutcome::Read {
            offset,
            result: source.read(offset, max_len as usize).map_err(Arc::new),
        },
        (Resource::Sink(sink), IoRequest::Write { offset, data }) => IoOutcome::Write {
            end_offset: offset + data.len() as u64,
            result: sink.write(offset, &data).map_err(Arc::new),
        },
        (Resource::Sink(sink), IoRequest::Flush) => IoOutcome::Flush(sink.flush().map_err(Arc::new)),
        (_, request) => request.failed(Arc::new(io::Error::new(
            io::ErrorKind::Unsupported,
            "request does not match the resource",
        ))),
    }
}
