//! spool-transfer: sessions, resources, and the per-connection transfer
//! engine.
//!
//! A [`session::TransferSession`] is a pure state machine for one transfer.
//! The [`engine::TransferEngine`] owns every session on a connection, performs
//! the I/O their effects ask for, and multiplexes their chunks over a
//! [`transport::Transport`].

pub mod engine;
pub mod error;
pub mod handle;
pub mod io;
pub mod policy;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use engine::{EngineConfig, EngineHandle, TransferEngine};
pub use error::{ErrorKind, TransferError};
pub use handle::{Completion, TransferHandle, TransferProgress};
pub use policy::{RetryPolicy, SessionParams, WindowPolicy};
pub use resource::{
    ChannelSink, DirectoryProvider, FileSink, FileSource, MemorySink, MemorySource, Resource,
    ResourceProvider, ResourceSink, ResourceSource,
};
pub use session::{Role, SessionState};
pub use transport::{Frame, Transport};
