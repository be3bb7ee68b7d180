//! Resources: where transmitted bytes come from and received bytes go.
//!
//! Implementations are synchronous. The engine calls them from blocking
//! threads, one call at a time per transfer, always in offset order for
//! sinks.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use spool_core::config::ResourceConfig;
use tokio::sync::mpsc;

use crate::error::TransferError;
use crate::session::Role;

pub trait ResourceSource: Send {
    /// Up to `max_len` bytes starting at `offset`. Empty means end of data.
    fn read(&mut self, offset: u64, max_len: usize) -> io::Result<Bytes>;

    /// Total length, when known up front.
    fn len(&self) -> Option<u64> {
        None
    }
}

pub trait ResourceSink: Send {
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make every written byte durable.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A resource handed to the engine, owned by its transfer from then on.
pub enum Resource {
    Source(Box<dyn ResourceSource>),
    Sink(Box<dyn ResourceSink>),
}

impl Resource {
    pub fn source(source: impl ResourceSource + 'static) -> Self {
        Resource::Source(Box::new(source))
    }

    pub fn sink(sink: impl ResourceSink + 'static) -> Self {
        Resource::Sink(Box::new(sink))
    }

    /// The role a local session plays over this resource.
    pub fn role(&self) -> Role {
        match self {
            Resource::Source(_) => Role::Transmitter,
            Resource::Sink(_) => Role::Receiver,
        }
    }

    pub(crate) fn len(&self) -> Option<u64> {
        match self {
            Resource::Source(source) => source.len(),
            Resource::Sink(_) => None,
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Source(source) => f.debug_tuple("Source").field(&source.len()).finish(),
            Resource::Sink(_) => f.write_str("Sink"),
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ResourceSource for MemorySource {
    fn read(&mut self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        let len = self.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(max_len).min(len);
        Ok(self.data.slice(start..end))
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Growable in-memory sink. Clones share the same buffer, so a caller can
/// keep one to inspect what a transfer wrote.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ResourceSink for MemorySink {
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds memory"))?;
        let end = start + data.len();
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| io::Error::other("memory sink poisoned"))?;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }
}

// ── Files ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ResourceSource for FileSource {
    fn read(&mut self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        if offset >= self.len {
            return Ok(Bytes::new());
        }
        let want = (self.len - offset).min(max_len as u64);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(want as usize);
        (&mut self.file).take(want).read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}

#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Create or truncate `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }

    /// Reopen a partially received file to continue at `offset`. Bytes
    /// beyond `offset` are discarded.
    pub fn open_at(path: &Path, offset: u64) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} holds {len} bytes, cannot resume at {offset}", path.display()),
            ));
        }
        file.set_len(offset)?;
        Ok(Self { file })
    }
}

impl ResourceSink for FileSink {
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Hands received bytes to an async consumer, in order. Blocks the I/O
/// worker while the channel is full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    next_offset: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize, starting_offset: u64) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                next_offset: starting_offset,
            },
            rx,
        )
    }
}

impl ResourceSink for ChannelSink {
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if offset != self.next_offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write at {offset}, expected {}", self.next_offset),
            ));
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer dropped"))?;
        self.next_offset += data.len() as u64;
        Ok(())
    }
}

// ── Providers ─────────────────────────────────────────────────────────────────

/// Resolves resource ids named by a peer into resources.
pub trait ResourceProvider: Send + Sync {
    fn open_source(
        &self,
        resource_id: u32,
        offset: u64,
    ) -> Result<Box<dyn ResourceSource>, TransferError>;

    fn open_sink(&self, resource_id: u32, offset: u64)
        -> Result<Box<dyn ResourceSink>, TransferError>;
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    writable: bool,
}

/// Serves files by configured id.
#[derive(Debug, Clone, Default)]
pub struct DirectoryProvider {
    entries: HashMap<u32, Entry>,
}

impl DirectoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(resources: &[ResourceConfig]) -> Self {
        let mut provider = Self::new();
        for r in resources {
            provider.insert(r.id, r.path.clone(), r.writable);
        }
        provider
    }

    pub fn insert(&mut self, resource_id: u32, path: impl Into<PathBuf>, writable: bool) {
        self.entries.insert(
            resource_id,
            Entry {
                path: path.into(),
                writable,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, resource_id: u32) -> Result<&Entry, TransferError> {
        self.entries
            .get(&resource_id)
            .ok_or(TransferError::ResourceNotFound(resource_id))
    }
}

impl ResourceProvider for DirectoryProvider {
    fn open_source(
        &self,
        resource_id: u32,
        _offset: u64,
    ) -> Result<Box<dyn ResourceSource>, TransferError> {
        let entry = self.entry(resource_id)?;
        Ok(Box::new(FileSource::open(&entry.path)?))
    }

    fn open_sink(
        &self,
        resource_id: u32,
        offset: u64,
    ) -> Result<Box<dyn ResourceSink>, TransferError> {
        let entry = self.entry(resource_id)?;
        if !entry.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("resource {resource_id} is read-only"),
            )
            .into());
        }
        let sink = if offset == 0 {
            FileSink::create(&entry.path)?
        } else {
            FileSink::open_at(&entry.path, offset)?
        };
        Ok(Box::new(sink))
    }
}
