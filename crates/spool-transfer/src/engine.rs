//! Transfer engine: one actor per connection.
//!
//! The engine owns every session on a connection. A single task runs the
//! drive loop, which wakes only for:
//!
//!   - commands from [`EngineHandle`]s (open, resume, cancel)
//!   - inbound frames from the transport
//!   - completions from the blocking I/O pool
//!   - session deadlines (timeouts and pacing)
//!   - outbound capacity, while frames are queued
//!
//! Sessions are keyed by `(side, transfer_id)`: the client side of a stream
//! allocates its ids, the server side adopts whatever the peer chose, so
//! both directions can share a connection without colliding.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use spool_core::wire::{Chunk, ChunkType, DecodeError, Method, Status};
use spool_core::SpoolConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::TransferError;
use crate::handle::{Completion, TransferHandle, TransferProgress};
use crate::io::{spawn_queue, IoCompletion, IoOutcome, IoPool, IoQueue, IoRequest, Opener};
use crate::policy::SessionParams;
use crate::resource::{Resource, ResourceProvider, ResourceSink, ResourceSource};
use crate::scheduler::OutboundScheduler;
use crate::session::{Effect, Event, Role, TransferSession};
use crate::transport::{Frame, Transport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub session: SessionParams,
    /// Live sessions allowed at once, both sides together.
    pub max_concurrent_transfers: usize,
    pub io_workers: usize,
    pub outbound_queue: usize,
    /// How long a finished session still answers its peer.
    pub linger: Duration,
    /// Treat chunks with an unknown `type` as `DATA` instead of rejecting them.
    pub unknown_type_as_data: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SpoolConfig::default())
    }
}

impl From<&SpoolConfig> for EngineConfig {
    fn from(config: &SpoolConfig) -> Self {
        Self {
            session: SessionParams::from(&config.transfer),
            max_concurrent_transfers: config.engine.max_concurrent_transfers,
            io_workers: config.engine.io_workers,
            outbound_queue: config.engine.outbound_queue,
            linger: config.transfer.linger(),
            unknown_type_as_data: config.engine.unknown_type_as_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    /// We opened the stream.
    Client,
    /// The peer opened the stream.
    Server,
}

type Key = (Side, u32);

fn role_of(side: Side, method: Method) -> Role {
    match (side, method) {
        (Side::Client, Method::Read) | (Side::Server, Method::Write) => Role::Receiver,
        (Side::Client, Method::Write) | (Side::Server, Method::Read) => Role::Transmitter,
    }
}

fn method_of(side: Side, role: Role) -> Method {
    match (side, role) {
        (Side::Client, Role::Receiver) | (Side::Server, Role::Transmitter) => Method::Read,
        (Side::Client, Role::Transmitter) | (Side::Server, Role::Receiver) => Method::Write,
    }
}

type OutcomeSender = oneshot::Sender<Result<Completion, TransferError>>;

struct Opened {
    transfer_id: u32,
    progress: watch::Receiver<TransferProgress>,
    result: oneshot::Receiver<Result<Completion, TransferError>>,
}

type OpenReply = oneshot::Sender<Result<Opened, TransferError>>;

enum Command {
    Open {
        resource_id: u32,
        resource: Resource,
        offset: u64,
        reply: OpenReply,
    },
    Resume {
        transfer_id: u32,
        resource_id: u32,
        resource: Resource,
        offset: u64,
        reply: OpenReply,
    },
    Cancel(u32),
}

struct SessionEntry {
    session: TransferSession,
    method: Method,
    epoch: u64,
    io: IoQueue,
    progress: watch::Sender<TransferProgress>,
    /// `None` for sessions the peer opened; nobody awaits those.
    result: Option<OutcomeSender>,
}

/// A finished session, kept so late chunks get a consistent answer.
#[derive(Debug)]
struct Lingering {
    role: Role,
    final_chunk: Option<Chunk>,
    until: Instant,
}

pub struct TransferEngine {
    config: EngineConfig,
    provider: Option<Arc<dyn ResourceProvider>>,
    shutdown: CancellationToken,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Frame>,
    io_pool: IoPool,
    io_tx: mpsc::UnboundedSender<IoCompletion<Key>>,
    io_rx: mpsc::UnboundedReceiver<IoCompletion<Key>>,
    sessions: HashMap<Key, SessionEntry>,
    lingering: HashMap<Key, Lingering>,
    scheduler: OutboundScheduler<Key, Frame>,
    next_transfer_id: u32,
    next_epoch: u64,
    closed: bool,
}

impl TransferEngine {
    pub fn new(config: EngineConfig, transport: Transport) -> Self {
        let (outbound, inbound) = transport.into_channels();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            config,
            provider: None,
            shutdown: CancellationToken::new(),
            commands_tx,
            commands,
            outbound,
            inbound,
            io_pool: IoPool::new(config.io_workers),
            io_tx,
            io_rx,
            sessions: HashMap::new(),
            lingering: HashMap::new(),
            scheduler: OutboundScheduler::new(),
            next_transfer_id: 1,
            next_epoch: 0,
            closed: false,
        }
    }

    /// Serve transfers the peer opens, resolving their resources here.
    pub fn with_provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Stop when `token` is cancelled. Call before taking handles.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            commands: self.commands_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Sessions still running. Lingering ones are not counted.
    pub fn active_transfers(&self) -> usize {
        self.sessions.len()
    }

    /// Drive the engine until shutdown or until the transport closes. Every
    /// session still open then fails with `ConnectionLost`.
    pub async fn run(mut self) {
        while self.poll().await {}
    }

    /// One turn of the drive loop. Returns `false` once the engine has
    /// stopped.
    pub async fn poll(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let deadline = self.next_deadline();
        let sending = !self.scheduler.is_empty();

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.stop("shutdown requested");
                return false;
            }
            Some(command) = self.commands.recv() => self.on_command(command),
            Some(done) = self.io_rx.recv() => self.on_io(done),
            frame = self.inbound.recv() => match frame {
                Some(frame) => self.on_frame(frame),
                None => {
                    self.stop("transport closed");
                    return false;
                }
            },
            permit = self.outbound.clone().reserve_owned(), if sending => match permit {
                Ok(permit) => self.send_ready(permit),
                Err(_) => {
                    self.stop("transport closed");
                    return false;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
        }

        self.tick();
        true
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open {
                resource_id,
                resource,
                offset,
                reply,
            } => {
                let opened = self.open(resource_id, resource, offset);
                let _ = reply.send(opened);
            }
            Command::Resume {
                transfer_id,
                resource_id,
                resource,
                offset,
                reply,
            } => {
                let opened = self.resume(transfer_id, resource_id, resource, offset);
                let _ = reply.send(opened);
            }
            Command::Cancel(transfer_id) => {
                let key = (Side::Client, transfer_id);
                if self.sessions.contains_key(&key) {
                    debug!(transfer_id, "cancelling transfer");
                    self.deliver(key, Event::Cancel);
                }
            }
        }
    }

    fn open(&mut self, resource_id: u32, resource: Resource, offset: u64) -> Result<Opened, TransferError> {
        self.check_capacity()?;
        let transfer_id = self.allocate_id();
        let role = resource.role();
        let offset = match role {
            Role::Receiver => offset,
            Role::Transmitter => 0,
        };
        let session = TransferSession::initiate(
            transfer_id,
            Some(resource_id),
            role,
            offset,
            self.config.session,
            now(),
        );
        info!(transfer_id, resource_id, ?role, offset, "opening transfer");
        Ok(self.register_client(session, resource))
    }

    fn resume(
        &mut self,
        transfer_id: u32,
        resource_id: u32,
        resource: Resource,
        offset: u64,
    ) -> Result<Opened, TransferError> {
        let key = (Side::Client, transfer_id);
        if self.sessions.contains_key(&key) {
            return Err(TransferError::ProtocolViolation(format!(
                "transfer {transfer_id} is already active"
            )));
        }
        self.check_capacity()?;
        let role = resource.role();
        let session = TransferSession::resume(
            transfer_id,
            Some(resource_id),
            role,
            offset,
            self.config.session,
            now(),
        );
        info!(transfer_id, resource_id, ?role, offset, "resuming transfer");
        Ok(self.register_client(session, resource))
    }

    fn register_client(&mut self, session: TransferSession, resource: Resource) -> Opened {
        let transfer_id = session.transfer_id();
        let (tx, rx) = oneshot::channel();
        let opener: Opener = Box::new(move || Ok(resource));
        let progress = self.register((Side::Client, transfer_id), session, opener, Some(tx));
        Opened {
            transfer_id,
            progress,
            result: rx,
        }
    }

    fn register(
        &mut self,
        key: Key,
        session: TransferSession,
        opener: Opener,
        result: Option<OutcomeSender>,
    ) -> watch::Receiver<TransferProgress> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let (progress, progress_rx) = watch::channel(session.progress());
        let io = spawn_queue(key, epoch, opener, self.io_pool.clone(), self.io_tx.clone());
        let method = method_of(key.0, session.role());
        self.lingering.remove(&key);
        self.sessions.insert(
            key,
            SessionEntry {
                session,
                method,
                epoch,
                io,
                progress,
                result,
            },
        );
        progress_rx
    }

    fn check_capacity(&self) -> Result<(), TransferError> {
        let limit = self.config.max_concurrent_transfers;
        if self.sessions.len() >= limit {
            return Err(TransferError::TooManyConcurrentTransfers(limit));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_transfer_id;
            self.next_transfer_id = self.next_transfer_id.wrapping_add(1).max(1);
            let key = (Side::Client, id);
            if !self.sessions.contains_key(&key) && !self.lingering.contains_key(&key) {
                return id;
            }
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn on_frame(&mut self, frame: Frame) {
        let side = if frame.from_server {
            Side::Client
        } else {
            Side::Server
        };
        let method = frame.method;
        let chunk = match Chunk::decode(frame.payload) {
            Ok(chunk) => chunk,
            Err(DecodeError::UnknownType { value, chunk }) if self.config.unknown_type_as_data => {
                debug!(transfer_id = chunk.transfer_id, value, "treating unknown chunk type as data");
                Chunk {
                    chunk_type: Some(ChunkType::Data),
                    ..*chunk
                }
            }
            Err(e) => {
                warn!(%method, error = %e, "undecodable chunk");
                if let Some(transfer_id) = e.transfer_id() {
                    let key = (side, transfer_id);
                    if self.sessions.contains_key(&key) {
                        self.deliver(key, Event::Violation(e.to_string()));
                    }
                }
                return;
            }
        };

        let key = (side, chunk.transfer_id);
        trace!(
            transfer_id = chunk.transfer_id,
            %method,
            offset = chunk.offset,
            len = chunk.data.len(),
            "chunk received"
        );
        if let Some(entry) = self.sessions.get(&key) {
            if entry.method != method {
                warn!(transfer_id = chunk.transfer_id, %method, "chunk on the wrong stream");
                return;
            }
            self.deliver(key, Event::Chunk(chunk));
        } else if self.lingering.contains_key(&key) {
            self.answer_lingering(key, method, &chunk);
        } else if side == Side::Server {
            self.accept(method, chunk);
        } else if chunk.status.is_none() {
            debug!(transfer_id = chunk.transfer_id, "chunk for an unknown transfer");
            self.reject(key, method, &chunk, Status::NOT_FOUND);
        }
    }

    /// A chunk opening a transfer on a stream the peer is the client of.
    fn accept(&mut self, method: Method, chunk: Chunk) {
        let transfer_id = chunk.transfer_id;
        let key = (Side::Server, transfer_id);
        if chunk.status.is_some() {
            return;
        }
        let role = role_of(Side::Server, method);
        let opens = match (role, chunk.kind()) {
            (_, ChunkType::Start) => true,
            (Role::Transmitter, ChunkType::ParametersRetransmit) => chunk.resource_id.is_some(),
            (Role::Receiver, ChunkType::Data) => chunk.resource_id.is_some(),
            _ => false,
        };
        if !opens {
            debug!(transfer_id, %method, "chunk for an unknown transfer");
            self.reject(key, method, &chunk, Status::NOT_FOUND);
            return;
        }
        if let Err(violation) = chunk.validate(None) {
            warn!(transfer_id, %violation, "malformed opening chunk");
            self.reject(key, method, &chunk, Status::INVALID_ARGUMENT);
            return;
        }
        let Some(provider) = self.provider.clone() else {
            self.reject(key, method, &chunk, Status::UNIMPLEMENTED);
            return;
        };
        if let Err(e) = self.check_capacity() {
            warn!(transfer_id, error = %e, "rejecting transfer");
            self.reject(key, method, &chunk, e.status());
            return;
        }

        let resource_id = chunk.resource_id.unwrap_or(transfer_id);
        let offset = chunk.offset;
        let opener: Opener = match role {
            Role::Transmitter => Box::new(move || {
                provider
                    .open_source(resource_id, offset)
                    .map(Resource::Source)
            }),
            Role::Receiver => Box::new(move || {
                provider.open_sink(resource_id, offset).map(Resource::Sink)
            }),
        };
        info!(transfer_id, resource_id, ?role, offset, "accepting transfer");
        let session = TransferSession::respond(role, &chunk, self.config.session, now());
        self.register(key, session, opener, None);
    }

    fn answer_lingering(&mut self, key: Key, method: Method, chunk: &Chunk) {
        let Some(lingering) = self.lingering.get(&key) else {
            return;
        };
        // A receiver also answers the transmitter's repeated completion.
        let answers = match (lingering.role, chunk.status) {
            (_, None) => true,
            (Role::Receiver, Some(status)) => status.is_ok(),
            (Role::Transmitter, Some(_)) => false,
        };
        let Some(final_chunk) = lingering.final_chunk.clone().filter(|_| answers) else {
            return;
        };
        debug!(transfer_id = key.1, "re-sending final status to lingering peer");
        self.push(key, method, final_chunk);
    }

    fn reject(&mut self, key: Key, method: Method, chunk: &Chunk, status: Status) {
        let reply = Chunk {
            transfer_id: chunk.transfer_id,
            offset: chunk.offset,
            status: Some(status),
            ..Chunk::default()
        };
        self.push(key, method, reply);
    }

    fn on_io(&mut self, done: IoCompletion<Key>) {
        let IoCompletion {
            key,
            epoch,
            outcome,
        } = done;
        match self.sessions.get(&key) {
            Some(entry) if entry.epoch == epoch => {}
            _ => return,
        }
        let event = match outcome {
            IoOutcome::Opened { len } => Event::ResourceReady { len },
            IoOutcome::OpenFailed(e) => Event::ResourceFailed(e),
            IoOutcome::Read { offset, result } => Event::ReadComplete { offset, result },
            IoOutcome::Write { end_offset, result } => Event::WriteComplete { end_offset, result },
            IoOutcome::Flush(result) => Event::FlushComplete(result),
        };
        self.deliver(key, event);
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn deliver(&mut self, key: Key, event: Event) {
        let Some(entry) = self.sessions.get_mut(&key) else {
            return;
        };
        let effects = entry.session.handle(event, now());
        self.apply(key, effects);
    }

    fn apply(&mut self, key: Key, effects: Vec<Effect>) {
        let Some(entry) = self.sessions.get_mut(&key) else {
            return;
        };
        let mut finished = None;
        let mut lost = Vec::new();
        for effect in effects {
            match effect {
                Effect::Emit(chunk) => {
                    trace!(
                        transfer_id = key.1,
                        offset = chunk.offset,
                        len = chunk.data.len(),
                        "chunk queued"
                    );
                    self.scheduler.push(key, frame(key.0, entry.method, &chunk));
                }
                Effect::Read { offset, max_len } => {
                    let request = IoRequest::Read { offset, max_len };
                    if !entry.io.submit(request) {
                        lost.push(Event::ReadComplete {
                            offset,
                            result: Err(queue_closed()),
                        });
                    }
                }
                Effect::Write { offset, data } => {
                    let end_offset = offset + data.len() as u64;
                    if !entry.io.submit(IoRequest::Write { offset, data }) {
                        lost.push(Event::WriteComplete {
                            end_offset,
                            result: Err(queue_closed()),
                        });
                    }
                }
                Effect::Flush => {
                    if !entry.io.submit(IoRequest::Flush) {
                        lost.push(Event::FlushComplete(Err(queue_closed())));
                    }
                }
                Effect::Finish(result) => finished = Some(result),
            }
        }
        entry.progress.send_replace(entry.session.progress());

        if let Some(result) = finished {
            self.finish(key, result);
            return;
        }
        for event in lost {
            self.deliver(key, event);
        }
    }

    fn finish(&mut self, key: Key, result: Result<u64, TransferError>) {
        let Some(mut entry) = self.sessions.remove(&key) else {
            return;
        };
        let (side, transfer_id) = key;
        let method = entry.method;
        match &result {
            Ok(bytes) => info!(transfer_id, ?side, %method, bytes, "transfer done"),
            Err(TransferError::Cancelled) => info!(transfer_id, ?side, %method, "transfer cancelled"),
            Err(e) => info!(transfer_id, ?side, %method, error = %e, "transfer failed"),
        }
        self.lingering.insert(
            key,
            Lingering {
                role: entry.session.role(),
                final_chunk: entry.session.status_chunk().cloned(),
                until: Instant::now() + self.config.linger,
            },
        );
        if let Some(tx) = entry.result.take() {
            let outcome = match result {
                Ok(bytes) => Ok(Completion::Done { bytes }),
                Err(TransferError::Cancelled) => Ok(Completion::Cancelled),
                Err(e) => Err(e),
            };
            let _ = tx.send(outcome);
        }
    }

    /// Deliver `Tick` to every session whose deadline passed.
    fn tick(&mut self) {
        let now = now();
        let due: Vec<Key> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.session.next_deadline().is_some_and(|d| d <= now))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            self.deliver(key, Event::Tick);
        }
        let now = Instant::now();
        self.lingering.retain(|_, l| l.until > now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|entry| entry.session.next_deadline())
            .min()
            .map(Instant::from_std)
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    fn push(&mut self, key: Key, method: Method, chunk: Chunk) {
        self.scheduler.push(key, frame(key.0, method, &chunk));
    }

    /// Send queued frames round-robin for as long as the transport has room.
    fn send_ready(&mut self, permit: mpsc::OwnedPermit<Frame>) {
        let Some((_, first)) = self.scheduler.pop() else {
            return;
        };
        let _ = permit.send(first);
        while !self.scheduler.is_empty() {
            let Ok(permit) = self.outbound.try_reserve() else {
                break;
            };
            if let Some((_, frame)) = self.scheduler.pop() {
                permit.send(frame);
            }
        }
    }

    fn stop(&mut self, reason: &str) {
        self.closed = true;
        info!(
            reason,
            open = self.active_transfers(),
            queued = self.scheduler.len(),
            "engine stopping"
        );
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            drop(command);
        }
        let keys: Vec<Key> = self.sessions.keys().copied().collect();
        for key in keys {
            self.deliver(key, Event::Disconnected);
        }
    }
}

fn frame(side: Side, method: Method, chunk: &Chunk) -> Frame {
    Frame {
        method,
        from_server: side == Side::Server,
        payload: chunk.encode(),
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn queue_closed() -> Arc<io::Error> {
    Arc::new(io::Error::new(io::ErrorKind::BrokenPipe, "I/O queue closed"))
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap, cloneable access to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    /// Fetch resource `resource_id` from the peer into `sink`, starting at
    /// `starting_offset`.
    pub async fn open_read(
        &self,
        resource_id: u32,
        sink: impl ResourceSink + 'static,
        starting_offset: u64,
    ) -> Result<TransferHandle, TransferError> {
        let resource = Resource::sink(sink);
        self.request(|reply| Command::Open {
            resource_id,
            resource,
            offset: starting_offset,
            reply,
        })
        .await
    }

    /// Send `source` to the peer as resource `resource_id`.
    pub async fn open_write(
        &self,
        resource_id: u32,
        source: impl ResourceSource + 'static,
    ) -> Result<TransferHandle, TransferError> {
        let resource = Resource::source(source);
        self.request(|reply| Command::Open {
            resource_id,
            resource,
            offset: 0,
            reply,
        })
        .await
    }

    /// Reattach to `transfer_id` at the last offset the receiving side
    /// committed, without a handshake. A sink resumes a read, a source
    /// resumes a write.
    pub async fn resume(
        &self,
        transfer_id: u32,
        resource_id: u32,
        resource: Resource,
        last_committed_offset: u64,
    ) -> Result<TransferHandle, TransferError> {
        self.request(|reply| Command::Resume {
            transfer_id,
            resource_id,
            resource,
            offset: last_committed_offset,
            reply,
        })
        .await
    }

    /// Cancel a transfer opened through this engine. Idempotent; never blocks.
    pub fn cancel(&self, transfer_id: u32) {
        let _ = self.commands.send(Command::Cancel(transfer_id));
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn request(
        &self,
        build: impl FnOnce(OpenReply) -> Command,
    ) -> Result<TransferHandle, TransferError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| TransferError::ConnectionLost)?;
        let opened = rx.await.map_err(|_| TransferError::ConnectionLost)??;
        Ok(TransferHandle::new(
            opened.transfer_id,
            opened.progress,
            opened.result,
            self.clone(),
        ))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}
