//! Transfer session: the protocol state machine for one transfer.
//!
//! A session performs no I/O and owns no clock. The engine feeds it
//! [`Event`]s stamped with the current time and carries out the [`Effect`]s
//! it returns, in order:
//!
//!   Init → Handshake → Active ⇄ Retransmitting → Completing → Done
//!
//! Any non-terminal state may fall to `Failed`. Once a session is terminal,
//! every further event is ignored.
//!
//! The receiving half lives in `receive.rs`, the transmitting half in
//! `transmit.rs`.

mod receive;
mod transmit;

use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use spool_core::wire::{Chunk, ChunkType, Status};
use tracing::debug;

use crate::error::TransferError;
use crate::handle::TransferProgress;
use crate::policy::SessionParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the local resource to open.
    Init,
    /// Opening chunks exchanged; parameters not yet settled.
    Handshake,
    Active,
    /// A gap was detected (receiver) or a rewind requested (transmitter).
    Retransmitting,
    /// All bytes sent or accepted; waiting for the flush or the peer's status.
    Completing,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Reads from a source and emits data.
    Transmitter,
    /// Accepts data into a sink and grants credit.
    Receiver,
}

/// Input to a session.
#[derive(Debug)]
pub enum Event {
    /// The resource opened. `len` is the source length, if known.
    ResourceReady { len: Option<u64> },
    ResourceFailed(TransferError),
    Chunk(Chunk),
    ReadComplete {
        offset: u64,
        result: Result<Bytes, Arc<io::Error>>,
    },
    WriteComplete {
        end_offset: u64,
        result: Result<(), Arc<io::Error>>,
    },
    FlushComplete(Result<(), Arc<io::Error>>),
    /// Time passed; check deadlines.
    Tick,
    Cancel,
    /// A chunk addressed to this session could not be decoded.
    Violation(String),
    Disconnected,
}

/// Work a session asks the engine to perform.
#[derive(Debug)]
pub enum Effect {
    Emit(Chunk),
    Read { offset: u64, max_len: u32 },
    Write { offset: u64, data: Bytes },
    Flush,
    /// Terminal outcome. `Ok` carries the offset the transfer reached.
    Finish(Result<u64, TransferError>),
}

/// How the session came to exist. Decides its opening move once the
/// resource is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opening {
    /// We send `START`.
    Initiate,
    /// The peer sent `START` (or a resume chunk) and we answer it.
    Respond,
    /// Reattaching to a transfer the peer may still know.
    Resume,
}

pub struct TransferSession {
    transfer_id: u32,
    resource_id: Option<u32>,
    role: Role,
    state: SessionState,
    params: SessionParams,
    /// `Some` until the resource is ready.
    opening: Option<Opening>,
    /// Receiver: next byte expected. Transmitter: next byte to send.
    offset: u64,
    /// Receiver: bytes the sink has confirmed.
    written_offset: u64,
    /// Transmitter: furthest byte ever sent.
    sent_high_water: u64,
    window_end_offset: u64,
    max_chunk_size: u32,
    min_delay: Duration,
    total_bytes: Option<u64>,
    pending_retransmit_ranges: Vec<Range<u64>>,
    last_activity: Instant,
    /// Consecutive timeouts since the peer last made progress.
    retries: u32,
    read_in_flight: Option<u64>,
    next_send_at: Option<Instant>,
    /// Carry `resource_id` on outgoing chunks until the peer answers.
    announce_resource: bool,
    resumed: bool,
    /// `START` re-sent while the handshake is unanswered.
    handshake_chunk: Option<Chunk>,
    /// Transmitter's last chunk, re-sent until the receiver acknowledges.
    final_chunk: Option<Chunk>,
    status_chunk: Option<Chunk>,
    peer_terminated: bool,
}

impl TransferSession {
    /// A session this side opens: a receiver starting at `offset`, or a
    /// transmitter (whose `offset` is normally 0).
    pub fn initiate(
        transfer_id: u32,
        resource_id: Option<u32>,
        role: Role,
        offset: u64,
        params: SessionParams,
        now: Instant,
    ) -> Self {
        Self::new(transfer_id, resource_id, role, offset, params, Opening::Initiate, now)
    }

    /// A session answering the peer's opening chunk.
    pub fn respond(role: Role, request: &Chunk, params: SessionParams, now: Instant) -> Self {
        let mut session = Self::new(
            request.transfer_id,
            request.resource_id,
            role,
            request.offset,
            params,
            Opening::Respond,
            now,
        );
        session.state = SessionState::Handshake;
        match role {
            Role::Transmitter => {
                session.resumed = request.kind() != ChunkType::Start;
                session.apply_parameters(request);
            }
            Role::Receiver => {
                session.total_bytes = request
                    .remaining_bytes
                    .and_then(|r| request.offset.checked_add(r));
            }
        }
        session
    }

    /// Reattach to `transfer_id` at `offset` without a handshake.
    pub fn resume(
        transfer_id: u32,
        resource_id: Option<u32>,
        role: Role,
        offset: u64,
        params: SessionParams,
        now: Instant,
    ) -> Self {
        let mut session =
            Self::new(transfer_id, resource_id, role, offset, params, Opening::Resume, now);
        session.announce_resource = resource_id.is_some();
        session.resumed = true;
        session
    }

    fn new(
        transfer_id: u32,
        resource_id: Option<u32>,
        role: Role,
        offset: u64,
        params: SessionParams,
        opening: Opening,
        now: Instant,
    ) -> Self {
        Self {
            transfer_id,
            resource_id,
            role,
            state: SessionState::Init,
            params,
            opening: Some(opening),
            offset,
            written_offset: offset,
            sent_high_water: offset,
            window_end_offset: 0,
            max_chunk_size: params.window.max_chunk_size,
            min_delay: match role {
                Role::Receiver => params.window.min_delay,
                Role::Transmitter => Duration::ZERO,
            },
            total_bytes: None,
            pending_retransmit_ranges: Vec::new(),
            last_activity: now,
            retries: 0,
            read_in_flight: None,
            next_send_at: None,
            announce_resource: false,
            resumed: false,
            handshake_chunk: None,
            final_chunk: None,
            status_chunk: None,
            peer_terminated: false,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    pub fn resource_id(&self) -> Option<u32> {
        self.resource_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Receiver: bytes accepted in order. Transmitter: next byte to send.
    pub fn committed_offset(&self) -> u64 {
        self.offset
    }

    pub fn window_end_offset(&self) -> u64 {
        self.window_end_offset
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn pending_retransmit_ranges(&self) -> &[Range<u64>] {
        &self.pending_retransmit_ranges
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// The one status chunk this session emitted, if any.
    pub fn status_chunk(&self) -> Option<&Chunk> {
        self.status_chunk.as_ref()
    }

    /// Bytes moved so far. Never decreases.
    pub fn bytes_transferred(&self) -> u64 {
        match self.role {
            Role::Receiver => self.offset,
            Role::Transmitter => self.sent_high_water,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id,
            bytes_transferred: self.bytes_transferred(),
            total_bytes: self.total_bytes,
            state: self.state,
        }
    }

    // ── Driving ───────────────────────────────────────────────────────────────

    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state.is_terminal() {
            return fx;
        }
        match event {
            Event::ResourceReady { len } => self.on_resource_ready(len, now, &mut fx),
            Event::ResourceFailed(err) => self.fail(err, &mut fx),
            Event::Chunk(chunk) => self.on_chunk(chunk, now, &mut fx),
            Event::ReadComplete { offset, result } => self.on_read(offset, result, now, &mut fx),
            Event::WriteComplete { end_offset, result } => {
                self.on_write(end_offset, result, &mut fx)
            }
            Event::FlushComplete(result) => self.on_flush(result, &mut fx),
            Event::Tick => self.on_tick(now, &mut fx),
            Event::Cancel => self.fail(TransferError::Cancelled, &mut fx),
            Event::Violation(reason) => {
                self.fail(TransferError::ProtocolViolation(reason), &mut fx)
            }
            Event::Disconnected => {
                self.peer_terminated = true;
                self.fail(TransferError::ConnectionLost, &mut fx);
            }
        }
        if self.role == Role::Transmitter {
            self.pump(now, &mut fx);
        }
        fx
    }

    /// When the engine should next deliver [`Event::Tick`].
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.timeout_deadline();
        let pacing = self.pacing_deadline();
        match (timeout, pacing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_resource_ready(&mut self, len: Option<u64>, now: Instant, fx: &mut Vec<Effect>) {
        let Some(opening) = self.opening.take() else {
            return;
        };
        self.last_activity = now;
        match self.role {
            Role::Receiver => self.open_receiver(opening, fx),
            Role::Transmitter => self.open_transmitter(opening, len, fx),
        }
    }

    fn on_chunk(&mut self, chunk: Chunk, now: Instant, fx: &mut Vec<Effect>) {
        let limit = (self.role == Role::Receiver).then_some(self.max_chunk_size);
        if let Err(violation) = chunk.validate(limit) {
            self.fail(TransferError::ProtocolViolation(violation.to_string()), fx);
            return;
        }
        if let Some(status) = chunk.status.filter(|s| !s.is_ok()) {
            debug!(transfer_id = self.transfer_id, %status, "peer aborted transfer");
            self.peer_terminated = true;
            self.fail(TransferError::RemoteAborted(status), fx);
            return;
        }
        if self.opening.is_some() {
            return;
        }
        self.announce_resource = false;
        match (self.role, chunk.status.is_some()) {
            (Role::Receiver, true) => self.receive_completion(chunk, now, fx),
            (Role::Receiver, false) => self.receive_chunk(chunk, now, fx),
            (Role::Transmitter, true) => self.finish(fx),
            (Role::Transmitter, false) => self.transmit_control(chunk, now, fx),
        }
    }

    fn on_tick(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        let Some(deadline) = self.timeout_deadline() else {
            return;
        };
        if now < deadline {
            return;
        }

        self.retries += 1;
        if self.params.retry.exhausted(self.retries) {
            debug!(transfer_id = self.transfer_id, state = ?self.state, "retry budget exhausted");
            let attempts = self.params.retry.max_retries;
            self.fail(TransferError::Timeout { attempts }, fx);
            return;
        }
        self.last_activity = now;
        debug!(
            transfer_id = self.transfer_id,
            retries = self.retries,
            state = ?self.state,
            "peer timed out, retrying"
        );
        match self.role {
            Role::Receiver => self.retry_receive(fx),
            Role::Transmitter => self.retry_transmit(fx),
        }
    }

    fn timeout_deadline(&self) -> Option<Instant> {
        self.awaiting_peer()
            .then(|| self.last_activity + self.params.retry.timeout_for(self.retries))
    }

    /// Whether the session is blocked on the peer and should time out.
    fn awaiting_peer(&self) -> bool {
        if self.opening.is_some() {
            return false;
        }
        match self.state {
            SessionState::Init | SessionState::Done | SessionState::Failed => false,
            SessionState::Handshake => true,
            SessionState::Completing => self.role == Role::Transmitter,
            SessionState::Active | SessionState::Retransmitting => match self.role {
                Role::Receiver => !self.sink_backlogged(),
                Role::Transmitter => {
                    self.read_in_flight.is_none() && self.offset >= self.window_end_offset
                }
            },
        }
    }

    // ── Termination ───────────────────────────────────────────────────────────

    fn finish(&mut self, fx: &mut Vec<Effect>) {
        self.state = SessionState::Done;
        self.read_in_flight = None;
        fx.push(Effect::Finish(Ok(self.bytes_transferred())));
    }

    /// Fail the session, telling the peer unless it already knows.
    fn fail(&mut self, err: TransferError, fx: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SessionState::Failed;
        self.read_in_flight = None;
        if !self.peer_terminated && self.status_chunk.is_none() {
            let chunk = self.status(err.status());
            self.status_chunk = Some(chunk.clone());
            fx.push(Effect::Emit(chunk));
        }
        fx.push(Effect::Finish(Err(err)));
    }

    fn status(&self, status: Status) -> Chunk {
        Chunk {
            transfer_id: self.transfer_id,
            offset: self.offset,
            window_end_offset: self.window_end_offset.max(self.offset),
            status: Some(status),
            ..Chunk::default()
        }
    }

    fn announced_resource(&self) -> Option<u32> {
        if self.announce_resource {
            self.resource_id
        } else {
            None
        }
    }
}
