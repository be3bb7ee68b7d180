//! Receiver half: in-order acceptance, gap recovery, and credit.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use spool_core::wire::{Chunk, ChunkType, Status};
use tracing::{debug, trace};

use super::{Effect, Opening, Role, SessionState, TransferSession};
use crate::error::TransferError;

impl TransferSession {
    pub(super) fn open_receiver(&mut self, opening: Opening, fx: &mut Vec<Effect>) {
        match opening {
            Opening::Initiate => {
                self.state = SessionState::Handshake;
                let mut start = self.parameters(ChunkType::Start);
                start.resource_id = self.resource_id;
                self.handshake_chunk = Some(start.clone());
                fx.push(Effect::Emit(start));
            }
            Opening::Respond => {
                let params = self.parameters(ChunkType::ParametersRetransmit);
                fx.push(Effect::Emit(params));
            }
            Opening::Resume => {
                self.state = SessionState::Active;
                let params = self.parameters(ChunkType::ParametersRetransmit);
                fx.push(Effect::Emit(params));
            }
        }
    }

    /// A chunk without status arriving at a receiver.
    pub(super) fn receive_chunk(&mut self, chunk: Chunk, now: Instant, fx: &mut Vec<Effect>) {
        if self.state == SessionState::Completing {
            return;
        }
        match chunk.kind() {
            ChunkType::Data => {}
            ChunkType::Start => {
                // Our answer to the peer's START was lost.
                if self.state == SessionState::Handshake {
                    self.last_activity = now;
                    let params = self.parameters(ChunkType::ParametersRetransmit);
                    fx.push(Effect::Emit(params));
                }
                return;
            }
            ChunkType::ParametersRetransmit | ChunkType::ParametersContinue => {
                trace!(transfer_id = self.transfer_id, "ignoring parameters sent to a receiver");
                return;
            }
        }

        if chunk.is_nudge() {
            trace!(transfer_id = self.transfer_id, offset = chunk.offset, "answering nudge");
            self.retries = 0;
            self.last_activity = now;
            let params = self.parameters(ChunkType::ParametersRetransmit);
            fx.push(Effect::Emit(params));
            return;
        }

        if chunk.offset > self.offset {
            self.request_retransmit(chunk.offset, now, fx);
            return;
        }

        let end = chunk.end_offset();
        let total = match chunk.remaining_bytes.map(|r| end.checked_add(r)) {
            Some(None) => {
                let reason = format!("remaining bytes overflow past offset {end}");
                self.fail(TransferError::ProtocolViolation(reason), fx);
                return;
            }
            total => total.flatten(),
        };
        let empty_at_cursor = chunk.data.is_empty() && chunk.offset == self.offset;
        if end <= self.offset && !empty_at_cursor {
            trace!(transfer_id = self.transfer_id, offset = chunk.offset, "discarding duplicate");
            return;
        }

        // Only the bytes beyond the cursor are new.
        let skip = (self.offset - chunk.offset) as usize;
        let fresh = chunk.data.slice(skip..);
        let fresh_end = self.offset + fresh.len() as u64;
        if fresh_end > self.window_end_offset {
            let reason = format!(
                "data up to {fresh_end} exceeds window end {}",
                self.window_end_offset
            );
            self.fail(TransferError::ProtocolViolation(reason), fx);
            return;
        }

        trace!(
            transfer_id = self.transfer_id,
            offset = self.offset,
            len = fresh.len(),
            "accepted data"
        );
        if !fresh.is_empty() {
            fx.push(Effect::Write {
                offset: self.offset,
                data: fresh,
            });
            self.offset = fresh_end;
        }
        self.retries = 0;
        self.last_activity = now;
        if matches!(self.state, SessionState::Handshake | SessionState::Retransmitting) {
            self.state = SessionState::Active;
            self.pending_retransmit_ranges.clear();
        }
        if total.is_some() {
            self.total_bytes = total;
        }

        if chunk.is_final() {
            debug!(transfer_id = self.transfer_id, offset = self.offset, "final chunk accepted");
            self.state = SessionState::Completing;
            fx.push(Effect::Flush);
            return;
        }
        self.maybe_extend(fx);
    }

    /// The transmitter's `status = OK`: its source is exhausted at `offset`.
    pub(super) fn receive_completion(&mut self, chunk: Chunk, now: Instant, fx: &mut Vec<Effect>) {
        if self.state == SessionState::Completing {
            return;
        }
        if chunk.offset > self.offset {
            self.request_retransmit(chunk.offset, now, fx);
            return;
        }
        if chunk.offset < self.offset {
            let reason = format!(
                "peer completed at {} but {} bytes are committed",
                chunk.offset, self.offset
            );
            self.fail(TransferError::ProtocolViolation(reason), fx);
            return;
        }
        debug!(transfer_id = self.transfer_id, offset = self.offset, "peer signalled completion");
        self.last_activity = now;
        self.total_bytes = Some(self.offset);
        self.state = SessionState::Completing;
        fx.push(Effect::Flush);
    }

    pub(super) fn on_write(
        &mut self,
        end_offset: u64,
        result: Result<(), Arc<io::Error>>,
        fx: &mut Vec<Effect>,
    ) {
        if self.role != Role::Receiver {
            return;
        }
        match result {
            Err(e) => self.fail(TransferError::ResourceIo(e), fx),
            Ok(()) => {
                self.written_offset = self.written_offset.max(end_offset);
                self.maybe_extend(fx);
            }
        }
    }

    pub(super) fn on_flush(&mut self, result: Result<(), Arc<io::Error>>, fx: &mut Vec<Effect>) {
        if self.state != SessionState::Completing || self.role != Role::Receiver {
            return;
        }
        if let Err(e) = result {
            self.fail(TransferError::ResourceIo(e), fx);
            return;
        }
        self.state = SessionState::Done;
        let ack = self.status(Status::OK);
        self.status_chunk = Some(ack.clone());
        fx.push(Effect::Emit(ack));
        fx.push(Effect::Finish(Ok(self.offset)));
    }

    pub(super) fn retry_receive(&mut self, fx: &mut Vec<Effect>) {
        if self.state == SessionState::Handshake {
            if let Some(start) = self.handshake_chunk.clone() {
                fx.push(Effect::Emit(start));
                return;
            }
        } else if self.state == SessionState::Active {
            self.state = SessionState::Retransmitting;
        }
        let params = self.parameters(ChunkType::ParametersRetransmit);
        fx.push(Effect::Emit(params));
    }

    fn request_retransmit(&mut self, seen: u64, now: Instant, fx: &mut Vec<Effect>) {
        // Already asked; the timeout re-asks if the request was lost.
        if self.state == SessionState::Retransmitting {
            return;
        }
        debug!(
            transfer_id = self.transfer_id,
            expected = self.offset,
            seen,
            "gap detected, requesting retransmit"
        );
        self.pending_retransmit_ranges = vec![self.offset..seen];
        self.state = SessionState::Retransmitting;
        self.last_activity = now;
        let params = self.parameters(ChunkType::ParametersRetransmit);
        fx.push(Effect::Emit(params));
    }

    /// Extend credit once it runs low, unless the sink is falling behind.
    fn maybe_extend(&mut self, fx: &mut Vec<Effect>) {
        if self.state != SessionState::Active || self.sink_backlogged() {
            return;
        }
        let remaining = self.window_end_offset - self.offset;
        if !self.params.window.should_extend(remaining) {
            return;
        }
        let params = self.parameters(ChunkType::ParametersContinue);
        debug!(
            transfer_id = self.transfer_id,
            offset = self.offset,
            window_end = self.window_end_offset,
            "extending window"
        );
        fx.push(Effect::Emit(params));
    }

    pub(super) fn sink_backlogged(&self) -> bool {
        self.role == Role::Receiver
            && self.offset - self.written_offset > u64::from(self.params.window.window_bytes)
    }

    /// Advertise the window, widening it unless the sink is backlogged.
    /// The window end never moves backwards.
    fn parameters(&mut self, kind: ChunkType) -> Chunk {
        if !self.sink_backlogged() {
            let window = u64::from(self.params.window.window_bytes);
            self.window_end_offset = self
                .window_end_offset
                .max(self.offset.saturating_add(window));
        }
        self.window_end_offset = self.window_end_offset.max(self.offset);
        let pending = (self.window_end_offset - self.offset).min(u64::from(u32::MAX)) as u32;
        let min_delay = (!self.min_delay.is_zero())
            .then(|| u32::try_from(self.min_delay.as_micros()).unwrap_or(u32::MAX));
        Chunk {
            transfer_id: self.transfer_id,
            chunk_type: Some(kind),
            offset: self.offset,
            pending_bytes: Some(pending),
            max_chunk_size_bytes: Some(self.max_chunk_size),
            min_delay_microseconds: min_delay,
            window_end_offset: self.window_end_offset,
            resource_id: self.announced_resource(),
            ..Chunk::default()
        }
    }
}
