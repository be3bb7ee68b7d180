//! Transmitter half: credit-limited reads, rewinds, and completion.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use spool_core::wire::{Chunk, ChunkType, Status, MAX_DATA_LEN};
use tracing::{debug, trace};

use super::{Effect, Opening, Role, SessionState, TransferSession};
use crate::error::TransferError;

impl TransferSession {
    pub(super) fn open_transmitter(
        &mut self,
        opening: Opening,
        len: Option<u64>,
        fx: &mut Vec<Effect>,
    ) {
        self.total_bytes = len;
        match opening {
            Opening::Initiate => {
                self.state = SessionState::Handshake;
                let start = Chunk {
                    transfer_id: self.transfer_id,
                    chunk_type: Some(ChunkType::Start),
                    offset: self.offset,
                    remaining_bytes: len.map(|l| l.saturating_sub(self.offset)),
                    resource_id: self.resource_id,
                    ..Chunk::default()
                };
                self.handshake_chunk = Some(start.clone());
                fx.push(Effect::Emit(start));
            }
            Opening::Respond => self.state = SessionState::Active,
            Opening::Resume => {
                self.state = SessionState::Active;
                fx.push(Effect::Emit(self.nudge()));
            }
        }
    }

    /// A chunk without status arriving at a transmitter.
    pub(super) fn transmit_control(&mut self, chunk: Chunk, now: Instant, fx: &mut Vec<Effect>) {
        match chunk.kind() {
            ChunkType::Start | ChunkType::ParametersRetransmit => self.rewind(&chunk, now, fx),
            ChunkType::ParametersContinue if self.state == SessionState::Handshake => {
                self.rewind(&chunk, now, fx)
            }
            ChunkType::ParametersContinue => {
                self.retries = 0;
                self.last_activity = now;
                self.apply_parameters(&chunk);
                trace!(
                    transfer_id = self.transfer_id,
                    window_end = self.window_end_offset,
                    "window extended"
                );
            }
            ChunkType::Data => {
                trace!(transfer_id = self.transfer_id, "ignoring data sent to a transmitter");
            }
        }
    }

    /// Restart transmission from the offset the receiver asks for.
    fn rewind(&mut self, chunk: &Chunk, now: Instant, fx: &mut Vec<Effect>) {
        let from = chunk.offset;
        let beyond_total = self.total_bytes.is_some_and(|total| from > total);
        let beyond_sent = !self.resumed && from > self.sent_high_water;
        if beyond_total || beyond_sent {
            let reason = format!(
                "retransmit requested from {from} but only {} bytes were sent",
                self.sent_high_water
            );
            self.fail(TransferError::ProtocolViolation(reason), fx);
            return;
        }

        self.apply_parameters(chunk);
        self.retries = 0;
        self.last_activity = now;
        self.final_chunk = None;
        self.next_send_at = None;
        if from != self.offset {
            debug!(
                transfer_id = self.transfer_id,
                from,
                sent = self.offset,
                "rewinding for retransmit"
            );
        }
        self.offset = from;
        self.sent_high_water = self.sent_high_water.max(from);
        self.state = if from < self.sent_high_water {
            SessionState::Retransmitting
        } else {
            SessionState::Active
        };
    }

    pub(super) fn apply_parameters(&mut self, chunk: &Chunk) {
        if let Some(max) = chunk.max_chunk_size_bytes.filter(|&m| m > 0) {
            self.max_chunk_size = max
                .min(self.params.window.max_chunk_size)
                .min(MAX_DATA_LEN);
        }
        if let Some(us) = chunk.min_delay_microseconds {
            self.min_delay = Duration::from_micros(us.into());
        }
        self.window_end_offset = self.window_end_offset.max(chunk.effective_window_end());
    }

    /// Issue the next read if credit, pacing, and state allow.
    pub(super) fn pump(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if !self.can_send() {
            return;
        }
        if self.next_send_at.is_some_and(|at| now < at) {
            return;
        }
        let credit = self.window_end_offset - self.offset;
        let max_len = credit.min(u64::from(self.max_chunk_size)) as u32;
        self.read_in_flight = Some(self.offset);
        fx.push(Effect::Read {
            offset: self.offset,
            max_len,
        });
    }

    pub(super) fn pacing_deadline(&self) -> Option<Instant> {
        if self.can_send() {
            self.next_send_at
        } else {
            None
        }
    }

    fn can_send(&self) -> bool {
        self.role == Role::Transmitter
            && self.opening.is_none()
            && matches!(self.state, SessionState::Active | SessionState::Retransmitting)
            && self.read_in_flight.is_none()
            && self.offset < self.window_end_offset
    }

    pub(super) fn on_read(
        &mut self,
        offset: u64,
        result: Result<Bytes, Arc<io::Error>>,
        now: Instant,
        fx: &mut Vec<Effect>,
    ) {
        if self.read_in_flight != Some(offset) {
            return;
        }
        self.read_in_flight = None;
        if offset != self.offset
            || !matches!(self.state, SessionState::Active | SessionState::Retransmitting)
        {
            trace!(transfer_id = self.transfer_id, offset, "discarding stale read");
            return;
        }
        let mut data = match result {
            Ok(data) => data,
            Err(e) => {
                self.fail(TransferError::ResourceIo(e), fx);
                return;
            }
        };

        if data.is_empty() && self.total_bytes.is_none() {
            debug!(transfer_id = self.transfer_id, offset, "source exhausted");
            let done = self.status(Status::OK);
            self.status_chunk = Some(done.clone());
            self.final_chunk = Some(done.clone());
            self.state = SessionState::Completing;
            self.last_activity = now;
            fx.push(Effect::Emit(done));
            return;
        }

        let limit = (self.window_end_offset - offset).min(u64::from(self.max_chunk_size));
        if data.len() as u64 > limit {
            data.truncate(limit as usize);
        }
        let end = offset + data.len() as u64;
        let is_final = self
            .total_bytes
            .is_some_and(|total| end >= total || data.is_empty());
        let remaining_bytes = self
            .total_bytes
            .map(|total| if is_final { 0 } else { total - end });

        trace!(transfer_id = self.transfer_id, offset, len = data.len(), "sending data");
        let chunk = Chunk {
            transfer_id: self.transfer_id,
            chunk_type: Some(ChunkType::Data),
            offset,
            data,
            remaining_bytes,
            window_end_offset: self.window_end_offset,
            ..Chunk::default()
        };
        if self.state == SessionState::Retransmitting {
            self.state = SessionState::Active;
        }
        self.offset = end;
        self.sent_high_water = self.sent_high_water.max(end);
        self.last_activity = now;
        if !self.min_delay.is_zero() {
            self.next_send_at = Some(now + self.min_delay);
        }
        if is_final {
            self.state = SessionState::Completing;
            self.final_chunk = Some(chunk.clone());
        }
        fx.push(Effect::Emit(chunk));
    }

    pub(super) fn retry_transmit(&mut self, fx: &mut Vec<Effect>) {
        let chunk = match self.state {
            SessionState::Handshake => self.handshake_chunk.clone(),
            SessionState::Completing => self.final_chunk.clone(),
            _ => {
                debug!(transfer_id = self.transfer_id, offset = self.offset, "out of credit, probing");
                Some(self.nudge())
            }
        };
        if let Some(chunk) = chunk {
            fx.push(Effect::Emit(chunk));
        }
    }

    fn nudge(&self) -> Chunk {
        Chunk {
            transfer_id: self.transfer_id,
            chunk_type: Some(ChunkType::Data),
            offset: self.offset,
            window_end_offset: self.window_end_offset.max(self.offset),
            resource_id: self.announced_resource(),
            ..Chunk::default()
        }
    }
}
