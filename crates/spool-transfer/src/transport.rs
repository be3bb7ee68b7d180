//! Transport: how chunks reach the peer.
//!
//! The engine consumes a pair of frame channels and does not care what sits
//! behind them. [`Transport::pair`] connects two engines in memory;
//! [`Transport::spawn_stream`] runs a minimal framing over any byte stream:
//!
//! ```text
//! [tag: u8][varint: payload length][payload: encoded Chunk]
//!
//! tag bits 0-1  method (1 = Read, 2 = Write)
//! tag bit 7     set when the stream's server side sent the frame
//! ```

use std::io;

use bytes::{Bytes, BytesMut};
use spool_core::wire::{encode_varint, Method, MAX_DATA_LEN, MAX_VARINT_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest frame payload accepted: a full data chunk plus its fields.
pub const MAX_FRAME_LEN: u64 = MAX_DATA_LEN as u64 + 64;

const METHOD_MASK: u8 = 0x03;
const FROM_SERVER: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method: Method,
    /// Sent by the side serving the stream, addressed to its client.
    pub from_server: bool,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport I/O: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame tag {0:#04x}")]
    BadTag(u8),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u64),
}

pub struct Transport {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl Transport {
    pub fn from_channels(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Self {
        Self { tx, rx }
    }

    /// Two transports wired to each other.
    pub fn pair(capacity: usize) -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (Self::from_channels(a_tx, a_rx), Self::from_channels(b_tx, b_rx))
    }

    pub fn into_channels(self) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        (self.tx, self.rx)
    }

    /// Frame a byte stream. Two pumps run until the stream closes, either
    /// pump fails, or `shutdown` fires; then the inbound channel ends.
    pub fn spawn_stream<R, W>(
        reader: R,
        writer: W,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Transport
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let link = shutdown.child_token();
        tokio::spawn(read_pump(reader, in_tx, link.clone()));
        tokio::spawn(write_pump(writer, out_rx, link));
        Self::from_channels(out_tx, in_rx)
    }
}

async fn read_pump<R>(mut reader: R, inbound: mpsc::Sender<Frame>, link: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = link.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("peer closed the stream");
                break;
            }
            Err(e) => {
                warn!(error = %e, "dropping connection on bad frame");
                break;
            }
        }
    }
    link.cancel();
}

async fn write_pump<W>(writer: W, mut outbound: mpsc::Receiver<Frame>, link: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    loop {
        let frame = tokio::select! {
            _ = link.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = write_batch(&mut writer, frame, &mut outbound).await {
            warn!(error = %e, "transport write failed");
            break;
        }
    }
    link.cancel();
    let _ = writer.shutdown().await;
}

/// Write `first` and whatever else is already queued, then flush once.
async fn write_batch<W>(
    writer: &mut W,
    first: Frame,
    outbound: &mut mpsc::Receiver<Frame>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &first).await?;
    while let Ok(frame) = outbound.try_recv() {
        write_frame(writer, &frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = frame.payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut header = BytesMut::with_capacity(1 + MAX_VARINT_LEN);
    let mut tag = frame.method as u8;
    if frame.from_server {
        tag |= FROM_SERVER;
    }
    header.extend_from_slice(&[tag]);
    encode_varint(len, &mut header);
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}

/// Next frame, or `None` when the stream ends cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if tag & !(METHOD_MASK | FROM_SERVER) != 0 {
        return Err(FrameError::BadTag(tag));
    }
    let method = Method::try_from(tag & METHOD_MASK).map_err(|_| FrameError::BadTag(tag))?;

    let mut len = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        len |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            break;
        }
        if i == MAX_VARINT_LEN - 1 {
            return Err(FrameError::TooLarge(u64::MAX));
        }
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        method,
        from_server: tag & FROM_SERVER != 0,
        payload: Bytes::from(payload),
    }))
}
