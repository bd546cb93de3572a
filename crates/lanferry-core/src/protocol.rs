//! Wire protocol for Lanferry.
//!
//! Every stream, control or data, carries the same framing:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Frame                       │
//! ├────────────┬────────────┬───────────────────┤
//! │    Type    │   Length   │      Payload      │
//! │   1 byte   │  4 bytes   │ (variable length) │
//! └────────────┴────────────┴───────────────────┘
//! ```
//!
//! - Type: message type byte, one of `{0, 1, 2}`
//! - Length: payload length in bytes, little-endian, at most [`BLOCK_SIZE`]
//!
//! A zero-length payload is legal and serves as a typed signal. All
//! integers carried in payloads are little-endian non-negative `int32`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// Frame header size in bytes: one type byte plus a 4-byte length.
pub const HEADER_SIZE: usize = 5;

/// Message types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Negotiation payload: password, file metadata, resume point
    Metadata = 0,
    /// One block of file content
    Data = 1,
    /// End of a transfer, or rejection during negotiation
    EndOfTransfer = 2,
}

impl MessageKind {
    /// Parse a message type from its wire byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Metadata),
            1 => Some(Self::Data),
            2 => Some(Self::EndOfTransfer),
            _ => None,
        }
    }
}

/// One received frame, borrowing the channel's receive buffer.
///
/// The payload view is only valid until the next `receive` on the same
/// channel; callers that keep payload across further receives must copy.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Message type
    pub kind: MessageKind,
    /// Payload bytes
    pub payload: &'a [u8],
}

/// A framed message channel over a reliable ordered byte stream.
///
/// The channel never correlates sends and receives; ordering is FIFO in
/// each direction independently. It holds a single reusable receive
/// buffer of [`BLOCK_SIZE`] bytes and must not be shared across streams.
///
/// Any short read or write is fatal: the channel must be dropped and the
/// underlying stream discarded.
#[derive(Debug)]
pub struct FramedChannel<S> {
    stream: S,
    recv_buf: Vec<u8>,
    closed: bool,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a byte stream in a framed channel.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            recv_buf: vec![0u8; BLOCK_SIZE],
            closed: false,
        }
    }

    /// Send one frame.
    ///
    /// The payload may be empty; then only the header goes on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`close`](Self::close), and a
    /// fatal [`Error::Io`] if the peer closed mid-write.
    pub async fn send(&mut self, kind: MessageKind, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Disposed);
        }
        if payload.len() > BLOCK_SIZE {
            return Err(Error::FrameTooLarge {
                size: payload.len() as u32,
                max: BLOCK_SIZE,
            });
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0] = kind as u8;
        header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());

        self.stream.write_all(&header).await?;
        if !payload.is_empty() {
            self.stream.write_all(payload).await?;
        }
        self.stream.flush().await?;

        Ok(())
    }

    /// Receive one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`close`](Self::close),
    /// [`Error::FrameTooLarge`] without consuming the payload if the
    /// declared size exceeds [`BLOCK_SIZE`], [`Error::Protocol`] on an
    /// unknown type byte, and a fatal [`Error::Io`] if the stream ends
    /// short.
    pub async fn receive(&mut self) -> Result<Frame<'_>> {
        if self.closed {
            return Err(Error::Disposed);
        }

        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).await?;

        let kind = MessageKind::from_byte(header[0])
            .ok_or_else(|| Error::Protocol(format!("unknown message type {:#04x}", header[0])))?;
        let size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);

        if size as usize > BLOCK_SIZE {
            return Err(Error::FrameTooLarge {
                size,
                max: BLOCK_SIZE,
            });
        }

        let payload = &mut self.recv_buf[..size as usize];
        if !payload.is_empty() {
            self.stream.read_exact(payload).await?;
        }

        Ok(Frame {
            kind,
            payload: &self.recv_buf[..size as usize],
        })
    }

    /// Close the channel. Further sends and receives fail with
    /// [`Error::Disposed`].
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Unwrap the channel, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Metadata describing one file offered for transfer.
///
/// Transmitted as three consecutive `Metadata` frames: UTF-8 name, raw
/// hash bytes, then the 4-byte size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File name, without any directory component
    pub name: String,
    /// Content digest; treated purely as a resume identity key
    pub hash: Vec<u8>,
    /// File size in bytes
    pub size: u32,
}

impl FileMetadata {
    /// Hex rendering of the hash, used as the sidecar file name.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Number of whole or partial blocks in the file.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        (self.size as usize).div_ceil(crate::BLOCK_SIZE) as u32
    }
}

/// Encode a non-negative `int32` to its 4-byte wire form.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the value does not fit in an `int32`.
pub fn encode_int32(value: u32) -> Result<[u8; 4]> {
    if value > i32::MAX as u32 {
        return Err(Error::Protocol(format!("integer {value} overflows int32")));
    }
    Ok(value.to_le_bytes())
}

/// Decode a non-negative little-endian `int32` payload.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the payload is not exactly 4 bytes or
/// the value is negative.
pub fn decode_int32(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| Error::Protocol(format!("expected 4-byte integer, got {}", payload.len())))?;
    let value = i32::from_le_bytes(bytes);
    u32::try_from(value).map_err(|_| Error::Protocol(format!("negative integer {value}")))
}

/// Decode a UTF-8 text payload.
///
/// # Errors
///
/// Returns [`Error::Protocol`] on invalid UTF-8.
pub fn decode_text(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| Error::Protocol(format!("invalid UTF-8 payload: {e}")))
}
