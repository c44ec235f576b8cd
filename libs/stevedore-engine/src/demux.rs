//! Decoder for the engine's multiplexed attach/exec stream.
//!
//! Every frame is an 8-byte header followed by its payload:
//!
//! ```text
//! [kind: u8][reserved: 3 bytes][length: u32 big-endian][payload: length bytes]
//! ```
//!
//! Kind 0 is stdin echo and is dropped, 1 is stdout, 2 is stderr. The
//! reserved bytes are never inspected.

use futures_util::stream::{self, Stream};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 8;

const STDIN_KIND: u8 = 0;
const STDOUT_KIND: u8 = 1;
const STDERR_KIND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// `Ok(None)` for stdin echo, which is decoded but never surfaced
    fn from_wire(byte: u8) -> Result<Option<Self>, DemuxError> {
        match byte {
            STDIN_KIND => Ok(None),
            STDOUT_KIND => Ok(Some(StreamKind::Stdout)),
            STDERR_KIND => Ok(Some(StreamKind::Stderr)),
            other => Err(DemuxError::UnknownStream(other)),
        }
    }

    fn wire_byte(self) -> u8 {
        match self {
            StreamKind::Stdout => STDOUT_KIND,
            StreamKind::Stderr => STDERR_KIND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

impl StreamFrame {
    pub fn stdout(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            payload: payload.into(),
        }
    }

    /// Wire encoding of this frame, reserved bytes zeroed
    pub fn encode(&self) -> Result<Vec<u8>, DemuxError> {
        encode_frame(self.kind.wire_byte(), &self.payload)
    }
}

/// Encode one frame with an arbitrary kind byte
pub fn encode_frame(kind: u8, payload: &[u8]) -> Result<Vec<u8>, DemuxError> {
    let len = declared_len(payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// The header length field is 32 bits; anything larger cannot be framed
fn declared_len(len: usize) -> Result<u32, DemuxError> {
    u32::try_from(len).map_err(|_| DemuxError::PayloadTooLarge(len))
}

#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("stream ended inside a frame header ({got} of 8 bytes)")]
    TruncatedHeader { got: usize },

    #[error("stream ended inside a frame payload ({got} of {declared} bytes)")]
    TruncatedPayload { declared: u32, got: usize },

    #[error("unknown stream kind {0}")]
    UnknownStream(u8),

    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),

    #[error("stream read failed: {0}")]
    Io(#[from] io::Error),
}

fn parse_header(header: &[u8; HEADER_LEN]) -> (u8, u32) {
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (header[0], len)
}

/// Pull-based decoder over an async byte stream.
///
/// Single pass: once it has returned end-of-stream or an error, every later
/// call returns `Ok(None)`.
pub struct FrameReader<R> {
    inner: R,
    done: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    /// Next stdout/stderr frame, `Ok(None)` at a clean end of stream
    pub async fn next_frame(&mut self) -> Result<Option<StreamFrame>, DemuxError> {
        if self.done {
            return Ok(None);
        }
        let result = self.read_frame().await;
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result
    }

    async fn read_frame(&mut self) -> Result<Option<StreamFrame>, DemuxError> {
        loop {
            let mut header = [0u8; HEADER_LEN];
            let got = read_up_to(&mut self.inner, &mut header).await?;
            if got == 0 {
                return Ok(None);
            }
            if got < HEADER_LEN {
                return Err(DemuxError::TruncatedHeader { got });
            }

            let (kind, declared) = parse_header(&header);

            // Grows with what actually arrives; the declared length is untrusted
            let mut payload = Vec::new();
            (&mut self.inner)
                .take(u64::from(declared))
                .read_to_end(&mut payload)
                .await?;
            if payload.len() < declared as usize {
                return Err(DemuxError::TruncatedPayload {
                    declared,
                    got: payload.len(),
                });
            }

            match StreamKind::from_wire(kind)? {
                Some(kind) => return Ok(Some(StreamFrame { kind, payload })),
                None => continue,
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Adapt into a `Stream`; it ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamFrame, DemuxError>> {
        stream::unfold(self, |mut reader| async move {
            match reader.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }
}

/// Fill `buf` until it is full or the reader hits end of stream
async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// The same decoder over bytes already in memory
pub struct FrameIter<'a> {
    remaining: &'a [u8],
    done: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            remaining: bytes,
            done: false,
        }
    }

    fn fail(&mut self, err: DemuxError) -> Option<Result<StreamFrame, DemuxError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<StreamFrame, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.remaining.is_empty() {
                self.done = true;
                return None;
            }
            if self.remaining.len() < HEADER_LEN {
                let got = self.remaining.len();
                return self.fail(DemuxError::TruncatedHeader { got });
            }

            let (header, rest) = self.remaining.split_at(HEADER_LEN);
            let mut fixed = [0u8; HEADER_LEN];
            fixed.copy_from_slice(header);
            let (kind, declared) = parse_header(&fixed);

            if rest.len() < declared as usize {
                let got = rest.len();
                return self.fail(DemuxError::TruncatedPayload { declared, got });
            }
            let (payload, rest) = rest.split_at(declared as usize);
            self.remaining = rest;

            match StreamKind::from_wire(kind) {
                Ok(Some(kind)) => {
                    return Some(Ok(StreamFrame {
                        kind,
                        payload: payload.to_vec(),
                    }))
                }
                Ok(None) => continue,
                Err(e) => return self.fail(e),
            }
        }
        None
    }
}
