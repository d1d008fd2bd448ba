//! Exec stream demultiplexing.
//!
//! A non-tty exec attach yields one byte stream carrying both stdout and
//! stderr. Each frame is an 8-byte header followed by the payload:
//!
//! ```text
//! [ stream: u8 ][ 0 ][ 0 ][ 0 ][ length: u32 big-endian ][ payload ... ]
//! ```
//!
//! `stream` is 0 (stdin, written on stdout), 1 (stdout) or 2 (stderr).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};

use agent_sandbox_core::{Error, Result};

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Logical channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

/// Incremental frame parser. Feed arbitrary chunks, pull complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buf[0];
        let kind = StreamKind::from_tag(tag)
            .ok_or_else(|| Error::decode(format!("unknown stream tag {}", tag)))?;

        if self.buf[1..4] != [0u8, 0, 0] {
            return Err(Error::decode(format!(
                "non-zero header padding {:?}",
                &self.buf[1..4]
            )));
        }

        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Check that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::decode(format!(
                "stream ended mid-frame with {} trailing bytes",
                self.buf.len()
            )))
        }
    }
}

/// Encode `payload` as one or more frames on channel `kind`.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Bytes {
    const MAX_PAYLOAD: usize = u32::MAX as usize;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    let mut rest = payload;
    loop {
        let (head, tail) = rest.split_at(rest.len().min(MAX_PAYLOAD));
        buf.put_u8(kind.tag());
        buf.put_slice(&[0, 0, 0]);
        buf.put_u32(head.len() as u32);
        buf.put_slice(head);
        rest = tail;
        if rest.is_empty() {
            break;
        }
    }
    buf.freeze()
}

/// Fully drained exec output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Accumulates frames into separate stdout and stderr buffers.
///
/// Text is decoded once at the end so multi-byte characters split across
/// frames come out intact.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    decoder: FrameDecoder,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the raw stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.decoder.push(chunk);
        while let Some(frame) = self.decoder.next_frame()? {
            match frame.kind {
                StreamKind::Stdin | StreamKind::Stdout => self.stdout.extend_from_slice(&frame.payload),
                StreamKind::Stderr => self.stderr.extend_from_slice(&frame.payload),
            }
        }
        Ok(())
    }

    /// Finish decoding. Fails if the stream stopped inside a frame.
    pub fn finish(self) -> Result<DemuxedOutput> {
        self.decoder.finish()?;
        Ok(DemuxedOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        })
    }
}

/// Drain a multiplexed stream to completion.
pub async fn demultiplex<S>(mut stream: S) -> Result<DemuxedOutput>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut demux = Demultiplexer::new();
    while let Some(chunk) = stream.next().await {
        demux.feed(&chunk?)?;
    }
    demux.finish()
}
