//! Binary framing for the stdio multiplexing protocol.
//!
//! Many independent editor connections are carried over one bidirectional
//! byte pipe as framed messages. Wire format is a fixed 9-byte header
//! followed by the payload:
//!
//! ```text
//! [type:1][conn_id:4 BE][length:4 BE][payload]
//! ```
//!
//! When the first bytes on the pipe do not form a valid header, the reader
//! attempts to recover a text diagnostic: a misconfigured transport (ssh,
//! docker, a shell) typically writes its error message to stdout where the
//! frame stream was expected, and surfacing that message verbatim beats an
//! opaque parse failure.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Payload limit for a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// Frame types for the multiplexing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// New virtual connection.
    Open = 0x01,
    /// Data payload for an open connection.
    Data = 0x02,
    /// Connection closed (idempotent on the receiver).
    Close = 0x03,
    /// Init phase: commit negotiation before any mux traffic.
    Init = 0x04,
}

impl FrameKind {
    /// Decode a wire type byte. Returns `None` for anything outside the
    /// protocol range.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Close),
            0x04 => Some(Self::Init),
            _ => None,
        }
    }
}

/// One multiplexed message: type, connection ID, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub conn_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// An OPEN frame announcing a new virtual connection.
    pub fn open(conn_id: u32) -> Self {
        Self { kind: FrameKind::Open, conn_id, payload: Vec::new() }
    }

    /// A DATA frame carrying bytes for an open connection.
    pub fn data(conn_id: u32, payload: Vec<u8>) -> Self {
        Self { kind: FrameKind::Data, conn_id, payload }
    }

    /// A CLOSE frame ending a virtual connection.
    pub fn close(conn_id: u32) -> Self {
        Self { kind: FrameKind::Close, conn_id, payload: Vec::new() }
    }

    /// An INIT frame carrying a commit hash (possibly empty) on conn 0.
    pub fn init(payload: Vec<u8>) -> Self {
        Self { kind: FrameKind::Init, conn_id: 0, payload }
    }
}

/// Errors produced by the frame reader and writer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended before a complete header was read. For the host
    /// read loop this is the normal termination signal, not a failure.
    #[error("frame stream closed")]
    Closed,

    /// The remote transport wrote a human-readable diagnostic where the
    /// binary frame stream was expected. Carries the recovered text.
    #[error("remote command wrote text instead of expected binary frame:\n  {0}")]
    RemoteText(String),

    /// The header bytes are not text but do not form a valid frame either.
    #[error("invalid frame: type=0x{kind:02x} length={length} (expected binary frame protocol)")]
    InvalidFrame { kind: u8, length: u32 },

    /// The header validated but the payload could not be read in full.
    #[error("read frame data: {0}")]
    Payload(#[source] io::Error),

    /// Serializing a frame onto the sink failed.
    #[error("write frame: {0}")]
    Write(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Write one frame to `w`. A zero-length payload emits only the header.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(9 + frame.payload.len());
    buf.push(frame.kind as u8);
    buf.extend_from_slice(&frame.conn_id.to_be_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    w.write_all(&buf).await.map_err(FrameError::Write)?;
    w.flush().await.map_err(FrameError::Write)?;
    Ok(())
}

/// Read one frame from `r`.
///
/// An invalid type byte or an oversized length triggers text recovery (see
/// module docs). End of stream before the header completes surfaces as
/// [`FrameError::Closed`].
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 9];
    if let Err(e) = r.read_exact(&mut header).await {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(e),
        });
    }

    let conn_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

    let kind = match FrameKind::from_byte(header[0]) {
        Some(kind) if (length as usize) <= MAX_FRAME_PAYLOAD => kind,
        _ => return Err(recover_text_error(header, length, r).await),
    };

    let mut payload = vec![0u8; length as usize];
    if length > 0 {
        r.read_exact(&mut payload).await.map_err(FrameError::Payload)?;
    }

    Ok(Frame { kind, conn_id, payload })
}

/// Interpret the already-read header bytes plus any remaining data as a text
/// error from the remote side. The follow-up read is bounded to 1024 bytes
/// and two seconds of wall clock so a transport that keeps the stream open
/// after writing garbage does not hang the reader.
async fn recover_text_error<R>(header: [u8; 9], length: u32, r: &mut R) -> FrameError
where
    R: AsyncRead + Unpin,
{
    let mut extra = [0u8; 1024];
    let n = match tokio::time::timeout(Duration::from_secs(2), r.read(&mut extra)).await {
        Ok(Ok(n)) => n,
        _ => 0,
    };

    let mut all = header.to_vec();
    all.extend_from_slice(&extra[..n]);

    if looks_like_text(&all) {
        let text = String::from_utf8_lossy(&all);
        let msg = text
            .trim_end_matches(|c: char| matches!(c, '\r' | '\n' | ' ' | '\t'))
            .to_string();
        FrameError::RemoteText(msg)
    } else {
        FrameError::InvalidFrame { kind: header[0], length }
    }
}

/// Whether `data` appears to be human-readable text rather than binary
/// frame bytes: more than 80% printable ASCII (or LF, CR, TAB).
fn looks_like_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let printable = data
        .iter()
        .filter(|&&b| (0x20..=0x7e).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    printable * 100 / data.len() > 80
}

/// A cloneable, mutex-serialized frame writer.
///
/// Both mux sides have several tasks producing frames onto one pipe; the
/// lock guarantees frames land on the wire intact and uninterleaved.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(w: W) -> Self {
        Self { inner: Arc::new(Mutex::new(w)) }
    }

    /// Write one frame, holding the sink lock for the full serialization.
    pub async fn send(&self, frame: &Frame) -> Result<(), FrameError> {
        let mut guard = self.inner.lock().await;
        write_frame(&mut *guard, frame).await
    }
}
