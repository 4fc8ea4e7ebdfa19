//! Remote-side mux endpoint.
//!
//! The mirror of the host side: consumes frames from its input stream,
//! dials the local editor-server socket per OPEN, fans socket reads back as
//! DATA frames. Never listens and never spawns. End of input is the normal
//! shutdown signal; every dialed socket is closed on the way out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use codetap_core::frame::{read_frame, Frame, FrameError, FrameKind, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{close_all, pump_socket_reads, ConnMap};

/// Relay between a frame stream and a local editor-server socket.
///
/// Reads frames from `input`, writes frames to `output`, and dials
/// `server_socket` once per OPEN. Returns cleanly when `input` ends.
pub async fn run_remote_side<R, W>(mut input: R, output: W, server_socket: &Path) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = FrameWriter::new(output);
    let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let frame = match read_frame(&mut input).await {
            Ok(frame) => frame,
            Err(FrameError::Closed) => {
                close_all(&conns).await;
                return Ok(());
            }
            Err(e) => {
                close_all(&conns).await;
                return Err(e).context("read frame");
            }
        };

        match frame.kind {
            FrameKind::Open => match UnixStream::connect(server_socket).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    conns.lock().await.insert(frame.conn_id, write_half);
                    info!(conn = frame.conn_id, "connection opened");
                    tokio::spawn(pump_socket_reads(
                        frame.conn_id,
                        read_half,
                        conns.clone(),
                        writer.clone(),
                    ));
                }
                Err(e) => {
                    error!(conn = frame.conn_id, error = %e, "connect to server socket");
                    writer
                        .send(&Frame::close(frame.conn_id))
                        .await
                        .context("write CLOSE frame")?;
                }
            },
            FrameKind::Data => {
                let failed = {
                    let mut map = conns.lock().await;
                    match map.get_mut(&frame.conn_id) {
                        Some(sock) => match sock.write_all(&frame.payload).await {
                            Ok(()) => false,
                            Err(e) => {
                                error!(conn = frame.conn_id, error = %e, "write to server socket failed");
                                map.remove(&frame.conn_id);
                                true
                            }
                        },
                        // DATA for an unknown conn is dropped.
                        None => false,
                    }
                };
                if failed {
                    writer
                        .send(&Frame::close(frame.conn_id))
                        .await
                        .context("write CLOSE frame")?;
                }
            }
            FrameKind::Close => {
                if conns.lock().await.remove(&frame.conn_id).is_some() {
                    info!(conn = frame.conn_id, "connection closed");
                }
            }
            // The INIT handshake happens before this loop; stray INITs are
            // ignored like any other unexpected frame.
            FrameKind::Init => {}
        }
    }
}
