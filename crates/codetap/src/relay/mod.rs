//! Stdio multiplexing endpoints.
//!
//! [`host`] runs on the workstation: it accepts editor connections on a
//! host-visible Unix socket and carries them as frames over the stdin and
//! stdout of an operator-supplied subprocess (ssh, docker exec, kubectl
//! exec). [`remote`] runs inside the development environment: it consumes
//! those frames and dials the local editor-server socket per connection.

use std::collections::HashMap;
use std::sync::Arc;

use codetap_core::frame::{Frame, FrameWriter};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::error;

pub mod host;
pub mod remote;

/// Per-endpoint table of open virtual connections. Holds the write half of
/// each local socket; the read half is owned by that connection's pump task.
pub(crate) type ConnMap = Arc<Mutex<HashMap<u32, OwnedWriteHalf>>>;

/// Copy reads from a local socket into DATA frames until EOF or error, then
/// emit CLOSE and drop the connection from the table. Reads are capped at
/// 32 KiB per frame.
pub(crate) async fn pump_socket_reads<W>(
    conn_id: u32,
    mut read_half: OwnedReadHalf,
    conns: ConnMap,
    writer: FrameWriter<W>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match read_half.read(&mut buf).await {
            Ok(n) if n > 0 => {
                if let Err(e) = writer.send(&Frame::data(conn_id, buf[..n].to_vec())).await {
                    error!(conn = conn_id, error = %e, "write DATA frame failed");
                    conns.lock().await.remove(&conn_id);
                    return;
                }
            }
            // EOF or read error: either way the virtual connection is done.
            _ => {
                if let Err(e) = writer.send(&Frame::close(conn_id)).await {
                    error!(conn = conn_id, error = %e, "write CLOSE frame failed");
                }
                conns.lock().await.remove(&conn_id);
                return;
            }
        }
    }
}

/// Drop every tracked connection, closing the write halves.
pub(crate) async fn close_all(conns: &ConnMap) {
    conns.lock().await.clear();
}
