//! TCP transport.
//!
//! A blocking facade over a current-thread tokio runtime owned by the
//! transport. Each request is written and its reply awaited under the
//! connection's timeout. A timed-out call leaves the connection open; its
//! late reply is recognised by message id and discarded by the next call.
//!
//! Received bytes collect in a per-connection buffer and frames are cut from
//! it by length, so a timeout that fires halfway through a reply keeps the
//! part already read. A timeout that fires before the request was fully
//! written closes the connection, since the peer holds a partial frame.
//!
//! `send_request` must not be called from inside an async context.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::message::{Message, HEADER_LENGTH};
use super::transport::Transport;
use super::{NetworkContext, SocketEntry};
use crate::error::{ErrorKind, MxError, MxResult};
use crate::handle::Handle;

/// Blocking TCP connection to one record server.
pub struct TcpTransport {
    server_name: String,
    host: String,
    port: u16,
    timeout: Duration,
    network: Arc<NetworkContext>,
    handle: Option<Handle>,
    // Dropped before the runtime that drives it.
    connection: Option<Connection>,
    runtime: Runtime,
}

struct Connection {
    stream: TcpStream,
    received: BytesMut,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("server", &self.server_name)
            .field("peer", &self.peer())
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl TcpTransport {
    /// Transport for `host:port`. No connection is made until first use.
    ///
    /// `timeout` bounds connecting and every request round trip. Sockets are
    /// registered in `network`'s socket table while connected.
    pub fn new(
        server_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
        network: Arc<NetworkContext>,
    ) -> MxResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MxError::from(e).in_operation("tcp_transport_new"))?;
        Ok(Self {
            server_name: server_name.into(),
            host: host.into(),
            port,
            timeout,
            network,
            handle: None,
            connection: None,
            runtime,
        })
    }

    /// Socket table entry of the live connection.
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    fn timed_out(&self, operation: &'static str) -> MxError {
        MxError::new(
            ErrorKind::TimedOut,
            operation,
            format!("no answer from {} within {:?}", self.peer(), self.timeout),
        )
    }

    fn register(&mut self, stream: &TcpStream) {
        let entry = Arc::new(SocketEntry {
            server: self.server_name.clone(),
            peer: self.peer(),
        });
        let handle = match descriptor(stream) {
            Some(fd) => self.network.sockets().allocate_or_replace(fd, entry),
            None => self.network.sockets().allocate(entry),
        };
        debug!(server = %self.server_name, %handle, "socket registered");
        self.handle = Some(handle);
    }

    /// Remove the socket from the table, then close it, so the descriptor
    /// cannot be reused by the OS while still registered.
    fn drop_connection(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.network.sockets().delete(handle) {
                warn!(server = %self.server_name, %handle, error = %err, "socket was not registered");
            }
        }
        self.connection = None;
    }
}

#[cfg(unix)]
fn descriptor(stream: &TcpStream) -> Option<usize> {
    use std::os::unix::io::AsRawFd;
    usize::try_from(stream.as_raw_fd()).ok()
}

#[cfg(not(unix))]
fn descriptor(_stream: &TcpStream) -> Option<usize> {
    None
}

/// Cut one complete frame off the front of `received`, if there is one.
fn take_frame(received: &mut BytesMut) -> MxResult<Option<Message>> {
    if received.len() < HEADER_LENGTH {
        return Ok(None);
    }
    let total = HEADER_LENGTH + Message::body_length(&received[..HEADER_LENGTH])?;
    if received.len() < total {
        return Ok(None);
    }
    let frame = received.split_to(total);
    Message::decode(&frame).map(Some)
}

async fn exchange(
    connection: &mut Connection,
    frame: &[u8],
    message_id: u32,
    peer: &str,
    written: &mut bool,
) -> MxResult<Message> {
    connection.stream.write_all(frame).await?;
    *written = true;
    loop {
        while let Some(reply) = take_frame(&mut connection.received)? {
            if reply.reply && reply.message_id == message_id {
                return Ok(reply);
            }
            warn!(
                peer,
                expected = message_id,
                received = reply.message_id,
                "discarding stale reply"
            );
        }
        // `read_buf` only appends what it has read, so cancelling it at a
        // timeout loses nothing.
        if connection.stream.read_buf(&mut connection.received).await? == 0 {
            return Err(MxError::new(
                ErrorKind::NetworkConnectionLost,
                "tcp_receive",
                format!("{} closed the connection", peer),
            ));
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> MxResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let connecting = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, connecting).await })
        {
            Ok(result) => result.map_err(|e| MxError::from(e).in_operation("tcp_connect"))?,
            Err(_) => return Err(self.timed_out("tcp_connect")),
        };
        stream
            .set_nodelay(true)
            .map_err(|e| MxError::from(e).in_operation("tcp_connect"))?;
        self.register(&stream);
        self.connection = Some(Connection {
            stream,
            received: BytesMut::with_capacity(4096),
        });
        info!(server = %self.server_name, peer = %self.peer(), "tcp connection established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn send_request(&mut self, request: &Message) -> MxResult<Message> {
        self.connect()?;
        let peer = self.peer();
        let frame = request.encode();
        let timeout = self.timeout;
        let connection = self.connection.as_mut().ok_or_else(|| {
            MxError::new(
                ErrorKind::NetworkConnectionLost,
                "tcp_send_request",
                format!("not connected to {}", peer),
            )
        })?;

        let mut written = false;
        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(
                timeout,
                exchange(connection, &frame, request.message_id, &peer, &mut written),
            )
            .await
        });
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                // Transport and framing failures leave the stream unusable.
                self.drop_connection();
                Err(err.in_operation("tcp_send_request"))
            }
            Err(_) => {
                if !written {
                    warn!(server = %self.server_name, "request only partly written, closing connection");
                    self.drop_connection();
                }
                Err(self.timed_out("tcp_send_request"))
            }
        }
    }

    fn disconnect(&mut self) -> MxResult<()> {
        if self.connection.is_some() {
            self.drop_connection();
            info!(server = %self.server_name, peer = %self.peer(), "tcp connection closed");
        }
        Ok(())
    }

    fn peer(&self) -> String {
        format!("{}@{}", self.host, self.port)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::Operation;
    use crate::net::wire::WireFormat;

    fn reply(message_id: u32) -> Message {
        Message::request(Operation::GetServerVersion, message_id, WireFormat::Xdr, "").reply()
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let frame = reply(7).encode();
        let mut received = BytesMut::new();

        received.extend_from_slice(&frame[..HEADER_LENGTH - 4]);
        assert!(take_frame(&mut received).unwrap().is_none());
        received.extend_from_slice(&frame[HEADER_LENGTH - 4..frame.len() - 1]);
        assert!(take_frame(&mut received).unwrap().is_none());
        received.extend_from_slice(&frame[frame.len() - 1..]);

        let message = take_frame(&mut received).unwrap().unwrap();
        assert_eq!(message.message_id, 7);
        assert!(received.is_empty());
    }

    #[test]
    fn back_to_back_frames_are_cut_apart() {
        let mut received = BytesMut::new();
        received.extend_from_slice(&reply(1).encode());
        received.extend_from_slice(&reply(2).encode());

        assert_eq!(take_frame(&mut received).unwrap().unwrap().message_id, 1);
        assert_eq!(take_frame(&mut received).unwrap().unwrap().message_id, 2);
        assert!(take_frame(&mut received).unwrap().is_none());
    }
}
