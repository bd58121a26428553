//! The synchronous round-trip interface network server records talk through.

use super::message::Message;
use crate::error::MxResult;

/// A connection that carries one request at a time.
///
/// `send_request` blocks the calling thread until the matching reply arrives,
/// the connection's timeout expires (`TimedOut`) or the connection drops
/// (`NetworkConnectionLost`). Error replies are returned as `Ok`; the caller
/// decides when to turn them into errors with [`Message::into_result`].
pub trait Transport: Send {
    /// Establish the connection. Called lazily before the first request.
    fn connect(&mut self) -> MxResult<()> {
        Ok(())
    }

    /// True while the connection is up.
    fn is_connected(&self) -> bool;

    /// Send `request` and wait for its reply.
    fn send_request(&mut self, request: &Message) -> MxResult<Message>;

    /// Close the connection. Safe to call when already closed.
    fn disconnect(&mut self) -> MxResult<()> {
        Ok(())
    }

    /// Short peer description for logs.
    fn peer(&self) -> String;
}
