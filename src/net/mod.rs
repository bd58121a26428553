//! Network field transparency.
//!
//! A [`server::NetworkServer`] record owns one connection to a remote server
//! through a [`transport::Transport`]. A [`field::NetworkField`] binds a
//! `record.field` name on that server and performs typed, blocking get and
//! put calls against it. Network proxy drivers in [`crate::drivers::network`]
//! are built from these two pieces.

pub mod address;
pub mod field;
pub mod loopback;
pub mod message;
pub mod server;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use address::FieldAddress;
pub use field::{NetworkField, RemoteShape};
pub use loopback::{LoopbackTransport, RequestLog};
pub use message::{Message, Operation};
pub use server::{NetworkServer, ServerVersion};
pub use tcp::TcpTransport;
pub use transport::Transport;
pub use wire::WireFormat;

use crate::handle::HandleTable;

/// Host used when an address names none.
pub const DEFAULT_HOST: &str = "localhost";
/// Port used when an address names none.
pub const DEFAULT_PORT: u16 = 9727;

/// What the socket table knows about a connected socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    /// Server record that owns the socket.
    pub server: String,
    /// Remote end, `host@port`.
    pub peer: String,
}

/// Per-process network state shared by every server record of a
/// [`crate::record::RecordList`].
#[derive(Debug, Default)]
pub struct NetworkContext {
    sockets: HandleTable<SocketEntry>,
}

impl NetworkContext {
    /// Empty socket table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected sockets, indexed by OS descriptor where the platform has one.
    pub fn sockets(&self) -> &HandleTable<SocketEntry> {
        &self.sockets
    }
}
