//! Server records: one connection to a remote record server.
//!
//! The connection is established lazily. The first request on a
//! [`NetworkServer`] connects the transport and asks for the server version,
//! which is cached for version-gated behaviour in proxy drivers. Requests on
//! one server are serialized by its connection mutex, so a single caller sees
//! replies in issue order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::loopback::{LoopbackTransport, RequestLog};
use super::message::{Message, Operation};
use super::tcp::TcpTransport;
use super::transport::Transport;
use super::wire::WireFormat;
use crate::device::class_access;
use crate::error::{ErrorKind, MxError, MxResult};
use crate::field::{FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::record::{
    ClassBody, CreateContext, DriverFactory, Record, RecordClass, RecordDriver, RecordList,
};

// =============================================================================
// Server version
// =============================================================================

/// Protocol version reported by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerVersion {
    /// Incompatible protocol changes.
    pub major: u32,
    /// Compatible additions.
    pub minor: u32,
    /// Fixes.
    pub update: u32,
}

impl ServerVersion {
    /// Version reported by servers built from this crate.
    pub const CURRENT: ServerVersion = ServerVersion::new(2, 1, 0);

    /// `major.minor.update`.
    pub const fn new(major: u32, minor: u32, update: u32) -> Self {
        Self {
            major,
            minor,
            update,
        }
    }

    /// Three big-endian `u32`s.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(self.major);
        buf.put_u32(self.minor);
        buf.put_u32(self.update);
        buf.freeze()
    }

    /// Inverse of [`ServerVersion::encode`].
    pub fn decode(payload: &Bytes) -> MxResult<Self> {
        if payload.len() < 12 {
            return Err(MxError::new(
                ErrorKind::NetworkIoError,
                "decode_server_version",
                format!("version payload is {} bytes, 12 expected", payload.len()),
            ));
        }
        let mut buf = payload.clone();
        Ok(Self::new(buf.get_u32(), buf.get_u32(), buf.get_u32()))
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.update)
    }
}

impl std::str::FromStr for ServerVersion {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let parse = |part: &str| {
            part.parse::<u32>().map_err(|e| {
                MxError::new(
                    ErrorKind::UnparseableString,
                    "parse_server_version",
                    format!("'{}' is not a version: {}", s, e),
                )
            })
        };
        match parts.as_slice() {
            [major, minor, update] => Ok(Self::new(parse(major)?, parse(minor)?, parse(update)?)),
            [major, minor] => Ok(Self::new(parse(major)?, parse(minor)?, 0)),
            _ => Err(MxError::new(
                ErrorKind::UnparseableString,
                "parse_server_version",
                format!("'{}' is not of the form major.minor.update", s),
            )),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

struct Connection {
    transport: Box<dyn Transport>,
    version: Option<ServerVersion>,
    next_id: u32,
}

/// Client connection to one remote record server.
/// // Requests are serialized by a mutex and carry increasing message ids.
/// The server version is fetched once per connection and cached.
pub struct NetworkServer {
    name: String,
    wire_format: WireFormat,
    timeout: Duration,
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("name", &self.name)
            .field("wire_format", &self.wire_format)
            .field("version", &self.cached_version())
            .finish()
    }
}

impl NetworkServer {
    /// Server called `name` reached through `transport`.
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        wire_format: WireFormat,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            wire_format,
            timeout,
            connection: Mutex::new(Connection {
                transport,
                version: None,
                next_id: 1,
            }),
        }
    }

    /// Server record name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encoding used for field values.
    pub fn wire_format(&self) -> WireFormat {
        self.wire_format
    }

    /// Round-trip timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True once connected and the version has been fetched.
    pub fn is_connected(&self) -> bool {
        let connection = self.connection.lock();
        connection.version.is_some() && connection.transport.is_connected()
    }

    /// Version retrieved when the connection was established, if it has been.
    pub fn cached_version(&self) -> Option<ServerVersion> {
        self.connection.lock().version
    }

    /// Server version, connecting first if needed.
    pub fn version(&self) -> MxResult<ServerVersion> {
        let mut connection = self.connection.lock();
        self.ensure_connected(&mut connection)
    }

    fn next_id(connection: &mut Connection) -> u32 {
        let id = connection.next_id;
        connection.next_id = connection.next_id.wrapping_add(1).max(1);
        id
    }

    fn ensure_connected(&self, connection: &mut Connection) -> MxResult<ServerVersion> {
        if let Some(version) = connection.version {
            if connection.transport.is_connected() {
                return Ok(version);
            }
        }
        connection.transport.connect()?;
        let request = Message::request(
            Operation::GetServerVersion,
            Self::next_id(connection),
            self.wire_format,
            "",
        );
        let reply = connection.transport.send_request(&request)?.into_result()?;
        let version = ServerVersion::decode(&reply.payload)?;
        info!(
            server = %self.name,
            peer = %connection.transport.peer(),
            %version,
            wire_format = %self.wire_format,
            "connected to server"
        );
        connection.version = Some(version);
        Ok(version)
    }

    /// One blocking round trip. Error replies come back as errors of the
    /// kind the server reported.
    pub fn request(
        &self,
        operation: Operation,
        address: &str,
        datatype: Option<FieldType>,
        dims: Vec<usize>,
        payload: Bytes,
    ) -> MxResult<Message> {
        let mut connection = self.connection.lock();
        self.ensure_connected(&mut connection)?;

        let mut request = Message::request(
            operation,
            Self::next_id(&mut connection),
            self.wire_format,
            address,
        )
        .with_dims(dims)
        .with_payload(payload);
        request.datatype = datatype;
        debug!(
            server = %self.name,
            address,
            operation = %operation,
            elements = request.element_count(),
            "network round trip"
        );

        match connection.transport.send_request(&request) {
            Ok(reply) => reply.into_result(),
            Err(err) => {
                if err.kind == ErrorKind::NetworkConnectionLost {
                    connection.version = None;
                }
                Err(err)
            }
        }
    }

    /// Close the transport and forget the cached version.
    pub fn disconnect(&self) -> MxResult<()> {
        let mut connection = self.connection.lock();
        connection.version = None;
        connection.transport.disconnect()
    }
}

// =============================================================================
// Server record class
// =============================================================================

/// Lifecycle driver of a server record.
pub trait ServerDriver: RecordDriver {
    /// Name of the transport, e.g. `tcp` or `loopback`.
    fn transport_name(&self) -> &'static str;
}

struct ConnectionDriver {
    server: Arc<NetworkServer>,
    transport_name: &'static str,
}

impl RecordDriver for ConnectionDriver {
    fn close(&mut self) -> MxResult<()> {
        self.server.disconnect()
    }

    fn delete_record(&mut self) -> MxResult<()> {
        self.server.disconnect()
    }
}

impl ServerDriver for ConnectionDriver {
    fn transport_name(&self) -> &'static str {
        self.transport_name
    }
}

/// Server record body.
pub struct ServerBody {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Connection shared with the records that proxy through it.
    pub server: Arc<NetworkServer>,
    /// Lifecycle driver.
    pub driver: Box<dyn ServerDriver>,
}

impl ServerBody {
    /// Body for a server reached at `host:port`.
    pub fn new(host: String, port: u16, server: Arc<NetworkServer>, transport_name: &'static str) -> Self {
        let driver = Box::new(ConnectionDriver {
            server: Arc::clone(&server),
            transport_name,
        });
        Self {
            host,
            port,
            server,
            driver,
        }
    }
}

class_access!(Server, ServerBody);

/// Connection handle of a server record.
pub fn server_handle(record: &Record) -> MxResult<Arc<NetworkServer>> {
    with_record(record, "server_handle", |s, _| Ok(Arc::clone(&s.server)))
}

struct ServerSettings {
    host: String,
    port: u16,
    wire_format: WireFormat,
    timeout: Duration,
}

fn server_settings(ctx: &CreateContext<'_>) -> MxResult<ServerSettings> {
    const OP: &str = "server_create_record_structures";
    let a = ctx.assignments;
    let host = a.string_or("hostname", &ctx.defaults.default_host)?;
    let port = a.usize_or("port", usize::from(ctx.defaults.default_port))?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| MxError::illegal_argument(OP, format!("{} is not a TCP port", port)))?;
    let wire_format = match a.get("wire_format") {
        Some(value) => value.as_str()?.parse()?,
        None => ctx.defaults.wire_format,
    };
    let timeout = match a.get("timeout_ms") {
        Some(value) => Duration::from_millis(value.as_u64()?),
        None => ctx.defaults.timeout,
    };
    if timeout.is_zero() {
        return Err(MxError::illegal_argument(OP, "timeout_ms must be positive"));
    }
    Ok(ServerSettings {
        host,
        port,
        wire_format,
        timeout,
    })
}

/// `tcp_server`: a server reached over TCP.
pub struct TcpServerFactory;

impl DriverFactory for TcpServerFactory {
    fn driver_type(&self) -> &'static str {
        "tcp_server"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Server
    }

    fn description(&self) -> &'static str {
        "remote record server over TCP"
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let settings = server_settings(ctx)?;
        let transport = TcpTransport::new(
            ctx.name,
            settings.host.clone(),
            settings.port,
            settings.timeout,
            Arc::clone(ctx.network),
        )?;
        let server = Arc::new(NetworkServer::new(
            ctx.name,
            Box::new(transport),
            settings.wire_format,
            settings.timeout,
        ));
        Ok(ClassBody::Server(ServerBody::new(
            settings.host,
            settings.port,
            server,
            "tcp",
        )))
    }
}

/// `loopback_server`: a server backed by another in-process record list.
///
/// Not part of the built-in registry, since it needs the list to serve.
pub struct LoopbackServerFactory {
    target: Arc<RecordList>,
    version: ServerVersion,
    log: RequestLog,
}

impl LoopbackServerFactory {
    /// Factory serving records from `target`.
    pub fn new(target: Arc<RecordList>) -> Self {
        Self {
            target,
            version: ServerVersion::CURRENT,
            log: RequestLog::new(),
        }
    }

    /// Report `version` instead of [`ServerVersion::CURRENT`].
    pub fn with_version(mut self, version: ServerVersion) -> Self {
        self.version = version;
        self
    }

    /// Log shared by every transport this factory creates.
    pub fn request_log(&self) -> RequestLog {
        self.log.clone()
    }
}

impl DriverFactory for LoopbackServerFactory {
    fn driver_type(&self) -> &'static str {
        "loopback_server"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Server
    }

    fn description(&self) -> &'static str {
        "record server served from an in-process record list"
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let settings = server_settings(ctx)?;
        let transport = LoopbackTransport::new(Arc::clone(&self.target))
            .with_version(self.version)
            .with_log(self.log.clone());
        let server = Arc::new(NetworkServer::new(
            ctx.name,
            Box::new(transport),
            settings.wire_format,
            settings.timeout,
        ));
        Ok(ClassBody::Server(ServerBody::new(
            settings.host,
            settings.port,
            server,
            "loopback",
        )))
    }
}

/// Field table of the server class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    fn server(body: &mut crate::record::RecordBody) -> MxResult<&mut ServerBody> {
        class_body(body.class_mut(), "server_field")
    }
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("hostname", FieldType::String, |b| {
            Ok(FieldValue::string(server(b)?.host.clone()))
        })
        .in_description()
        .with_flags(FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("port", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(u64::from(server(b)?.port)))
        })
        .in_description(),
        FieldDescriptor::class("wire_format", FieldType::String, |b| {
            Ok(FieldValue::string(server(b)?.server.wire_format().name()))
        })
        .in_description(),
        FieldDescriptor::class("timeout_ms", FieldType::ULong, |b| {
            let millis = server(b)?.server.timeout().as_millis();
            Ok(FieldValue::ulong(u64::try_from(millis).unwrap_or(u64::MAX)))
        })
        .in_description(),
        FieldDescriptor::class("transport", FieldType::String, |b| {
            Ok(FieldValue::string(server(b)?.driver.transport_name()))
        })
        .with_flags(runtime),
        FieldDescriptor::class("version", FieldType::String, |b| {
            Ok(FieldValue::string(server(b)?.server.version()?.to_string()))
        })
        .with_flags(runtime),
        FieldDescriptor::class("connected", FieldType::Bool, |b| {
            Ok(FieldValue::bool(server(b)?.server.is_connected()))
        })
        .with_flags(runtime),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_numerically() {
        let old: ServerVersion = "1.5.0".parse().unwrap();
        let gate = ServerVersion::new(1, 5, 7);
        assert!(old < gate);
        assert!("1.10.0".parse::<ServerVersion>().unwrap() > gate);
        assert_eq!(gate.to_string(), "1.5.7");
        assert_eq!(
            "1.x".parse::<ServerVersion>().unwrap_err().kind,
            ErrorKind::UnparseableString
        );
    }

    #[test]
    fn connecting_fetches_the_version_once() {
        let list = Arc::new(RecordList::new());
        let transport = LoopbackTransport::new(list).with_version(ServerVersion::new(1, 5, 0));
        let log = transport.request_log();
        let server = NetworkServer::new(
            "srv",
            Box::new(transport),
            WireFormat::Xdr,
            Duration::from_secs(1),
        );
        assert_eq!(server.cached_version(), None);
        assert_eq!(server.version().unwrap(), ServerVersion::new(1, 5, 0));
        assert_eq!(server.version().unwrap(), ServerVersion::new(1, 5, 0));
        assert_eq!(log.count(Operation::GetServerVersion), 1);
        assert!(server.is_connected());
    }

    #[test]
    fn remote_errors_keep_their_kind() {
        let list = Arc::new(RecordList::new());
        let server = NetworkServer::new(
            "srv",
            Box::new(LoopbackTransport::new(list)),
            WireFormat::Raw,
            Duration::from_secs(1),
        );
        let err = server
            .request(
                Operation::GetFieldType,
                "nosuch.position",
                None,
                Vec::new(),
                Bytes::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
