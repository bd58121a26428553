//! In-process transport.
//!
//! Serves the same messages a remote server would, against a separate
//! [`RecordList`]. Every request is appended to a shared [`RequestLog`], which
//! is how callers can check exactly what went over the "wire".

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;

use super::message::{Message, Operation};
use super::server::ServerVersion;
use super::transport::Transport;
use super::wire::{decode_elements, encode_elements, WireFormat};
use crate::error::{MxError, MxResult};
use crate::field::{element_count, FieldType, FieldValue};
use crate::record::{Record, RecordList};

/// One request as received by a loopback server.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRequest {
    /// Request operation.
    pub operation: Operation,
    /// `record.field` named by the request.
    pub address: String,
    /// Datatype the client asked for.
    pub datatype: Option<FieldType>,
    /// Dimensions the client asked for.
    pub dims: Vec<usize>,
    /// Encoding the client asked for.
    pub wire_format: WireFormat,
}

/// Shared, append-only record of loopback requests.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    entries: Arc<Mutex<Vec<LoggedRequest>>>,
}

impl RequestLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, request: &Message) {
        self.entries.lock().push(LoggedRequest {
            operation: request.operation,
            address: request.address.clone(),
            datatype: request.datatype,
            dims: request.dims.clone(),
            wire_format: request.wire_format,
        });
    }

    /// Copy of every entry, oldest first.
    pub fn entries(&self) -> Vec<LoggedRequest> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Requests that named `address` (`record.field`).
    pub fn for_address(&self, address: &str) -> Vec<LoggedRequest> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.address == address)
            .cloned()
            .collect()
    }

    /// Number of requests of `operation`.
    pub fn count(&self, operation: Operation) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.operation == operation)
            .count()
    }
}

/// Transport that serves requests from an in-process [`RecordList`].
/// // Payloads go through the same wire encoders as over TCP, so wire formats
/// and dimension handling are exercised without sockets.
pub struct LoopbackTransport {
    target: Arc<RecordList>,
    version: ServerVersion,
    log: RequestLog,
    connected: bool,
}

impl LoopbackTransport {
    /// Transport serving `target`.
    pub fn new(target: Arc<RecordList>) -> Self {
        Self {
            target,
            version: ServerVersion::CURRENT,
            log: RequestLog::new(),
            connected: false,
        }
    }

    /// Report `version` instead of [`ServerVersion::CURRENT`].
    pub fn with_version(mut self, version: ServerVersion) -> Self {
        self.version = version;
        self
    }

    /// Append requests to `log`.
    pub fn with_log(mut self, log: RequestLog) -> Self {
        self.log = log;
        self
    }

    /// Log of the requests served.
    pub fn request_log(&self) -> RequestLog {
        self.log.clone()
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self) -> MxResult<()> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send_request(&mut self, request: &Message) -> MxResult<Message> {
        self.log.push(request);
        Ok(handle_request(&self.target, self.version, request))
    }

    fn disconnect(&mut self) -> MxResult<()> {
        self.connected = false;
        Ok(())
    }

    fn peer(&self) -> String {
        format!("loopback ({} records)", self.target.len())
    }
}

/// Answer one request against `list`. Failures become error replies.
pub fn handle_request(list: &RecordList, version: ServerVersion, request: &Message) -> Message {
    match serve(list, version, request) {
        Ok(reply) => reply,
        Err(err) => request.error_reply(&err),
    }
}

/// Record and field name of a `record.field` address.
fn target<'a>(list: &RecordList, address: &'a str) -> MxResult<(Arc<Record>, &'a str)> {
    let (record_name, field_name) = address.split_once('.').ok_or_else(|| {
        MxError::illegal_argument(
            "serve_request",
            format!("'{}' is not a record.field name", address),
        )
    })?;
    Ok((list.find(record_name)?, field_name))
}

fn require_datatype(request: &Message, field_type: FieldType) -> MxResult<FieldType> {
    let datatype = request.datatype.ok_or_else(|| {
        MxError::illegal_argument("serve_request", "request does not name a datatype")
    })?;
    if datatype != field_type {
        return Err(MxError::type_mismatch(
            "serve_request",
            format!(
                "'{}' is {}, request is for {}",
                request.address, field_type, datatype
            ),
        ));
    }
    Ok(datatype)
}

fn serve(list: &RecordList, version: ServerVersion, request: &Message) -> MxResult<Message> {
    match request.operation {
        Operation::GetServerVersion => Ok(request.reply().with_payload(version.encode())),
        Operation::GetFieldType => {
            let (record, field_name) = target(list, &request.address)?;
            let field = record.locate_field(field_name)?;
            Ok(request
                .reply()
                .with_datatype(field.resolved().datatype())
                .with_dims(field.dims().to_vec()))
        }
        Operation::GetArray => {
            let (record, field_name) = target(list, &request.address)?;
            let field = record.locate_field(field_name)?;
            let field_type = require_datatype(request, field.resolved().datatype())?;
            let mut value = field.get()?;
            if !value.is_scalar() {
                if request.dims.len() != value.dims().len() {
                    return Err(MxError::illegal_argument(
                        "serve_request",
                        format!(
                            "'{}' has {} dimensions, {} requested",
                            request.address,
                            value.dims().len(),
                            request.dims.len()
                        ),
                    ));
                }
                value = value.truncated(&request.dims)?;
            }
            let mut payload = BytesMut::new();
            encode_elements(request.wire_format, value.elements(), &mut payload);
            Ok(request
                .reply()
                .with_datatype(field_type)
                .with_dims(value.dims().to_vec())
                .with_payload(payload.freeze()))
        }
        Operation::PutArray => {
            let (record, field_name) = target(list, &request.address)?;
            let field = record.locate_field(field_name)?;
            let datatype = require_datatype(request, field.resolved().datatype())?;
            let mut payload = request.payload.clone();
            let elements = decode_elements(
                request.wire_format,
                datatype.element_kind(),
                element_count(&request.dims),
                &mut payload,
            )?;
            field.put(FieldValue::new(datatype, request.dims.clone(), elements)?)?;
            Ok(request.reply())
        }
    }
}
