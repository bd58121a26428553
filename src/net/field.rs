//! Client-side handle on a remote `record.field`.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use super::message::Operation;
use super::server::NetworkServer;
use super::wire::{decode_elements, encode_elements, requested_dimensions};
use crate::error::{MxError, MxResult};
use crate::field::{element_count, FieldType, FieldValue};

/// Type and dimensions of a remote field as reported by its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShape {
    /// Element type.
    pub datatype: FieldType,
    /// Dimensions; empty for a scalar.
    pub dims: Vec<usize>,
}

/// A remote field bound to a server connection.
///
/// Creating one performs no I/O. The remote shape is fetched on first use and
/// cached; every get and put is checked against it, so a request of the
/// wrong type fails with `TypeMismatch` before it is sent.
pub struct NetworkField {
    server: Arc<NetworkServer>,
    record_name: String,
    field_name: String,
    address: String,
    shape: Option<RemoteShape>,
    mirror: Option<FieldValue>,
}

impl std::fmt::Debug for NetworkField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkField")
            .field("server", &self.server.name())
            .field("address", &self.address)
            .field("shape", &self.shape)
            .finish()
    }
}

impl NetworkField {
    /// Handle on `record_name.field_name` at `server`.
    pub fn new(
        server: Arc<NetworkServer>,
        record_name: impl Into<String>,
        field_name: impl Into<String>,
    ) -> Self {
        let record_name = record_name.into();
        let field_name = field_name.into();
        let address = format!("{}.{}", record_name, field_name);
        Self {
            server,
            record_name,
            field_name,
            address,
            shape: None,
            mirror: None,
        }
    }

    /// Connection the field is read through.
    pub fn server(&self) -> &Arc<NetworkServer> {
        &self.server
    }

    /// Remote record name.
    pub fn record_name(&self) -> &str {
        &self.record_name
    }

    /// Remote field name.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Remote `record.field` name.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Shape fetched by the last `connect`, if any.
    pub fn cached_shape(&self) -> Option<&RemoteShape> {
        self.shape.as_ref()
    }

    /// Last value read from or written to the remote field.
    pub fn mirror(&self) -> Option<&FieldValue> {
        self.mirror.as_ref()
    }

    /// Forget the cached shape, so the next call asks the server again.
    pub fn invalidate(&mut self) {
        self.shape = None;
    }

    /// Fetch and cache the remote shape if not already known.
    pub fn connect(&mut self) -> MxResult<&RemoteShape> {
        if self.shape.is_none() {
            let reply = self.server.request(
                Operation::GetFieldType,
                &self.address,
                None,
                Vec::new(),
                Bytes::new(),
            )?;
            let datatype = reply.datatype.ok_or_else(|| {
                MxError::new(
                    crate::error::ErrorKind::NetworkIoError,
                    "network_field_connect",
                    format!("server gave no datatype for '{}'", self.address),
                )
            })?;
            self.shape = Some(RemoteShape {
                datatype,
                dims: reply.dims,
            });
        }
        self.shape.as_ref().ok_or_else(|| {
            MxError::corrupt("network_field_connect", "remote shape missing after connect")
        })
    }

    fn check_type(&mut self, operation: &'static str, datatype: FieldType) -> MxResult<RemoteShape> {
        let address = self.address.clone();
        let shape = self.connect()?;
        if shape.datatype != datatype {
            return Err(MxError::type_mismatch(
                operation,
                format!(
                    "remote field '{}' is {}, request is for {}",
                    address, shape.datatype, datatype
                ),
            ));
        }
        Ok(shape.clone())
    }

    /// Read the remote value using the cached dimensions.
    pub fn get(&mut self, datatype: FieldType) -> MxResult<FieldValue> {
        self.get_array(datatype, None)
    }

    /// Read the remote value. `dims` overrides the cached dimensions, for
    /// arrays whose useful length is known only at call time.
    pub fn get_array(&mut self, datatype: FieldType, dims: Option<&[usize]>) -> MxResult<FieldValue> {
        const OP: &str = "network_field_get";
        let shape = self.check_type(OP, datatype)?;
        let wanted = dims.map_or_else(|| shape.dims.clone(), <[usize]>::to_vec);
        if wanted.len() != shape.dims.len() {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "'{}' has {} dimensions, {} given",
                    self.address,
                    shape.dims.len(),
                    wanted.len()
                ),
            ));
        }
        let format = self.server.wire_format();
        let request_dims = requested_dimensions(format, &shape.dims, &wanted);

        let reply = self.server.request(
            Operation::GetArray,
            &self.address,
            Some(datatype),
            request_dims,
            Bytes::new(),
        )?;
        let mut payload = reply.payload.clone();
        let elements = decode_elements(
            format,
            datatype.element_kind(),
            element_count(&reply.dims),
            &mut payload,
        )?;
        let mut value = FieldValue::new(datatype, reply.dims, elements)?;
        if value.dims() != wanted.as_slice() {
            value = value.truncated(&wanted)?;
        }
        self.mirror = Some(value.clone());
        Ok(value)
    }

    /// Write a scalar or array value. Its type must match the remote field.
    pub fn put(&mut self, value: FieldValue) -> MxResult<()> {
        const OP: &str = "network_field_put";
        let shape = self.check_type(OP, value.datatype())?;
        if value.dims().len() != shape.dims.len() {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "'{}' has {} dimensions, value has {}",
                    self.address,
                    shape.dims.len(),
                    value.dims().len()
                ),
            ));
        }
        let mut payload = BytesMut::new();
        encode_elements(self.server.wire_format(), value.elements(), &mut payload);
        self.server.request(
            Operation::PutArray,
            &self.address,
            Some(value.datatype()),
            value.dims().to_vec(),
            payload.freeze(),
        )?;
        self.mirror = Some(value);
        Ok(())
    }

    /// Read a scalar `double`.
    pub fn get_f64(&mut self) -> MxResult<f64> {
        self.get(FieldType::Double)?.as_f64()
    }

    /// Write a scalar `double`.
    pub fn put_f64(&mut self, value: f64) -> MxResult<()> {
        self.put(FieldValue::double(value))
    }

    /// Read a scalar `bool`.
    pub fn get_bool(&mut self) -> MxResult<bool> {
        self.get(FieldType::Bool)?.as_bool()
    }

    /// Write a scalar `bool`.
    pub fn put_bool(&mut self, value: bool) -> MxResult<()> {
        self.put(FieldValue::bool(value))
    }

    /// Read a scalar `string`.
    pub fn get_string(&mut self) -> MxResult<String> {
        Ok(self.get(FieldType::String)?.as_str()?.to_string())
    }

    /// Read with whatever type the remote field has.
    pub fn get_any(&mut self) -> MxResult<FieldValue> {
        let datatype = self.connect()?.datatype;
        self.get(datatype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::net::loopback::LoopbackTransport;
    use crate::net::wire::WireFormat;
    use crate::record::RecordList;
    use std::time::Duration;

    fn served_motor() -> (Arc<NetworkServer>, crate::net::RequestLog) {
        let remote = RecordList::new();
        remote
            .create_record("m1", "soft_motor", &toml::Table::new())
            .unwrap();
        remote.finish_initialization().unwrap();
        remote.open_all().unwrap();
        let transport = LoopbackTransport::new(Arc::new(remote));
        let log = transport.request_log();
        let server = NetworkServer::new(
            "srv",
            Box::new(transport),
            WireFormat::Xdr,
            Duration::from_secs(1),
        );
        (Arc::new(server), log)
    }

    #[test]
    fn binding_performs_no_io() {
        let (server, log) = served_motor();
        let field = NetworkField::new(server, "m1", "position");
        assert_eq!(field.address(), "m1.position");
        assert!(log.is_empty());
    }

    #[test]
    fn put_of_the_wrong_type_is_rejected_locally() {
        let (server, log) = served_motor();
        let mut field = NetworkField::new(server, "m1", "scale");
        field.connect().unwrap();
        let sent = log.len();

        let err = field.put(FieldValue::long(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert_eq!(log.len(), sent);
    }

    #[test]
    fn scalar_round_trip_updates_the_mirror() {
        let (server, _log) = served_motor();
        let mut field = NetworkField::new(server, "m1", "speed");
        field.put_f64(2.5).unwrap();
        assert_eq!(field.get_f64().unwrap(), 2.5);
        assert_eq!(field.mirror(), Some(&FieldValue::double(2.5)));
    }
}
