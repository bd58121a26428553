//! Message framing.
//!
//! Every message is a fixed 32-byte big-endian header followed by a body:
//!
//! ```text
//! header:  magic | header_len | body_len | operation | status
//!          | message_id | datatype | wire_format          (8 x u32)
//! body:    address_len u32 | address bytes
//!          | ndims u32 | dims (ndims x u32)
//!          | payload (rest of body, encoded per wire_format)
//! ```
//!
//! Replies carry the request's operation with the top bit set and echo its
//! message id. A non-zero status is an [`ErrorKind`] code and the payload is
//! the error text.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire::WireFormat;
use crate::error::{ErrorKind, MxError, MxResult};
use crate::field::{element_count, FieldType};

/// First header word of every frame.
pub const MAGIC: u32 = 0x4d58_4e46;
/// Fixed header size in bytes.
pub const HEADER_LENGTH: usize = 32;
/// Largest accepted body.
pub const MAX_BODY_LENGTH: usize = 64 * 1024 * 1024;
const REPLY_FLAG: u32 = 0x8000_0000;

/// Request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    /// Protocol version of the server.
    GetServerVersion = 1,
    /// Type and dimensions of a remote field.
    GetFieldType = 2,
    /// Read a remote field.
    GetArray = 3,
    /// Write a remote field.
    PutArray = 4,
}

impl Operation {
    /// Operation for a header code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Operation::GetServerVersion),
            2 => Some(Operation::GetFieldType),
            3 => Some(Operation::GetArray),
            4 => Some(Operation::PutArray),
            _ => None,
        }
    }

    /// Name used in logs and error operations.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetServerVersion => "get_server_version",
            Operation::GetFieldType => "get_field_type",
            Operation::GetArray => "get_array",
            Operation::PutArray => "put_array",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn framing_error(message: impl Into<String>) -> MxError {
    MxError::new(ErrorKind::NetworkIoError, "decode_message", message)
}

/// One request or reply frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// What is asked for.
    pub operation: Operation,
    /// Set on replies.
    pub reply: bool,
    /// `None` for success.
    pub status: Option<ErrorKind>,
    /// Matches a reply to its request.
    pub message_id: u32,
    /// Element type of the payload, if any.
    pub datatype: Option<FieldType>,
    /// Encoding of the payload.
    pub wire_format: WireFormat,
    /// Remote `record.field` name. Empty for server-level operations.
    pub address: String,
    /// Dimensions of the payload.
    pub dims: Vec<usize>,
    /// Encoded elements, or the error text of an error reply.
    pub payload: Bytes,
}

impl Message {
    /// Request with no datatype, dimensions or payload.
    pub fn request(
        operation: Operation,
        message_id: u32,
        wire_format: WireFormat,
        address: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            reply: false,
            status: None,
            message_id,
            datatype: None,
            wire_format,
            address: address.into(),
            dims: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Set the payload datatype.
    pub fn with_datatype(mut self, datatype: FieldType) -> Self {
        self.datatype = Some(datatype);
        self
    }

    /// Set the payload dimensions.
    pub fn with_dims(mut self, dims: Vec<usize>) -> Self {
        self.dims = dims;
        self
    }

    /// Attach an encoded payload.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Empty success reply to this request.
    pub fn reply(&self) -> Message {
        Message {
            reply: true,
            dims: Vec::new(),
            payload: Bytes::new(),
            ..self.clone()
        }
    }

    /// Reply carrying `err`'s kind as status and its message as payload.
    pub fn error_reply(&self, err: &MxError) -> Message {
        Message {
            status: Some(err.kind),
            payload: Bytes::from(err.message.clone().into_bytes()),
            ..self.reply()
        }
    }

    /// Turn an error reply into the error it carries.
    pub fn into_result(self) -> MxResult<Message> {
        match self.status {
            None => Ok(self),
            Some(kind) => Err(MxError::new(
                kind,
                format!("remote {}", self.operation),
                format!(
                    "{}: {}",
                    self.address,
                    String::from_utf8_lossy(&self.payload)
                ),
            )),
        }
    }

    /// Elements described by `dims`; one for a scalar.
    pub fn element_count(&self) -> usize {
        element_count(&self.dims)
    }

    /// Frame with header, ready to write.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(8 + self.address.len() + 4 * self.dims.len());
        body.put_u32(self.address.len() as u32);
        body.put_slice(self.address.as_bytes());
        body.put_u32(self.dims.len() as u32);
        for dim in &self.dims {
            body.put_u32(*dim as u32);
        }
        body.put_slice(&self.payload);

        let mut operation = self.operation as u32;
        if self.reply {
            operation |= REPLY_FLAG;
        }
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + body.len());
        buf.put_u32(MAGIC);
        buf.put_u32(HEADER_LENGTH as u32);
        buf.put_u32(body.len() as u32);
        buf.put_u32(operation);
        buf.put_u32(self.status.map_or(0, |kind| kind.code()));
        buf.put_u32(self.message_id);
        buf.put_u32(self.datatype.map_or(0, |t| t.code()));
        buf.put_u32(self.wire_format.code());
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Body length announced by a header, after checking the magic number.
    pub fn body_length(header: &[u8]) -> MxResult<usize> {
        if header.len() < HEADER_LENGTH {
            return Err(framing_error(format!(
                "header is {} bytes, {} expected",
                header.len(),
                HEADER_LENGTH
            )));
        }
        let mut buf = &header[..HEADER_LENGTH];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(framing_error(format!("bad magic number {:#010x}", magic)));
        }
        let header_length = buf.get_u32() as usize;
        if header_length != HEADER_LENGTH {
            return Err(framing_error(format!(
                "unsupported header length {}",
                header_length
            )));
        }
        let body_length = buf.get_u32() as usize;
        if body_length > MAX_BODY_LENGTH {
            return Err(framing_error(format!(
                "body of {} bytes exceeds the {} byte limit",
                body_length, MAX_BODY_LENGTH
            )));
        }
        Ok(body_length)
    }

    /// Decode one complete frame (header plus body).
    pub fn decode(frame: &[u8]) -> MxResult<Message> {
        let body_length = Self::body_length(frame)?;
        if frame.len() != HEADER_LENGTH + body_length {
            return Err(framing_error(format!(
                "frame is {} bytes, header announces {}",
                frame.len(),
                HEADER_LENGTH + body_length
            )));
        }
        let mut header = &frame[12..HEADER_LENGTH];
        let raw_operation = header.get_u32();
        let status = header.get_u32();
        let message_id = header.get_u32();
        let datatype = header.get_u32();
        let wire_format = header.get_u32();

        let operation = Operation::from_u32(raw_operation & !REPLY_FLAG)
            .ok_or_else(|| framing_error(format!("unknown operation {}", raw_operation)))?;
        let status = match status {
            0 => None,
            code => Some(ErrorKind::from_code(code).unwrap_or(ErrorKind::NetworkIoError)),
        };
        let datatype = match datatype {
            0 => None,
            code => Some(
                FieldType::from_code(code)
                    .ok_or_else(|| framing_error(format!("unknown datatype code {}", code)))?,
            ),
        };
        let wire_format = WireFormat::from_code(wire_format)
            .ok_or_else(|| framing_error(format!("unknown wire format code {}", wire_format)))?;

        let mut body = Bytes::copy_from_slice(&frame[HEADER_LENGTH..]);
        let address_len = take_u32(&mut body)? as usize;
        if body.remaining() < address_len {
            return Err(framing_error("address runs past the end of the body"));
        }
        let address = String::from_utf8(body.split_to(address_len).to_vec())
            .map_err(|e| framing_error(format!("address is not UTF-8: {}", e)))?;
        let ndims = take_u32(&mut body)? as usize;
        if body.remaining() < ndims * 4 {
            return Err(framing_error("dimension list runs past the end of the body"));
        }
        let dims = (0..ndims).map(|_| body.get_u32() as usize).collect();

        Ok(Message {
            operation,
            reply: raw_operation & REPLY_FLAG != 0,
            status,
            message_id,
            datatype,
            wire_format,
            address,
            dims,
            payload: body,
        })
    }
}

fn take_u32(body: &mut Bytes) -> MxResult<u32> {
    if body.remaining() < 4 {
        return Err(framing_error("body ends inside a length field"));
    }
    Ok(body.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let msg = Message::request(Operation::GetArray, 7, WireFormat::Xdr, "mca1.channel_array")
            .with_datatype(FieldType::UInt)
            .with_dims(vec![1024]);
        let frame = msg.encode();
        assert_eq!(&frame[0..4], &MAGIC.to_be_bytes());
        assert_eq!(Message::body_length(&frame).unwrap(), frame.len() - HEADER_LENGTH);

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, msg);
        assert!(!decoded.reply);
    }

    #[test]
    fn error_reply_becomes_the_same_error_kind() {
        let request = Message::request(Operation::PutArray, 3, WireFormat::Raw, "m1.position");
        let err = MxError::type_mismatch("field_put", "field 'm1.position' is double");
        let reply = Message::decode(&request.error_reply(&err).encode()).unwrap();
        assert!(reply.reply);
        assert_eq!(reply.message_id, 3);

        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert!(err.message.contains("is double"));
    }

    #[test]
    fn bad_magic_and_short_frames_are_io_errors() {
        let mut frame = Message::request(Operation::GetServerVersion, 1, WireFormat::Xdr, "")
            .encode()
            .to_vec();
        frame[0] = 0;
        assert_eq!(
            Message::decode(&frame).unwrap_err().kind,
            ErrorKind::NetworkIoError
        );
        assert_eq!(
            Message::body_length(&frame[..10]).unwrap_err().kind,
            ErrorKind::NetworkIoError
        );
    }
}
