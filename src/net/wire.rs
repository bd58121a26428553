//! Element encodings used in message payloads.
//!
//! Two formats are supported:
//!
//! - [`WireFormat::Raw`]: little-endian, packed at each element's natural
//!   width. Strings are a `u32` length followed by the bytes.
//! - [`WireFormat::Xdr`]: big-endian, every element occupies a whole number
//!   of 4-byte units (chars, shorts and bools are widened to 4 bytes; longs
//!   and doubles take 8). Strings are a length followed by the bytes padded
//!   to 4.
//!
//! XDR must be consumed symmetrically, so a client reading an XDR array
//! requests the full remote length and truncates locally; see
//! [`requested_dimensions`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, MxError, MxResult};
use crate::field::{ElementKind, Elements};

/// Encoding of element payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Big-endian, 4-byte aligned.
    #[default]
    Xdr,
    /// Little-endian, packed.
    Raw,
}

impl WireFormat {
    /// Wire code carried in message headers.
    pub fn code(&self) -> u32 {
        match self {
            WireFormat::Raw => 1,
            WireFormat::Xdr => 2,
        }
    }

    /// Inverse of [`WireFormat::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(WireFormat::Raw),
            2 => Some(WireFormat::Xdr),
            _ => None,
        }
    }

    /// Lowercase name used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            WireFormat::Raw => "raw",
            WireFormat::Xdr => "xdr",
        }
    }

    /// Whether a reader must consume every element the sender wrote.
    pub fn requires_full_buffer(&self) -> bool {
        matches!(self, WireFormat::Xdr)
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for WireFormat {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(WireFormat::Raw),
            "xdr" => Ok(WireFormat::Xdr),
            other => Err(MxError::illegal_argument(
                "wire_format",
                format!("unknown wire format '{}'", other),
            )),
        }
    }
}

/// Dimensions to ask the server for when the caller wants `wanted` out of a
/// remote field currently shaped `remote`.
///
/// For XDR the request covers the whole remote buffer (or the wanted size if
/// that is larger along some axis); for raw the wanted subset is requested
/// as is.
pub fn requested_dimensions(format: WireFormat, remote: &[usize], wanted: &[usize]) -> Vec<usize> {
    if !format.requires_full_buffer() || remote.len() != wanted.len() {
        return wanted.to_vec();
    }
    remote
        .iter()
        .zip(wanted)
        .map(|(r, w)| (*r).max(*w))
        .collect()
}

fn truncated(operation: &'static str, needed: usize, available: usize) -> MxError {
    MxError::new(
        ErrorKind::NetworkIoError,
        operation,
        format!(
            "payload too short: {} bytes needed, {} available",
            needed, available
        ),
    )
}

fn ensure(buf: &Bytes, needed: usize) -> MxResult<()> {
    if buf.remaining() < needed {
        return Err(truncated("wire_decode", needed, buf.remaining()));
    }
    Ok(())
}

fn xdr_padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Append `elements` to `out` in `format`.
pub fn encode_elements(format: WireFormat, elements: &Elements, out: &mut BytesMut) {
    match format {
        WireFormat::Raw => encode_raw(elements, out),
        WireFormat::Xdr => encode_xdr(elements, out),
    }
}

fn encode_raw(elements: &Elements, out: &mut BytesMut) {
    match elements {
        Elements::Char(v) => v.iter().for_each(|x| out.put_i8(*x)),
        Elements::UChar(v) => out.put_slice(v),
        Elements::Short(v) => v.iter().for_each(|x| out.put_i16_le(*x)),
        Elements::UShort(v) => v.iter().for_each(|x| out.put_u16_le(*x)),
        Elements::Int(v) => v.iter().for_each(|x| out.put_i32_le(*x)),
        Elements::UInt(v) => v.iter().for_each(|x| out.put_u32_le(*x)),
        Elements::Long(v) => v.iter().for_each(|x| out.put_i64_le(*x)),
        Elements::ULong(v) => v.iter().for_each(|x| out.put_u64_le(*x)),
        Elements::Float(v) => v.iter().for_each(|x| out.put_f32_le(*x)),
        Elements::Double(v) => v.iter().for_each(|x| out.put_f64_le(*x)),
        Elements::Bool(v) => v.iter().for_each(|x| out.put_u8(u8::from(*x))),
        Elements::String(v) => {
            for s in v {
                out.put_u32_le(s.len() as u32);
                out.put_slice(s.as_bytes());
            }
        }
    }
}

fn encode_xdr(elements: &Elements, out: &mut BytesMut) {
    match elements {
        Elements::Char(v) => v.iter().for_each(|x| out.put_i32(i32::from(*x))),
        Elements::UChar(v) => v.iter().for_each(|x| out.put_u32(u32::from(*x))),
        Elements::Short(v) => v.iter().for_each(|x| out.put_i32(i32::from(*x))),
        Elements::UShort(v) => v.iter().for_each(|x| out.put_u32(u32::from(*x))),
        Elements::Int(v) => v.iter().for_each(|x| out.put_i32(*x)),
        Elements::UInt(v) => v.iter().for_each(|x| out.put_u32(*x)),
        Elements::Long(v) => v.iter().for_each(|x| out.put_i64(*x)),
        Elements::ULong(v) => v.iter().for_each(|x| out.put_u64(*x)),
        Elements::Float(v) => v.iter().for_each(|x| out.put_f32(*x)),
        Elements::Double(v) => v.iter().for_each(|x| out.put_f64(*x)),
        Elements::Bool(v) => v.iter().for_each(|x| out.put_u32(u32::from(*x))),
        Elements::String(v) => {
            for s in v {
                out.put_u32(s.len() as u32);
                out.put_slice(s.as_bytes());
                out.put_bytes(0, xdr_padding(s.len()));
            }
        }
    }
}

/// Decode `count` elements of `kind`. Trailing bytes are left in `buf`.
pub fn decode_elements(
    format: WireFormat,
    kind: ElementKind,
    count: usize,
    buf: &mut Bytes,
) -> MxResult<Elements> {
    match format {
        WireFormat::Raw => decode_raw(kind, count, buf),
        WireFormat::Xdr => decode_xdr(kind, count, buf),
    }
}

macro_rules! read_n {
    ($buf:expr, $count:expr, $width:expr, $read:expr) => {{
        ensure($buf, $count * $width)?;
        (0..$count).map(|_| $read(&mut *$buf)).collect::<Vec<_>>()
    }};
}

fn decode_string(buf: &mut Bytes, len: usize, padding: usize) -> MxResult<String> {
    ensure(buf, len + padding)?;
    let bytes = buf.split_to(len);
    buf.advance(padding);
    String::from_utf8(bytes.to_vec()).map_err(|e| {
        MxError::new(
            ErrorKind::UnparseableString,
            "wire_decode",
            format!("string element is not UTF-8: {}", e),
        )
    })
}

fn decode_raw(kind: ElementKind, count: usize, buf: &mut Bytes) -> MxResult<Elements> {
    let elements = match kind {
        ElementKind::Char => Elements::Char(read_n!(buf, count, 1, |b: &mut Bytes| b.get_i8())),
        ElementKind::UChar => Elements::UChar(read_n!(buf, count, 1, |b: &mut Bytes| b.get_u8())),
        ElementKind::Short => {
            Elements::Short(read_n!(buf, count, 2, |b: &mut Bytes| b.get_i16_le()))
        }
        ElementKind::UShort => {
            Elements::UShort(read_n!(buf, count, 2, |b: &mut Bytes| b.get_u16_le()))
        }
        ElementKind::Int => Elements::Int(read_n!(buf, count, 4, |b: &mut Bytes| b.get_i32_le())),
        ElementKind::UInt => {
            Elements::UInt(read_n!(buf, count, 4, |b: &mut Bytes| b.get_u32_le()))
        }
        ElementKind::Long => {
            Elements::Long(read_n!(buf, count, 8, |b: &mut Bytes| b.get_i64_le()))
        }
        ElementKind::ULong => {
            Elements::ULong(read_n!(buf, count, 8, |b: &mut Bytes| b.get_u64_le()))
        }
        ElementKind::Float => {
            Elements::Float(read_n!(buf, count, 4, |b: &mut Bytes| b.get_f32_le()))
        }
        ElementKind::Double => {
            Elements::Double(read_n!(buf, count, 8, |b: &mut Bytes| b.get_f64_le()))
        }
        ElementKind::Bool => {
            Elements::Bool(read_n!(buf, count, 1, |b: &mut Bytes| b.get_u8() != 0))
        }
        ElementKind::String => {
            let mut strings = Vec::with_capacity(count);
            for _ in 0..count {
                ensure(buf, 4)?;
                let len = buf.get_u32_le() as usize;
                strings.push(decode_string(buf, len, 0)?);
            }
            Elements::String(strings)
        }
    };
    Ok(elements)
}

fn narrow_xdr<T: TryFrom<i64>>(value: i64) -> MxResult<T> {
    T::try_from(value).map_err(|_| {
        MxError::new(
            ErrorKind::NetworkIoError,
            "wire_decode",
            format!("xdr unit {} is out of range for its element type", value),
        )
    })
}

fn decode_xdr(kind: ElementKind, count: usize, buf: &mut Bytes) -> MxResult<Elements> {
    let elements = match kind {
        ElementKind::Char => {
            let units = read_n!(buf, count, 4, |b: &mut Bytes| b.get_i32());
            Elements::Char(
                units
                    .into_iter()
                    .map(|u| narrow_xdr(i64::from(u)))
                    .collect::<MxResult<_>>()?,
            )
        }
        ElementKind::UChar => {
            let units = read_n!(buf, count, 4, |b: &mut Bytes| b.get_u32());
            Elements::UChar(
                units
                    .into_iter()
                    .map(|u| narrow_xdr(i64::from(u)))
                    .collect::<MxResult<_>>()?,
            )
        }
        ElementKind::Short => {
            let units = read_n!(buf, count, 4, |b: &mut Bytes| b.get_i32());
            Elements::Short(
                units
                    .into_iter()
                    .map(|u| narrow_xdr(i64::from(u)))
                    .collect::<MxResult<_>>()?,
            )
        }
        ElementKind::UShort => {
            let units = read_n!(buf, count, 4, |b: &mut Bytes| b.get_u32());
            Elements::UShort(
                units
                    .into_iter()
                    .map(|u| narrow_xdr(i64::from(u)))
                    .collect::<MxResult<_>>()?,
            )
        }
        ElementKind::Int => Elements::Int(read_n!(buf, count, 4, |b: &mut Bytes| b.get_i32())),
        ElementKind::UInt => Elements::UInt(read_n!(buf, count, 4, |b: &mut Bytes| b.get_u32())),
        ElementKind::Long => Elements::Long(read_n!(buf, count, 8, |b: &mut Bytes| b.get_i64())),
        ElementKind::ULong => {
            Elements::ULong(read_n!(buf, count, 8, |b: &mut Bytes| b.get_u64()))
        }
        ElementKind::Float => {
            Elements::Float(read_n!(buf, count, 4, |b: &mut Bytes| b.get_f32()))
        }
        ElementKind::Double => {
            Elements::Double(read_n!(buf, count, 8, |b: &mut Bytes| b.get_f64()))
        }
        ElementKind::Bool => {
            Elements::Bool(read_n!(buf, count, 4, |b: &mut Bytes| b.get_u32() != 0))
        }
        ElementKind::String => {
            let mut strings = Vec::with_capacity(count);
            for _ in 0..count {
                ensure(buf, 4)?;
                let len = buf.get_u32() as usize;
                strings.push(decode_string(buf, len, xdr_padding(len))?);
            }
            Elements::String(strings)
        }
    };
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdr_widens_small_elements_to_four_bytes() {
        let mut out = BytesMut::new();
        encode_elements(WireFormat::Xdr, &Elements::Short(vec![-2, 7]), &mut out);
        assert_eq!(&out[..], &[0xff, 0xff, 0xff, 0xfe, 0, 0, 0, 7]);

        let mut raw = BytesMut::new();
        encode_elements(WireFormat::Raw, &Elements::Short(vec![-2, 7]), &mut raw);
        assert_eq!(&raw[..], &[0xfe, 0xff, 7, 0]);
    }

    #[test]
    fn xdr_strings_are_padded() {
        let mut out = BytesMut::new();
        let strings = Elements::String(vec!["abcde".into(), "xy".into()]);
        encode_elements(WireFormat::Xdr, &strings, &mut out);
        assert_eq!(out.len(), 4 + 8 + 4 + 4);

        let mut bytes = out.freeze();
        let decoded =
            decode_elements(WireFormat::Xdr, ElementKind::String, 2, &mut bytes).unwrap();
        assert_eq!(decoded, strings);
        assert!(bytes.is_empty());
    }

    #[test]
    fn short_payload_is_an_io_error() {
        let mut bytes = Bytes::from_static(&[0, 0, 0]);
        let err = decode_elements(WireFormat::Xdr, ElementKind::UInt, 1, &mut bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkIoError);
    }

    #[test]
    fn xdr_requests_the_full_remote_buffer() {
        assert_eq!(requested_dimensions(WireFormat::Xdr, &[1024], &[100]), vec![1024]);
        assert_eq!(requested_dimensions(WireFormat::Raw, &[1024], &[100]), vec![100]);
        assert_eq!(requested_dimensions(WireFormat::Xdr, &[512], &[600]), vec![600]);
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("XDR".parse::<WireFormat>().unwrap(), WireFormat::Xdr);
        assert_eq!("raw".parse::<WireFormat>().unwrap(), WireFormat::Raw);
        assert!("json".parse::<WireFormat>().is_err());
    }
}
