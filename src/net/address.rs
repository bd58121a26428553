//! Remote field addresses: `[hostname[@port]:]record_name.field_name`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{DEFAULT_HOST, DEFAULT_PORT};
use crate::error::{MxError, MxResult};

/// Parsed `[hostname[@port]:]record_name.field_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldAddress {
    host: Option<String>,
    port: Option<u16>,
    record: String,
    field: String,
}

impl FieldAddress {
    /// Local address `record.field`.
    pub fn new(record: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            host: None,
            port: None,
            record: record.into(),
            field: field.into(),
        }
    }

    /// Same field on a named server; `None` keeps the default port.
    pub fn with_server(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    /// Parse an address. A missing `record.field` separator or an empty part is `IllegalArgument`.
    pub fn parse(text: &str) -> MxResult<Self> {
        const OP: &str = "parse_field_address";
        let text = text.trim();
        let (server, name) = match text.split_once(':') {
            Some((server, name)) => (Some(server), name),
            None => (None, text),
        };

        let (host, port) = match server {
            None => (None, None),
            Some(server) => {
                let (host, port) = match server.split_once('@') {
                    Some((host, port)) => {
                        let port = port.parse::<u16>().map_err(|e| {
                            MxError::illegal_argument(
                                OP,
                                format!("bad port '{}' in '{}': {}", port, text, e),
                            )
                        })?;
                        (host, Some(port))
                    }
                    None => (server, None),
                };
                if host.is_empty() {
                    return Err(MxError::illegal_argument(
                        OP,
                        format!("empty hostname in '{}'", text),
                    ));
                }
                (Some(host.to_string()), port)
            }
        };

        let (record, field) = name.split_once('.').ok_or_else(|| {
            MxError::illegal_argument(
                OP,
                format!("'{}' is not of the form record_name.field_name", text),
            )
        })?;
        if record.is_empty() || field.is_empty() || field.contains('.') {
            return Err(MxError::illegal_argument(
                OP,
                format!("'{}' is not of the form record_name.field_name", text),
            ));
        }

        Ok(Self {
            host,
            port,
            record: record.to_string(),
            field: field.to_string(),
        })
    }

    /// Host name, or the default when none was given.
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    /// Port, or the default when none was given.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// True when the address named a server.
    pub fn has_server(&self) -> bool {
        self.host.is_some()
    }

    /// Record name.
    pub fn record(&self) -> &str {
        &self.record
    }

    /// Field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The `record.field` part sent to a server.
    pub fn remote_name(&self) -> String {
        format!("{}.{}", self.record, self.field)
    }
}

impl FromStr for FieldAddress {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            f.write_str(host)?;
            if let Some(port) = self.port {
                write!(f, "@{}", port)?;
            }
            f.write_str(":")?;
        }
        write!(f, "{}.{}", self.record, self.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn bare_address_uses_defaults() {
        let addr = FieldAddress::parse("mca1.roi_array").unwrap();
        assert_eq!(addr.record(), "mca1");
        assert_eq!(addr.field(), "roi_array");
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), 9727);
        assert!(!addr.has_server());
        assert_eq!(addr.to_string(), "mca1.roi_array");
    }

    #[test]
    fn host_and_port_are_optional_prefixes() {
        let addr = FieldAddress::parse("beamline.example.org@9800:theta.position").unwrap();
        assert_eq!(addr.host(), "beamline.example.org");
        assert_eq!(addr.port(), 9800);
        assert_eq!(addr.remote_name(), "theta.position");
        assert_eq!(addr.to_string(), "beamline.example.org@9800:theta.position");

        let addr = FieldAddress::parse("daq2:det1.status").unwrap();
        assert_eq!(addr.host(), "daq2");
        assert_eq!(addr.port(), 9727);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for text in ["mca1", ":mca1.busy", "host@x:mca1.busy", "mca1.", ".busy", "a.b.c"] {
            let err = FieldAddress::parse(text).unwrap_err();
            assert_eq!(err.kind, ErrorKind::IllegalArgument, "{}", text);
        }
    }
}
