//! Error types shared by every layer of the record system.
//!
//! All fallible operations return [`MxResult`]. An [`MxError`] carries three
//! things: the [`ErrorKind`] (what went wrong), the name of the operation that
//! raised it (e.g. `"mca_set_roi"`), and a human-readable message.
//!
//! ## Error Categories
//!
//! - **Internal consistency** - `NullArgument`, `TypeMismatch`,
//!   `CorruptDataStructure`. These are programming or configuration bugs.
//!   A record that raises `CorruptDataStructure` is quarantined by the record
//!   layer and refuses further class operations.
//! - **Caller errors** - `IllegalArgument`, `NotFound`, `Unsupported`,
//!   `WouldExceedLimit`, `LimitExceeded`, `BadHandle`.
//! - **Transport errors** - `NetworkIoError`, `NetworkConnectionLost`,
//!   `TimedOut`, `UnparseableString`, `ClientRequestDenied`. Connection loss and
//!   timeouts are recoverable: callers may retry or reconnect.
//! - **Device errors** - `NotReady`, `DeviceActionFailed`,
//!   `HardwareConfigurationError`, `OutOfMemory`.

use std::borrow::Cow;
use thiserror::Error;

/// Convenience alias for results carrying an [`MxError`].
pub type MxResult<T> = std::result::Result<T, MxError>;

/// Closed set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Required argument missing.
    NullArgument,
    /// Argument outside the accepted domain.
    IllegalArgument,
    /// Value or record of the wrong type.
    TypeMismatch,
    /// Internal state is inconsistent; the record is quarantined.
    CorruptDataStructure,
    /// Named record, field or server does not exist.
    NotFound,
    /// Operation not implemented by this class or driver.
    Unsupported,
    /// Request would overflow a configured limit.
    WouldExceedLimit,
    /// A limit was already exceeded.
    LimitExceeded,
    /// Allocation failed.
    OutOfMemory,
    /// Socket-level failure.
    NetworkIoError,
    /// Peer closed the connection.
    NetworkConnectionLost,
    /// No answer within the timeout.
    TimedOut,
    /// Device cannot accept the command yet.
    NotReady,
    /// Device reported a failure.
    DeviceActionFailed,
    /// Hardware set up inconsistently with its description.
    HardwareConfigurationError,
    /// Text could not be parsed.
    UnparseableString,
    /// Handle is stale or out of range.
    BadHandle,
    /// Server refused the request.
    ClientRequestDenied,
}

impl ErrorKind {
    const ALL: [ErrorKind; 18] = [
        ErrorKind::NullArgument,
        ErrorKind::IllegalArgument,
        ErrorKind::TypeMismatch,
        ErrorKind::CorruptDataStructure,
        ErrorKind::NotFound,
        ErrorKind::Unsupported,
        ErrorKind::WouldExceedLimit,
        ErrorKind::LimitExceeded,
        ErrorKind::OutOfMemory,
        ErrorKind::NetworkIoError,
        ErrorKind::NetworkConnectionLost,
        ErrorKind::TimedOut,
        ErrorKind::NotReady,
        ErrorKind::DeviceActionFailed,
        ErrorKind::HardwareConfigurationError,
        ErrorKind::UnparseableString,
        ErrorKind::BadHandle,
        ErrorKind::ClientRequestDenied,
    ];

    /// Stable label used in messages and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::NullArgument => "null_argument",
            ErrorKind::IllegalArgument => "illegal_argument",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::CorruptDataStructure => "corrupt_data_structure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::WouldExceedLimit => "would_exceed_limit",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::NetworkIoError => "network_io_error",
            ErrorKind::NetworkConnectionLost => "network_connection_lost",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::DeviceActionFailed => "device_action_failed",
            ErrorKind::HardwareConfigurationError => "hardware_configuration_error",
            ErrorKind::UnparseableString => "unparseable_string",
            ErrorKind::BadHandle => "bad_handle",
            ErrorKind::ClientRequestDenied => "client_request_denied",
        }
    }

    /// Numeric code carried in reply headers. Zero is reserved for success.
    pub fn code(&self) -> u32 {
        Self::ALL
            .iter()
            .position(|k| k == self)
            .map(|i| i as u32 + 1)
            .unwrap_or(u32::MAX)
    }

    /// Inverse of [`ErrorKind::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        let index = code.checked_sub(1)? as usize;
        Self::ALL.get(index).copied()
    }

    /// Internal invariant violations, never transient.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ErrorKind::NullArgument | ErrorKind::TypeMismatch | ErrorKind::CorruptDataStructure
        )
    }

    /// Conditions a caller may reasonably retry after.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkConnectionLost
                | ErrorKind::TimedOut
                | ErrorKind::NetworkIoError
                | ErrorKind::NotReady
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Error raised by record, class, network and handle-table operations.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{operation}: {kind} error: {message}")]
pub struct MxError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Operation that raised the error, e.g. `mca_set_roi`.
    pub operation: Cow<'static, str>,
    /// Human-readable detail.
    pub message: String,
}

impl MxError {
    /// Error of `kind` raised by `operation`.
    pub fn new(
        kind: ErrorKind,
        operation: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Replace the operation name, keeping kind and message.
    ///
    /// Used when a generic helper raised the error on behalf of a named
    /// class operation.
    pub fn in_operation(mut self, operation: impl Into<Cow<'static, str>>) -> Self {
        self.operation = operation.into();
        self
    }

    /// `IllegalArgument` error.
    pub fn illegal_argument(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalArgument, operation, message)
    }

    /// `TypeMismatch` error.
    pub fn type_mismatch(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, operation, message)
    }

    /// `NotFound` error.
    pub fn not_found(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, operation, message)
    }

    /// `Unsupported` error.
    pub fn unsupported(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, operation, message)
    }

    /// `CorruptDataStructure` error. Raising it from a driver quarantines the record.
    pub fn corrupt(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptDataStructure, operation, message)
    }

    /// `WouldExceedLimit` error.
    pub fn would_exceed_limit(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WouldExceedLimit, operation, message)
    }
}

impl From<std::io::Error> for MxError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::TimedOut | Io::WouldBlock => ErrorKind::TimedOut,
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::UnexpectedEof
            | Io::NotConnected => ErrorKind::NetworkConnectionLost,
            _ => ErrorKind::NetworkIoError,
        };
        MxError::new(kind, "io", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_for_every_kind() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(999), None);
    }

    #[test]
    fn io_errors_map_to_distinct_network_kinds() {
        let lost: MxError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert_eq!(lost.kind, ErrorKind::NetworkConnectionLost);

        let timeout: MxError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(timeout.kind, ErrorKind::TimedOut);

        let other: MxError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(other.kind, ErrorKind::NetworkIoError);
    }

    #[test]
    fn display_names_operation_and_kind() {
        let err = MxError::would_exceed_limit("mca_set_roi", "roi 0 upper bound 2000 >= 1000");
        let text = err.to_string();
        assert!(text.starts_with("mca_set_roi:"));
        assert!(text.contains("would_exceed_limit"));
    }

    #[test]
    fn classification_helpers() {
        assert!(ErrorKind::CorruptDataStructure.is_internal());
        assert!(!ErrorKind::CorruptDataStructure.is_recoverable());
        assert!(ErrorKind::TimedOut.is_recoverable());
        assert!(!ErrorKind::IllegalArgument.is_internal());
    }
}
