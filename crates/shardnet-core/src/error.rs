use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// `CoreError` is the one error currency every shardnet-* crate returns across its public API.
///
/// # Why
/// Buffer, stream, wire and net errors all eventually surface to the same places — a
/// connection's `error` event, a write completion, a `Result` returned to the caller of
/// `ConnectionManager`. Giving them one shape means a caller can match on
/// [`ErrorCategory`] once instead of downcasting four different error enums.
///
/// # What
/// - `code`: a stable `"<area>.<reason>"` string, see [`codes`].
/// - `message`: a human-readable description, never containing secrets.
/// - `cause`: an optional underlying error (an OS error, a downstream `CoreError`,...).
/// - `category`: drives automatic policy — retry, back off, close the connection.
///
/// Programmer faults are **not** represented here — they panic. `CoreError` only ever carries the
/// four recoverable categories: resource, protocol, I/O and lifecycle faults.
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
    category: ErrorCategory,
}

impl CoreError {
    pub fn new(code: &'static str, category: ErrorCategory, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category,
        }
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Shorthand for the I/O-fault path: wraps `err`, tagging it `Io`.
    pub fn io(code: &'static str, err: std::io::Error) -> Self {
        Self::new(code, ErrorCategory::Io, err.to_string()).with_cause(err)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.code, self.category, self.message)
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn StdError + 'static))
    }
}

/// Error taxonomy grouped by the layer that can recover from it. Programmer faults
/// are deliberately absent: they abort rather than produce a value of this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Pool exhausted, direct memory allocation failed. Not fatal to the manager; the
    /// reactor de-arms reads on the affected connection until pressure subsides.
    Resource,
    /// Bad magic/version, checksum mismatch, oversize payload. Closes the connection.
    Protocol,
    /// OS error or remote reset. Implies an asynchronous close of the connection.
    Io,
    /// Use-after-shutdown, double close. Idempotent where the operation allows it.
    Lifecycle,
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Stable error codes, grouped by the component that raises them.
///
/// Codes follow `<crate-area>.<reason>` so that logs and metrics can aggregate on the
/// prefix without parsing the message.
pub mod codes {
    pub const POOL_ALLOC_FAILED: &str = "buffer.alloc_failed";
    pub const POOL_CLOSED: &str = "buffer.pool_closed";

    pub const STREAM_CLOSED: &str = "stream.closed";
    pub const STREAM_BOUNDARY: &str = "stream.boundary_fault";

    pub const WIRE_BAD_MAGIC: &str = "wire.bad_magic";
    pub const WIRE_BAD_VERSION: &str = "wire.bad_version";
    pub const WIRE_CHECKSUM_MISMATCH: &str = "wire.checksum_mismatch";
    pub const WIRE_OVERSIZE_PAYLOAD: &str = "wire.oversize_payload";
    pub const WIRE_UNKNOWN_NV_TAG: &str = "wire.unknown_nv_tag";

    pub const NET_CONNECT: &str = "net.connect";
    pub const NET_ACCEPT: &str = "net.accept";
    pub const NET_READ: &str = "net.read";
    pub const NET_WRITE: &str = "net.write";
    pub const NET_CONNECTION_CLOSED: &str = "net.connection_closed";
    pub const NET_MANAGER_SHUTDOWN: &str = "net.manager_shutdown";
    pub const NET_DOUBLE_CLOSE: &str = "net.double_close";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_category() {
        let err = CoreError::new(codes::WIRE_BAD_MAGIC, ErrorCategory::Protocol, "bad magic");
        let rendered = err.to_string();
        assert!(rendered.contains("wire.bad_magic"));
        assert!(rendered.contains("Protocol"));
    }

    #[test]
    fn io_helper_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = CoreError::io(codes::NET_READ, io_err);
        assert_eq!(err.category(), ErrorCategory::Io);
        assert!(err.source().is_some());
    }
}
