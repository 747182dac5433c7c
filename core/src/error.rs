use std::fmt;

/// All error types produced by this crate (spec §7).
///
/// One enum for every failure the wire protocol distinguishes, rather than
/// a single opaque error type: callers (and the client's `dispatch_log_or_error`)
/// need to tell a malformed request apart from a handler exception apart from
/// a broken transport.
#[derive(Debug)]
pub enum RpcError {
    /// Request malformed, missing metadata, batch-count mismatch, truncated
    /// or tampered state token, unknown method.
    Protocol(String),

    /// `request_version` absent or not equal to `"1"`.
    Version(String),

    /// A handler's result is missing a required field, or has the wrong
    /// shape for the declared schema.
    Contract(String),

    /// An exception raised by user-supplied handler/init/header_init/
    /// produce/exchange code. Carries the triple that travels in
    /// `log_extra` on the wire: `exception_type`, `exception_message`,
    /// `traceback`.
    Handler {
        kind: String,
        message: String,
        traceback: Option<String>,
    },

    /// Broken pipe or other I/O fault; unrecoverable for the current session.
    Transport(std::io::Error),
}

impl RpcError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        RpcError::Protocol(msg.into())
    }

    pub fn version(msg: impl Into<String>) -> Self {
        RpcError::Version(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        RpcError::Contract(msg.into())
    }

    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Handler {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn handler_with_traceback(
        kind: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        RpcError::Handler {
            kind: kind.into(),
            message: message.into(),
            traceback: Some(traceback.into()),
        }
    }

    /// The `"<ErrorKind>: <message>"` string spec §4.1 wants in `log_message`.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Protocol(m) => format!("ProtocolError: {m}"),
            RpcError::Version(m) => format!("VersionError: {m}"),
            RpcError::Contract(m) => format!("ContractError: {m}"),
            RpcError::Handler { kind, message, .. } => format!("{kind}: {message}"),
            RpcError::Transport(e) => format!("TransportError: {e}"),
        }
    }

    /// The `{exception_type, exception_message, traceback}` object spec
    /// §4.1 wants in `log_extra`.
    pub fn wire_extra(&self) -> serde_json::Value {
        let (exception_type, exception_message, traceback) = match self {
            RpcError::Protocol(m) => ("ProtocolError".to_string(), m.clone(), None),
            RpcError::Version(m) => ("VersionError".to_string(), m.clone(), None),
            RpcError::Contract(m) => ("ContractError".to_string(), m.clone(), None),
            RpcError::Handler {
                kind,
                message,
                traceback,
            } => (kind.clone(), message.clone(), traceback.clone()),
            RpcError::Transport(e) => ("TransportError".to_string(), e.to_string(), None),
        };
        serde_json::json!({
            "exception_type": exception_type,
            "exception_message": exception_message,
            "traceback": traceback,
        })
    }

    /// Whether this error should never be retried / should abort the
    /// current pipe server loop (spec §7: "a TransportError terminates the
    /// loop").
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }

    /// The HTTP status this error class maps to (spec §4.6, §7).
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            RpcError::Protocol(_) | RpcError::Version(_) | RpcError::Contract(_) => {
                http::StatusCode::BAD_REQUEST
            }
            RpcError::Handler { .. } => http::StatusCode::INTERNAL_SERVER_ERROR,
            RpcError::Transport(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_message())
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err)
    }
}

impl From<arrow_schema::ArrowError> for RpcError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        RpcError::Protocol(format!("arrow IPC error: {err}"))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_formats_kind_and_message() {
        let err = RpcError::protocol("missing method metadata");
        assert_eq!(err.wire_message(), "ProtocolError: missing method metadata");
    }

    #[test]
    fn handler_error_uses_its_own_kind() {
        let err = RpcError::handler("ValueError", "bad factor");
        assert_eq!(err.wire_message(), "ValueError: bad factor");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            RpcError::protocol("x").http_status(),
            http::StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RpcError::handler("X", "y").http_status(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn wire_extra_carries_traceback_when_present() {
        let err = RpcError::handler_with_traceback("RuntimeError", "boom", "at line 1");
        let extra = err.wire_extra();
        assert_eq!(extra["exception_type"], "RuntimeError");
        assert_eq!(extra["traceback"], "at line 1");
    }
}
