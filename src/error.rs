//! Error taxonomy of the session layer.
//!
//! Engine failures arrive as an owned [`Diagnostic`](crate::engine::Diagnostic) and are turned
//! into one of these variants at the call site; the diagnostic text is kept verbatim.

use thiserror::Error;

use crate::engine::{Diagnostic, DiagnosticKind};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Allocation/connect/disconnect failures (including authentication).
    #[error("connection error ({op}): {message}")]
    Connection { op: &'static str, message: String },

    /// Operation rejected because of session/image state (locally or by the engine).
    #[error("protocol error ({op}): {message}")]
    Protocol { op: &'static str, message: String },

    /// Byte range outside the declared image size.
    #[error("range error: {len} byte(s) at offset {offset} exceed size {size} of image '{image}'")]
    Range {
        image: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("image '{name}' not found: {message}")]
    NotFound { name: String, message: String },

    #[error("image '{0}' is already closed")]
    AlreadyClosed(String),

    /// Local byte-stream I/O in the transfer helpers.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn connection(op: &'static str, diag: Diagnostic) -> Self {
        SessionError::Connection {
            op,
            message: diag.into_message(),
        }
    }

    pub(crate) fn protocol(op: &'static str, diag: Diagnostic) -> Self {
        SessionError::Protocol {
            op,
            message: diag.into_message(),
        }
    }

    pub(crate) fn state(op: &'static str, message: impl Into<String>) -> Self {
        SessionError::Protocol {
            op,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SessionError::InvalidArgument(message.into())
    }

    /// Map an engine diagnostic for an image lookup: not-found diagnostics keep their own kind.
    pub(crate) fn lookup(op: &'static str, name: &str, diag: Diagnostic) -> Self {
        match diag.kind() {
            DiagnosticKind::NotFound => SessionError::NotFound {
                name: name.to_string(),
                message: diag.into_message(),
            },
            DiagnosticKind::Failure => SessionError::protocol(op, diag),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, SessionError::Connection { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, SessionError::Protocol { .. })
    }

    pub fn is_range(&self) -> bool {
        matches!(self, SessionError::Range { .. })
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, SessionError::InvalidArgument(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound { .. })
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, SessionError::AlreadyClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_text_is_kept_verbatim() {
        let e = SessionError::connection("connect", Diagnostic::new("tls handshake: bad cert"));
        assert!(e.is_connection());
        assert_eq!(e.to_string(), "connection error (connect): tls handshake: bad cert");
    }

    #[test]
    fn lookup_maps_not_found_kind() {
        let e = SessionError::lookup("open_image", "disk9", Diagnostic::not_found("no such archive"));
        assert!(e.is_not_found());
        let e = SessionError::lookup("open_image", "disk9", Diagnostic::new("io"));
        assert!(e.is_protocol());
    }
}
