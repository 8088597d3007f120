//! Engine diagnostics: owned error detail returned by every fallible engine call.
//!
//! A `Diagnostic` is moved into the caller's error value (or dropped), so it is released
//! exactly once without an explicit free call.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Generic engine failure.
    Failure,
    /// Requested object (image, snapshot) does not exist.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    kind: DiagnosticKind,
    message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Failure,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::NotFound,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DiagnosticKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// Внутренние ошибки движка (anyhow) превращаются в текст с полной цепочкой контекста.
impl From<anyhow::Error> for Diagnostic {
    fn from(e: anyhow::Error) -> Self {
        Diagnostic::new(format!("{:#}", e))
    }
}

pub type EngineResult<T> = std::result::Result<T, Diagnostic>;
