use std::fmt;

/// Error kind shared by every trait surface in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport unreachable or connection dropped.
    Connection,
    /// Operation requires a live connection and reconnecting did not help.
    NotConnected,
    /// A message handler faulted.
    Handler,
    /// Reading a remote tag failed.
    Acquisition,
    /// Schema resolution failed (unknown type, unsupported primitive).
    Schema,
    Config,
    Format,
    Io,
    /// The operation was abandoned because shutdown was requested.
    Cancelled,
}

/// Error returned by all transport, bus, worker, store and tag-source methods.
#[derive(Debug)]
pub struct UnsError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UnsError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, msg)
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, msg)
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, msg)
    }

    pub fn acquisition(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Acquisition, msg)
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, msg)
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for UnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for UnsError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → UnsError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for UnsError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for UnsError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::str::Utf8Error> for UnsError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for UnsError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::format(e.to_string())
    }
}
