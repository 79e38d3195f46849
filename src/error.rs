//! Error kinds. Most functions propagate via `anyhow::Result`; the
//! transport-level retryable/fatal split needs a typed error so the
//! executor can decide whether to re-attempt on the next schedule tick.

use derive_more::Display;

#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("missing required field `{_0}`")]
    MissingField(String),
    #[display("invalid value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
    #[display("{_0}")]
    Parse(String),
}

impl std::error::Error for ConfigError {}

/// Errors produced by a `Transport` implementation, categorized as retryable or fatal.
#[derive(Debug, Display, Clone)]
pub enum TransportError {
    #[display("timeout waiting for response")]
    Timeout,
    #[display("I/O error: {_0}")]
    Io(String),
    #[display("bad function code: 0x{_0:02x}")]
    BadFunction(u8),
    #[display("malformed response: {_0}")]
    Malformed(String),
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// I/O errors and timeouts are worth retrying on the next schedule tick;
    /// a bad function code or a malformed frame indicates a protocol-level
    /// problem that won't resolve itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Timeout)
    }
}

#[derive(Debug, Display)]
#[display("failed to initialize transport: {_0}")]
pub struct TransportInitError(pub String);

impl std::error::Error for TransportInitError {}
