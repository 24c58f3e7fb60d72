//! Shared primitives used across carta crates.

pub mod clock;
pub mod logging;

use core::fmt;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;

/// Result alias used across the workspace.
pub type CartaResult<T> = Result<T, CartaError>;

/// Broad failure classes. Callers branch on these, logs and tests on `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed URL, header, MIME type or XML.
    Parse,
    /// An allocation could not be satisfied; no state was committed.
    OutOfMemory,
    /// A required object (handle, server name, sink) was absent.
    NullPointer,
    /// Transport or resolver failure.
    Network,
    /// Operation not valid in the current state.
    InvalidState,
    /// Refused by an access rule (scheme, network type).
    NoAccess,
    /// Configuration value out of range.
    Policy,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::OutOfMemory => "out_of_memory",
            Self::NullPointer => "null_pointer",
            Self::Network => "network",
            Self::InvalidState => "invalid_state",
            Self::NoAccess => "no_access",
            Self::Policy => "policy",
        }
    }
}

/// Top-level error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartaError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
}

impl CartaError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn parse(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, code, message)
    }

    pub fn out_of_memory(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, code, message)
    }

    pub fn null_pointer(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NullPointer, code, message)
    }

    pub fn network(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, code, message)
    }

    pub fn invalid_state(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, code, message)
    }

    pub fn policy(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, code, message)
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.kind == ErrorKind::OutOfMemory
    }
}

impl fmt::Display for CartaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CartaError {}

/// Copies `value` into a freshly allocated string, reporting allocation
/// failure instead of aborting.
pub fn try_owned_string(value: &str, code: &'static str) -> CartaResult<String> {
    let mut out = String::new();
    out.try_reserve_exact(value.len()).map_err(|error| {
        CartaError::out_of_memory(code, format!("cannot allocate {} bytes: {error}", value.len()))
    })?;
    out.push_str(value);
    Ok(out)
}

/// Appends `bytes` to `buffer` after reserving room for them.
pub fn try_extend_bytes(buffer: &mut Vec<u8>, bytes: &[u8], code: &'static str) -> CartaResult<()> {
    buffer.try_reserve(bytes.len()).map_err(|error| {
        CartaError::out_of_memory(
            code,
            format!("cannot grow buffer by {} bytes: {error}", bytes.len()),
        )
    })?;
    buffer.extend_from_slice(bytes);
    Ok(())
}
