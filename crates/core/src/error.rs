//! Error types shared by every layer of the toolkit.

use std::io::Error as IoError;
use std::io::ErrorKind;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The toolkit-wide error type.
///
/// Errors are values, not control flow: every suspension point returns
/// `Result` and cancellation is the [`Error::Cancelled`] variant. The type
/// is `Clone` so that coalesced waiters (shared promises, cached fetches)
/// can all observe the same failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A stop token fired while the operation was suspended.
    #[error("operation cancelled")]
    Cancelled,
    /// The peer closed or reset the transport during a read or write.
    #[error("connection aborted")]
    Aborted,
    /// A protocol-level parse error (HTTP or RPC).
    #[error("malformed message: {0}")]
    Malformed(String),
    /// An HTTP-level failure carrying a status code or sentinel.
    #[error(transparent)]
    Http(#[from] HttpError),
    /// The caller violated an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An internal failure that is not the peer's fault.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// A [`Error::Malformed`] with the given description.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// An [`Error::InvalidArgument`] with the given description.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// An [`Error::Runtime`] with the given description.
    #[inline]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Whether this error only reports that the peer went away or a stop
    /// token fired; the cases a server logs quietly instead of loudly.
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Aborted)
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        match error.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Self::Aborted,
            _ => Self::Runtime(error.to_string()),
        }
    }
}

/// An HTTP failure: a real status in `100..=599`, or one of the negative
/// sentinels for failures that never made it to a status line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("http error {status}: {message}")]
pub struct HttpError {
    /// Status code or sentinel.
    pub status: i32,
    /// Human-readable description; for `fetch_ok` failures this is the
    /// response body.
    pub message: String,
}

impl HttpError {
    /// The transfer was aborted before a response arrived.
    pub const ABORTED: i32 = -1;
    /// The peer's response could not be parsed.
    pub const MALFORMED_RESPONSE: i32 = -2;
    /// The backend failed without a more specific classification.
    pub const UNKNOWN: i32 = -3;
    /// The request used a method this implementation does not know.
    pub const INVALID_METHOD: i32 = -4;

    /// An error for `status` with the standard reason phrase as message.
    pub fn new(status: i32) -> Self {
        let message = match u16::try_from(status) {
            Ok(code) => crate::http::status_text(code).to_owned(),
            Err(_) => format!("error {status}"),
        };
        Self { status, message }
    }

    /// An error for `status` with a custom message.
    pub fn with_message(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}
