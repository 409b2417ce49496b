use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error returned by a control-command handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Every fallible library operation returns this. Only transient transport
/// failures are retried by the fetch engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad credentials, missing anti-forgery token or no session proof after login.
    #[error("authentication rejected for {tenant}: {reason}")]
    AuthenticationRejected { tenant: String, reason: String },

    /// The server-reported total changed while paginating.
    #[error(
        "request {operation} cancelled: total number of records changed while paginating - was {expected} became {actual} (page {page})"
    )]
    PaginationConsistencyViolation {
        operation: String,
        page: u32,
        expected: u64,
        actual: u64,
    },

    /// A successful response without the expected JSON shape.
    #[error("malformed response for {operation} at page {page}: {reason}")]
    ProtocolMalformed {
        operation: String,
        page: u32,
        reason: String,
    },

    /// Non-2xx status, empty body or connection failure. Retryable.
    #[error("transport error{}: {message}", status_suffix(.status))]
    Transport { status: Option<u16>, message: String },

    /// Transient failures persisted past the attempt budget.
    #[error("request {operation} failed at page {page} after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        page: u32,
        attempts: u32,
        last: String,
    },

    /// The tenant has never completed a login.
    #[error("tenant {tenant} was not authenticated before requesting")]
    NotAuthenticated { tenant: String },

    #[error("wrong page size = {0}, allowed from 1 to 500")]
    InvalidPageSize(u32),

    #[error("query template for operation '{0}' not found")]
    UnknownOperation(String),

    #[error("substitution tag '{0}' is reserved for pagination")]
    ReservedTag(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("log store error: {0}")]
    Store(String),

    #[error("control queue error: {0}")]
    Queue(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {s})"),
        None => String::new(),
    }
}

impl SyncError {
    /// Whether the fetch engine may retry the failed request.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }

    pub(crate) fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::Transport {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "sqlite-store")]
impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}
