//! # contract: the seams between the sync engine and the outside world
//!
//! The engine talks to four collaborators it does not own: the remote site it
//! authenticates against and pages data from, the durable log store, the
//! control queue, and the handlers the control plane dispatches to. Each one is
//! a trait here so production code plugs in real clients and tests plug in
//! `mockall` mocks.
//!
//! ## Mocking & Testing
//! - Every trait is annotated with `automock` under `cfg(test)` and the
//!   `test-export-mocks` feature, so integration tests can build `MockRemoteSite`,
//!   `MockLogStore`, `MockControlQueue` and `MockCommandHandler`.
//!
//! ## Implementations in this crate
//! - [`RemoteSite`]: [`crate::remote::HttpRemoteSite`]
//! - [`LogStore`]: [`crate::log_store::MemoryLogStore`], `crate::log_store::SqliteLogStore`
//! - [`ControlQueue`]: [`crate::dispatch::ChannelQueue`], [`crate::dispatch::LineQueue`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::dedup_log::LogEntry;
use crate::dispatch::ControlCommand;
use crate::error::{HandlerError, Result};
use crate::session::SessionHandle;

/// Login identity for one tenant.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the remote site answered to the credentials POST.
#[derive(Debug, Clone)]
pub struct LoginReply {
    /// The session-proof cookie is present after the POST.
    pub session_established: bool,
    /// Path the POST ended up at after redirects.
    pub final_path: String,
    pub status: u16,
}

/// JSON body of one query request.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBody {
    pub operation_name: String,
    pub query: String,
    pub variables: serde_json::Value,
}

/// Raw reply to a query POST, before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Response content keyed by content type, attached to diagnostics.
    pub fn content_payload(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        let key = self
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mut content = serde_json::Map::new();
        content.insert(key, serde_json::Value::String(self.body.clone()));
        Some(serde_json::Value::Object(content))
    }
}

/// Transport to the remote facility-management site.
///
/// Implementations own the wire details (URLs, cookies, headers). They never
/// retry; retry policy belongs to the caller.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteSite: Send + Sync {
    /// Idempotent request that leaves the anti-forgery token in the session.
    /// Returns the token, or `None` when the site did not issue one.
    async fn fetch_csrf_token(&self, session: &SessionHandle) -> Result<Option<String>>;

    /// POST the login form.
    async fn submit_credentials(
        &self,
        session: &SessionHandle,
        token: &str,
        credentials: &Credentials,
    ) -> Result<LoginReply>;

    /// End the remote session. `Ok(false)` when the site refused.
    async fn logout(&self, session: &SessionHandle) -> Result<bool>;

    /// POST one query page. Non-2xx statuses are returned, not raised;
    /// `Err` means the request never produced a response.
    async fn post_query(&self, session: &SessionHandle, body: &QueryBody) -> Result<RawResponse>;
}

/// Durable store behind the deduplicating logger.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Number of stored entries with `dedup_key` written at or after `since`.
    async fn count_since(&self, dedup_key: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn insert(&self, entry: &LogEntry) -> Result<()>;
}

/// One message pulled from the control queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Durable control queue.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ControlQueue: Send {
    /// Queue name, `<store>.<service>.control` by convention.
    fn name(&self) -> String;

    /// Next delivery, or `None` once the queue is closed.
    async fn next(&mut self) -> Option<Delivery>;

    /// Remove the delivery from the queue.
    async fn ack(&mut self, tag: u64) -> Result<()>;
}

/// Handler for one named control command.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Receives the full envelope, `cmd` included.
    async fn handle(&self, command: &ControlCommand) -> std::result::Result<(), HandlerError>;
}
