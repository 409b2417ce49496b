// facility-sync/src/testing.rs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::contract::{Credentials, LoginReply, QueryBody, RawResponse, RemoteSite};
use crate::error::{Result, SyncError};
use crate::session::SessionHandle;

pub(crate) struct SentQuery {
    pub at: Instant,
    pub body: QueryBody,
}

/// Remote site that logs in after `login_delay` and answers queries from a script.
pub(crate) struct ScriptedRemote {
    login_delay: Duration,
    session_established: bool,
    rejected_domains: Vec<String>,
    handshakes: AtomicUsize,
    logouts: AtomicUsize,
    replies: Mutex<VecDeque<Result<RawResponse>>>,
    sent: Mutex<Vec<SentQuery>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            login_delay: Duration::ZERO,
            session_established: true,
            rejected_domains: Vec::new(),
            handshakes: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            replies: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn with_session_established(mut self, ok: bool) -> Self {
        self.session_established = ok;
        self
    }

    /// Rejects the credentials of tenants on `domain` only.
    pub fn with_rejected_domain(mut self, domain: &str) -> Self {
        self.rejected_domains.push(domain.to_string());
        self
    }

    pub fn reply(self, reply: Result<RawResponse>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|s| s.at).collect()
    }

    pub fn sent_queries(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.body.query.clone()).collect()
    }
}

#[async_trait]
impl RemoteSite for ScriptedRemote {
    async fn fetch_csrf_token(&self, _session: &SessionHandle) -> Result<Option<String>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.login_delay).await;
        Ok(Some("token".into()))
    }

    async fn submit_credentials(
        &self,
        session: &SessionHandle,
        _token: &str,
        _credentials: &Credentials,
    ) -> Result<LoginReply> {
        let established = self.session_established
            && !self.rejected_domains.iter().any(|d| d == session.key().domain());
        Ok(LoginReply {
            session_established: established,
            final_path: if established { "/dashboard" } else { "/login" }.into(),
            status: 200,
        })
    }

    async fn logout(&self, _session: &SessionHandle) -> Result<bool> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn post_query(&self, _session: &SessionHandle, body: &QueryBody) -> Result<RawResponse> {
        self.sent.lock().unwrap().push(SentQuery {
            at: Instant::now(),
            body: body.clone(),
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport(None, "script exhausted")))
    }
}

pub(crate) fn json_reply(value: Value) -> Result<RawResponse> {
    Ok(RawResponse {
        status: 200,
        content_type: Some("application/json".into()),
        body: value.to_string(),
    })
}

pub(crate) fn status_reply(status: u16) -> Result<RawResponse> {
    Ok(RawResponse {
        status,
        content_type: Some("text/html".into()),
        body: "<html>error</html>".into(),
    })
}

/// A list page of `count` records numbered from `first`.
pub(crate) fn list_page(operation: &str, first: usize, count: usize, total: Option<u64>) -> Result<RawResponse> {
    let records: Vec<Value> = (first..first + count).map(|id| json!({ "id": id })).collect();
    let mut page = json!({ "data": records });
    if let Some(total) = total {
        page["paginatorInfo"] = json!({ "total": total });
    }
    let mut data = serde_json::Map::new();
    data.insert(operation.to_string(), page);
    json_reply(json!({ "data": data }))
}
