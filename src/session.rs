//! Per-tenant authentication sessions.
//!
//! One [`SessionHandle`] exists per [`TenantKey`]. It carries the HTTP client
//! with its cookie jar (the credential state the remote site hands out) and a
//! small watch-channel state: whether a login is in flight, when the last
//! login succeeded and whether the most recent one did.
//!
//! Login attempts for a tenant are serialized by an atomic check-and-set on
//! that state. A second caller arriving while a login is in flight does not
//! start another handshake; what it does instead is the [`LoginWaitPolicy`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::watch;

use crate::callsite;
use crate::contract::{Credentials, RemoteSite};
use crate::dedup_log::{DedupLogger, LogEvent, LogLevel};
use crate::error::{Result, SyncError};

/// A (domain, principal) pair. Both parts are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey {
    domain: String,
    principal: String,
}

impl TenantKey {
    pub fn new(domain: &str, principal: &str) -> Self {
        Self {
            domain: domain.trim().to_lowercase(),
            principal: principal.trim().to_lowercase(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.principal)
    }
}

/// What a second `login` does while another login for the tenant is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginWaitPolicy {
    /// Report success at once, without waiting for the running login.
    #[default]
    ShortCircuit,
    /// Wait for the running login and report its outcome.
    AwaitInFlight,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub login_wait: LoginWaitPolicy,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            login_wait: LoginWaitPolicy::default(),
            user_agent: format!("facility-sync/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Snapshot of a session's login state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub login_in_flight: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ok: Option<bool>,
}

struct SessionSlot {
    key: TenantKey,
    client: reqwest::Client,
    jar: Arc<Jar>,
    state: watch::Sender<SessionState>,
}

/// Shared handle to one tenant's session. Cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionSlot>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl SessionHandle {
    fn open(key: TenantKey, settings: &SessionSettings) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(&settings.user_agent)
            .timeout(settings.request_timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        let (state, _) = watch::channel(SessionState::default());
        Ok(Self {
            inner: Arc::new(SessionSlot {
                key,
                client,
                jar,
                state,
            }),
        })
    }

    pub fn key(&self) -> &TenantKey {
        &self.inner.key
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn login_in_flight(&self) -> bool {
        self.inner.state.borrow().login_in_flight
    }

    pub fn last_login_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.borrow().last_login_at
    }

    /// Value of cookie `name` that the jar would send to `url`.
    pub fn cookie(&self, url: &Url, name: &str) -> Option<String> {
        let header = self.inner.jar.cookies(url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }

    pub fn ptr_eq(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once no login is in flight.
    pub async fn wait_ready(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| !s.login_in_flight).await;
    }

    /// Atomically claims the login slot. `false` when a login is already in flight.
    fn try_begin_login(&self) -> bool {
        self.inner.state.send_if_modified(|s| {
            if s.login_in_flight {
                false
            } else {
                s.login_in_flight = true;
                true
            }
        })
    }
}

/// Releases the login slot on every exit path, cancellation included.
struct LoginGuard<'a> {
    handle: &'a SessionHandle,
    done: bool,
}

impl<'a> LoginGuard<'a> {
    fn new(handle: &'a SessionHandle) -> Self {
        Self {
            handle,
            done: false,
        }
    }

    fn succeed(mut self, at: DateTime<Utc>) {
        self.handle.inner.state.send_modify(|s| {
            s.login_in_flight = false;
            s.last_login_at = Some(at);
            s.last_login_ok = Some(true);
        });
        self.done = true;
    }
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.handle.inner.state.send_modify(|s| {
                s.login_in_flight = false;
                s.last_login_ok = Some(false);
            });
        }
    }
}

pub struct SessionManager {
    remote: Arc<dyn RemoteSite>,
    logger: Arc<DedupLogger>,
    settings: SessionSettings,
    sessions: Mutex<HashMap<TenantKey, SessionHandle>>,
}

impl SessionManager {
    pub fn new(remote: Arc<dyn RemoteSite>, logger: Arc<DedupLogger>, settings: SessionSettings) -> Self {
        Self {
            remote,
            logger,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TenantKey, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get_or_create_session(&self, tenant: &TenantKey) -> Result<SessionHandle> {
        let mut sessions = self.lock();
        if let Some(handle) = sessions.get(tenant) {
            return Ok(handle.clone());
        }
        let handle = SessionHandle::open(tenant.clone(), &self.settings)?;
        tracing::debug!(tenant = %tenant, "Opened session");
        sessions.insert(tenant.clone(), handle.clone());
        Ok(handle)
    }

    pub fn session(&self, tenant: &TenantKey) -> Option<SessionHandle> {
        self.lock().get(tenant).cloned()
    }

    pub fn tenants(&self) -> Vec<TenantKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Logs the tenant in. Failures are logged and reported as `false`.
    pub async fn login(&self, tenant: &TenantKey, credentials: &Credentials) -> bool {
        let handle = match self.get_or_create_session(tenant) {
            Ok(h) => h,
            Err(e) => {
                self.logger
                    .log(
                        LogEvent::new(LogLevel::Error, callsite!(), format!("FAILED to open session for {tenant}"))
                            .with_error(&e),
                    )
                    .await;
                return false;
            }
        };

        if !handle.try_begin_login() {
            return match self.settings.login_wait {
                LoginWaitPolicy::ShortCircuit => {
                    tracing::debug!(tenant = %tenant, "Login already in flight, reporting success");
                    true
                }
                LoginWaitPolicy::AwaitInFlight => {
                    tracing::debug!(tenant = %tenant, "Login already in flight, waiting for it");
                    handle.wait_ready().await;
                    handle.state().last_login_ok.unwrap_or(false)
                }
            };
        }

        let guard = LoginGuard::new(&handle);
        match self.handshake(&handle, credentials).await {
            Ok(final_path) => {
                guard.succeed(Utc::now());
                self.logger
                    .log(LogEvent::new(
                        LogLevel::Info,
                        callsite!(),
                        format!("OK logged in {tenant} -> {final_path}"),
                    ))
                    .await;
                true
            }
            Err(e) => {
                drop(guard);
                self.logger
                    .log(
                        LogEvent::new(LogLevel::Error, callsite!(), format!("FAILED to log in {tenant}"))
                            .with_error(&e),
                    )
                    .await;
                false
            }
        }
    }

    async fn handshake(&self, handle: &SessionHandle, credentials: &Credentials) -> Result<String> {
        let tenant = handle.key().to_string();
        let token = self
            .remote
            .fetch_csrf_token(handle)
            .await?
            .ok_or_else(|| SyncError::AuthenticationRejected {
                tenant: tenant.clone(),
                reason: "no anti-forgery token issued".into(),
            })?;
        tracing::debug!(tenant = %tenant, "Got anti-forgery token");

        let reply = self.remote.submit_credentials(handle, &token, credentials).await?;
        if reply.session_established {
            Ok(reply.final_path)
        } else {
            Err(SyncError::AuthenticationRejected {
                tenant,
                reason: format!(
                    "no session cookie, redirected to {} (HTTP {})",
                    reply.final_path, reply.status
                ),
            })
        }
    }

    /// Logs the tenant out and releases its transport. No-op for unknown tenants.
    pub async fn logout(&self, tenant: &TenantKey) -> bool {
        let Some(handle) = self.session(tenant) else {
            tracing::debug!(tenant = %tenant, "Logout for tenant without session");
            return true;
        };
        handle.wait_ready().await;

        let ok = match self.remote.logout(&handle).await {
            Ok(true) => {
                self.logger
                    .log(LogEvent::new(LogLevel::Info, callsite!(), format!("OK logged out {tenant}")))
                    .await;
                true
            }
            Ok(false) => {
                self.logger
                    .log(LogEvent::new(LogLevel::Warning, callsite!(), format!("FAILED logout {tenant}")))
                    .await;
                false
            }
            Err(e) => {
                self.logger
                    .log(
                        LogEvent::new(LogLevel::Warning, callsite!(), format!("FAILED logout {tenant}"))
                            .with_error(&e),
                    )
                    .await;
                false
            }
        };
        self.lock().remove(tenant);
        ok
    }

    /// Suspends while a login for the tenant is in flight.
    pub async fn await_ready(&self, tenant: &TenantKey) {
        if let Some(handle) = self.session(tenant) {
            handle.wait_ready().await;
        }
    }

    /// True when the tenant never logged in or its last login is older than `interval`.
    pub fn needs_relogin(&self, tenant: &TenantKey, interval: Duration) -> bool {
        let Some(at) = self.session(tenant).and_then(|h| h.last_login_at()) else {
            return true;
        };
        match chrono::Duration::from_std(interval) {
            Ok(interval) => Utc::now() - at >= interval,
            Err(_) => false,
        }
    }

    /// Logs out every open session. Returns how many logouts succeeded.
    pub async fn shutdown(&self) -> usize {
        let tenants = self.tenants();
        let mut ok = 0;
        for tenant in &tenants {
            if self.logout(tenant).await {
                ok += 1;
            }
        }
        tracing::info!(sessions = tenants.len(), logged_out = ok, "Session manager shut down");
        ok
    }
}
