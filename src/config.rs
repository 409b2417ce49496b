// facility-sync/src/config.rs

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::fetch::{RetryPolicy, MAX_PAGE_SIZE};
use crate::remote::{DEFAULT_BASE_URL, DEFAULT_CSRF_COOKIE, DEFAULT_SESSION_COOKIE};
use crate::session::{LoginWaitPolicy, SessionSettings, TenantKey};

/// Fully loaded service configuration. Tenant passwords are injected from the
/// environment by [`crate::load_config::load_config`], never read from the file.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            store: default_store(),
            name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    /// `{domain}` is replaced by the tenant domain.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_csrf_cookie")]
    pub csrf_cookie: String,
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub login_wait: LoginWaitPolicy,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            csrf_cookie: default_csrf_cookie(),
            session_cookie: default_session_cookie(),
            request_timeout_secs: default_request_timeout(),
            login_wait: LoginWaitPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_secs: f64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default)]
    pub log_pages: bool,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_timeout_secs: default_retry_timeout(),
            retry_multiplier: default_retry_multiplier(),
            page_size: default_page_size(),
            templates_dir: default_templates_dir(),
            log_pages: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_window")]
    pub dedup_window_secs: u64,
    /// Durable log database. Without it every diagnostic is local only.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_window(),
            sqlite_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_window")]
    pub relogin_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            relogin_interval_secs: default_window(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct TenantConfig {
    pub domain: String,
    pub principal: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
    #[serde(skip)]
    pub password: String,
}

impl std::fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConfig")
            .field("domain", &self.domain)
            .field("principal", &self.principal)
            .field("password_env", &self.password_env)
            .finish_non_exhaustive()
    }
}

impl TenantConfig {
    pub fn key(&self) -> TenantKey {
        TenantKey::new(&self.domain, &self.principal)
    }
}

fn default_store() -> String {
    "fm".to_string()
}
fn default_service_name() -> String {
    "sync".to_string()
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_csrf_cookie() -> String {
    DEFAULT_CSRF_COOKIE.to_string()
}
fn default_session_cookie() -> String {
    DEFAULT_SESSION_COOKIE.to_string()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_attempts() -> u32 {
    5
}
fn default_retry_timeout() -> f64 {
    5.0
}
fn default_retry_multiplier() -> f64 {
    3.0
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_templates_dir() -> PathBuf {
    PathBuf::from("./graphql")
}
fn default_window() -> u64 {
    3600
}

impl SyncConfig {
    /// Range checks, run once at startup.
    pub fn validate(&self) -> Result<()> {
        let fetch = &self.fetch;
        if !(1..=MAX_PAGE_SIZE).contains(&fetch.page_size) {
            return Err(SyncError::InvalidPageSize(fetch.page_size));
        }
        if fetch.attempts == 0 {
            return Err(SyncError::Config("fetch.attempts must be at least 1".into()));
        }
        if !fetch.retry_timeout_secs.is_finite() || fetch.retry_timeout_secs < 0.0 {
            return Err(SyncError::Config(format!(
                "fetch.retry_timeout_secs must be a non-negative number, got {}",
                fetch.retry_timeout_secs
            )));
        }
        if !fetch.retry_multiplier.is_finite() || fetch.retry_multiplier < 1.0 {
            return Err(SyncError::Config(format!(
                "fetch.retry_multiplier must be at least 1.0, got {}",
                fetch.retry_multiplier
            )));
        }
        let longest = fetch.retry_timeout_secs * fetch.retry_multiplier.powi(fetch.attempts.saturating_sub(1) as i32);
        if Duration::try_from_secs_f64(longest).is_err() {
            return Err(SyncError::Config(format!(
                "fetch retry backoff out of range: {} s growing by {} over {} attempts",
                fetch.retry_timeout_secs, fetch.retry_multiplier, fetch.attempts
            )));
        }
        if self.sessions.relogin_interval_secs == 0 {
            return Err(SyncError::Config("sessions.relogin_interval_secs must be positive".into()));
        }
        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::Config("remote.request_timeout_secs must be positive".into()));
        }
        if self.service.store.is_empty() || self.service.name.is_empty() {
            return Err(SyncError::Config("service.store and service.name must be set".into()));
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.domain.trim().is_empty() || tenant.principal.trim().is_empty() {
                return Err(SyncError::Config("tenant domain and principal must be set".into()));
            }
            if !seen.insert(tenant.key()) {
                return Err(SyncError::Config(format!("tenant {} configured twice", tenant.key())));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch.attempts,
            initial_timeout: Duration::from_secs_f64(self.fetch.retry_timeout_secs),
            multiplier: self.fetch.retry_multiplier,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            login_wait: self.remote.login_wait,
            request_timeout: Duration::from_secs(self.remote.request_timeout_secs),
            ..SessionSettings::default()
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.logging.dedup_window_secs)
    }

    pub fn relogin_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.relogin_interval_secs)
    }

    pub fn tenant(&self, domain: &str) -> Option<&TenantConfig> {
        let domain = domain.trim().to_lowercase();
        self.tenants.iter().find(|t| t.key().domain() == domain)
    }

    pub fn trace_loaded(&self) {
        info!(
            store = %self.service.store,
            service = %self.service.name,
            tenants = self.tenants.len(),
            page_size = self.fetch.page_size,
            attempts = self.fetch.attempts,
            "Loaded SyncConfig"
        );
        for tenant in &self.tenants {
            tenant.trace_loaded();
        }
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}

impl TenantConfig {
    pub fn trace_loaded(&self) {
        info!(
            domain = %self.domain,
            principal = %self.principal,
            password_set = !self.password.is_empty(),
            "Loaded tenant"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> SyncConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn empty_document_takes_defaults() {
        let config = parse("{}");
        assert_eq!(config.fetch.attempts, 5);
        assert_eq!(config.fetch.page_size, 500);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.remote.login_wait, LoginWaitPolicy::ShortCircuit);
        assert_eq!(config.dedup_window(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            parse("fetch: { page_size: 501 }").validate(),
            Err(SyncError::InvalidPageSize(501))
        ));
        assert!(parse("fetch: { attempts: 0 }").validate().is_err());
        assert!(parse("fetch: { retry_timeout_secs: -1.0 }").validate().is_err());
        assert!(parse("fetch: { retry_multiplier: 0.5 }").validate().is_err());
        assert!(parse("fetch: { retry_multiplier: 1.0e300, attempts: 3 }").validate().is_err());
        assert!(parse("sessions: { relogin_interval_secs: 0 }").validate().is_err());
    }

    #[test]
    fn rejects_backoff_too_long_for_a_duration() {
        let config = parse("fetch: { retry_timeout_secs: 1.0e30 }");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn rejects_duplicate_tenants() {
        let config = parse(
            r#"
tenants:
  - { domain: acme, principal: admin, password_env: A }
  - { domain: ACME, principal: Admin, password_env: B }
"#,
        );
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn login_wait_policy_parses_snake_case() {
        let config = parse("remote: { login_wait: await_in_flight }");
        assert_eq!(config.session_settings().login_wait, LoginWaitPolicy::AwaitInFlight);
    }

    #[test]
    fn debug_output_hides_password() {
        let mut config = parse("tenants: [ { domain: acme, principal: admin, password_env: A } ]");
        config.tenants[0].password = "hunter2".into();
        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(config.tenant("Acme").is_some());
    }
}
