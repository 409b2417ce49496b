use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ORIGIN};
use reqwest::Url;

use crate::contract::{Credentials, LoginReply, QueryBody, RawResponse, RemoteSite};
use crate::error::{Result, SyncError};
use crate::session::{SessionHandle, TenantKey};

pub const DEFAULT_BASE_URL: &str = "https://{domain}.facilityapps.com";
pub const DEFAULT_CSRF_COOKIE: &str = "XSRF-TOKEN";
pub const DEFAULT_SESSION_COOKIE: &str = "laravel_token";

/// Talks to `{base}/login`, `{base}/logout` and `{base}/api/graphql`, where
/// `{base}` is the base URL template with `{domain}` replaced per tenant.
#[derive(Debug, Clone)]
pub struct HttpRemoteSite {
    base_url: String,
    csrf_cookie: String,
    session_cookie: String,
}

impl Default for HttpRemoteSite {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl HttpRemoteSite {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            csrf_cookie: DEFAULT_CSRF_COOKIE.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }

    pub fn with_cookie_names(mut self, csrf: impl Into<String>, session: impl Into<String>) -> Self {
        self.csrf_cookie = csrf.into();
        self.session_cookie = session.into();
        self
    }

    pub fn base_url(&self, tenant: &TenantKey) -> String {
        self.base_url
            .replace("{domain}", tenant.domain())
            .trim_end_matches('/')
            .to_string()
    }

    fn endpoint(&self, tenant: &TenantKey, path: &str) -> Result<Url> {
        let raw = format!("{}{}", self.base_url(tenant), path);
        Url::parse(&raw).map_err(|e| SyncError::Config(format!("invalid remote URL {raw}: {e}")))
    }
}

#[async_trait]
impl RemoteSite for HttpRemoteSite {
    async fn fetch_csrf_token(&self, session: &SessionHandle) -> Result<Option<String>> {
        let url = self.endpoint(session.key(), "/login")?;
        let resp = session.client().get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::transport(
                Some(status.as_u16()),
                format!("GET {} failed", url.path()),
            ));
        }
        let token = session.cookie(&url, &self.csrf_cookie);
        tracing::debug!(
            tenant = %session.key(),
            path = %resp.url().path(),
            token_issued = token.is_some(),
            "Fetched login page"
        );
        Ok(token)
    }

    async fn submit_credentials(
        &self,
        session: &SessionHandle,
        token: &str,
        credentials: &Credentials,
    ) -> Result<LoginReply> {
        let url = self.endpoint(session.key(), "/login")?;
        let resp = session
            .client()
            .post(url.clone())
            .form(&[
                ("_token", token),
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
                ("submit", ""),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::transport(
                Some(status.as_u16()),
                format!("POST {} failed", url.path()),
            ));
        }
        Ok(LoginReply {
            session_established: session.cookie(&url, &self.session_cookie).is_some(),
            final_path: resp.url().path().to_string(),
            status: status.as_u16(),
        })
    }

    async fn logout(&self, session: &SessionHandle) -> Result<bool> {
        let url = self.endpoint(session.key(), "/logout")?;
        let resp = session.client().get(url).send().await?;
        Ok(resp.status().is_success())
    }

    async fn post_query(&self, session: &SessionHandle, body: &QueryBody) -> Result<RawResponse> {
        let base = self.base_url(session.key());
        let url = self.endpoint(session.key(), "/api/graphql")?;
        let mut req = session
            .client()
            .post(url.clone())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(ORIGIN, base)
            .json(body);
        if let Some(token) = session.cookie(&url, &self.csrf_cookie) {
            req = req.header("X-CSRF-TOKEN", token);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        tracing::trace!(tenant = %session.key(), status, bytes = body.len(), "Query response");
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}
