//! Top-level orchestration: tenant logins, periodic re-login, the control
//! loop and the explicit shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::callsite;
use crate::config::SyncConfig;
use crate::contract::{CommandHandler, ControlQueue, Credentials, LogStore, RemoteSite};
use crate::dedup_log::{DedupLogger, LogEvent, LogLevel};
use crate::dispatch::{ControlCommand, ControlPlaneDispatcher, HandlerRegistry, RunFlag};
use crate::error::{HandlerError, Result, SyncError};
use crate::fetch::{FetchOutput, FetchRequest, PaginatedFetchEngine};
use crate::remote::HttpRemoteSite;
use crate::session::{SessionManager, TenantKey};
use crate::templates::QueryTemplates;

/// A configured tenant with its resolved credentials.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub key: TenantKey,
    pub credentials: Credentials,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// How stale a login may get, and how often staleness is checked.
    pub relogin_interval: Duration,
    /// Page size for `resync` commands that do not name one.
    pub page_size: u32,
}

pub struct SyncService {
    tenants: Vec<Tenant>,
    sessions: Arc<SessionManager>,
    engine: Arc<PaginatedFetchEngine>,
    logger: Arc<DedupLogger>,
    settings: ServiceSettings,
    run_flag: RunFlag,
}

/// Arguments of the `resync` control command.
#[derive(Debug, Deserialize)]
pub struct ResyncArgs {
    pub domain: String,
    pub operation: String,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,
    #[serde(default)]
    pub single: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ReloginArgs {
    #[serde(default)]
    domain: Option<String>,
}

impl SyncService {
    pub fn new(
        tenants: Vec<Tenant>,
        sessions: Arc<SessionManager>,
        engine: Arc<PaginatedFetchEngine>,
        logger: Arc<DedupLogger>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            tenants,
            sessions,
            engine,
            logger,
            settings,
            run_flag: RunFlag::default(),
        }
    }

    /// Wires the production stack from a validated configuration.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = open_store(config).await?;
        let logger = Arc::new(DedupLogger::new(config.service.name.clone(), store, config.dedup_window()));

        let remote: Arc<dyn RemoteSite> = Arc::new(
            HttpRemoteSite::new(config.remote.base_url.clone())
                .with_cookie_names(config.remote.csrf_cookie.clone(), config.remote.session_cookie.clone()),
        );
        let templates = Arc::new(QueryTemplates::load_dir(&config.fetch.templates_dir).map_err(|e| {
            SyncError::Config(format!(
                "failed to load templates from {}: {e}",
                config.fetch.templates_dir.display()
            ))
        })?);
        let sessions = Arc::new(SessionManager::new(remote.clone(), logger.clone(), config.session_settings()));
        let engine = Arc::new(
            PaginatedFetchEngine::new(sessions.clone(), remote, templates, logger.clone())
                .with_policy(config.retry_policy())
                .with_page_logging(config.fetch.log_pages),
        );

        let tenants = config
            .tenants
            .iter()
            .map(|t| Tenant {
                key: t.key(),
                credentials: Credentials {
                    username: t.principal.clone(),
                    password: t.password.clone(),
                },
            })
            .collect();

        Ok(Self::new(
            tenants,
            sessions,
            engine,
            logger,
            ServiceSettings {
                relogin_interval: config.relogin_interval(),
                page_size: config.fetch.page_size,
            },
        ))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn run_flag(&self) -> RunFlag {
        self.run_flag.clone()
    }

    pub fn tenants(&self) -> &[Tenant] {
        &self.tenants
    }

    fn tenant(&self, domain: &str) -> Option<&Tenant> {
        let domain = domain.trim().to_lowercase();
        self.tenants.iter().find(|t| t.key.domain() == domain)
    }

    /// Logs every configured tenant in. Returns how many succeeded.
    pub async fn login_all(&self) -> usize {
        let results = join_all(
            self.tenants
                .iter()
                .map(|t| self.sessions.login(&t.key, &t.credentials)),
        )
        .await;
        let ok = results.iter().filter(|ok| **ok).count();
        info!(tenants = self.tenants.len(), logged_in = ok, "Logged in tenants");
        ok
    }

    /// Re-logs tenants whose last login is older than the relogin interval.
    pub async fn relogin_stale(&self) -> usize {
        let mut ok = 0;
        for tenant in &self.tenants {
            if self.sessions.needs_relogin(&tenant.key, self.settings.relogin_interval)
                && self.sessions.login(&tenant.key, &tenant.credentials).await
            {
                ok += 1;
            }
        }
        ok
    }

    /// Re-logs every tenant, or only the tenant of `domain`.
    ///
    /// Every target is attempted; failures are collected into one error.
    pub async fn relogin(&self, domain: Option<&str>) -> Result<usize> {
        let targets: Vec<&Tenant> = match domain {
            Some(d) => vec![self.tenant(d).ok_or_else(|| SyncError::Config(format!("unknown tenant domain {d}")))?],
            None => self.tenants.iter().collect(),
        };
        let attempted = targets.len();
        let mut failed = Vec::new();
        for tenant in targets {
            if !self.sessions.login(&tenant.key, &tenant.credentials).await {
                warn!(tenant = %tenant.key, "Re-login failed");
                failed.push(tenant.key.to_string());
            }
        }
        if failed.is_empty() {
            return Ok(attempted);
        }
        Err(SyncError::AuthenticationRejected {
            reason: format!("re-login failed for {} of {attempted} tenants", failed.len()),
            tenant: failed.join(", "),
        })
    }

    /// Fetches one operation for the tenant of `domain`, logging in first if needed.
    pub async fn fetch(&self, domain: &str, request: &FetchRequest) -> Result<FetchOutput> {
        let tenant = self
            .tenant(domain)
            .ok_or_else(|| SyncError::Config(format!("unknown tenant domain {domain}")))?;
        if self.sessions.needs_relogin(&tenant.key, self.settings.relogin_interval)
            && !self.sessions.login(&tenant.key, &tenant.credentials).await
        {
            return Err(SyncError::NotAuthenticated {
                tenant: tenant.key.to_string(),
            });
        }
        self.engine.fetch(&tenant.key, request, None).await
    }

    pub async fn resync(&self, args: ResyncArgs) -> Result<usize> {
        let mut request = FetchRequest::new(args.operation, args.page_size.unwrap_or(self.settings.page_size))?;
        for (tag, value) in args.substitutions {
            request = request.with_substitution(tag, value);
        }
        if args.single {
            request = request.single();
        }
        let output = self.fetch(&args.domain, &request).await?;
        self.logger
            .log(LogEvent::new(
                LogLevel::Info,
                callsite!(),
                format!(
                    "OK resync of {} for {}: {} records",
                    request.operation(),
                    args.domain,
                    output.len()
                ),
            ))
            .await;
        Ok(output.len())
    }

    /// Registry with the built-in `relogin` and `resync` handlers.
    pub fn registry(self: &Arc<Self>) -> Result<HandlerRegistry> {
        Ok(HandlerRegistry::builder()
            .register("relogin", Arc::new(ReloginHandler(self.clone())))?
            .register("resync", Arc::new(ResyncHandler(self.clone())))?
            .build())
    }

    /// Runs the control loop until a `stop` command or the queue closes,
    /// re-logging stale sessions every relogin interval.
    pub async fn run<Q>(self: &Arc<Self>, queue: &mut Q) -> Result<usize>
    where
        Q: ControlQueue + ?Sized,
    {
        let dispatcher = ControlPlaneDispatcher::new(Arc::new(self.registry()?), self.run_flag(), self.logger.clone());
        let mut tick = tokio::time::interval(self.settings.relogin_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        info!(queue = %queue.name(), "Control loop started");
        let mut processed = 0;
        while self.run_flag.is_running() {
            let delivery = tokio::select! {
                delivery = queue.next() => Some(delivery),
                _ = tick.tick() => None,
            };
            match delivery {
                Some(Some(delivery)) => {
                    dispatcher.process(queue, delivery).await;
                    processed += 1;
                }
                Some(None) => {
                    warn!(queue = %queue.name(), "Control queue closed, leaving control loop");
                    break;
                }
                None => {
                    let renewed = self.relogin_stale().await;
                    if renewed > 0 {
                        info!(renewed, "Renewed stale sessions");
                    }
                }
            }
        }
        info!(processed, "Control loop finished");
        Ok(processed)
    }

    /// Logs every tenant out. Returns how many logouts succeeded.
    pub async fn shutdown(&self) -> usize {
        self.sessions.shutdown().await
    }
}

async fn open_store(config: &SyncConfig) -> Result<Option<Arc<dyn LogStore>>> {
    let Some(path) = &config.logging.sqlite_path else {
        info!("No log database configured, diagnostics are local only");
        return Ok(None);
    };
    #[cfg(feature = "sqlite-store")]
    {
        let store = crate::log_store::SqliteLogStore::open(path).await?;
        info!(path = %path.display(), "Opened log database");
        Ok(Some(Arc::new(store)))
    }
    #[cfg(not(feature = "sqlite-store"))]
    {
        error!(path = %path.display(), "Built without sqlite-store, log database ignored");
        Ok(None)
    }
}

struct ReloginHandler(Arc<SyncService>);

#[async_trait]
impl CommandHandler for ReloginHandler {
    async fn handle(&self, command: &ControlCommand) -> std::result::Result<(), HandlerError> {
        let args: ReloginArgs = command.args()?;
        let renewed = self.0.relogin(args.domain.as_deref()).await?;
        info!(renewed, "Relogin command done");
        Ok(())
    }
}

struct ResyncHandler(Arc<SyncService>);

#[async_trait]
impl CommandHandler for ResyncHandler {
    async fn handle(&self, command: &ControlCommand) -> std::result::Result<(), HandlerError> {
        let args: ResyncArgs = command.args()?;
        if let Err(e) = self.0.resync(args).await {
            error!(error = %e, "Resync command failed");
            return Err(e.into());
        }
        Ok(())
    }
}
