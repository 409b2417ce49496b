use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::SyncConfig;

/// Loads a static YAML config file (no secrets) and injects every tenant's
/// password from the environment variable named in its `password_env`.
/// Returns a validated SyncConfig or an error.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SyncConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: SyncConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    for tenant in config.tenants.iter_mut() {
        match std::env::var(&tenant.password_env) {
            Ok(password) if !password.is_empty() => {
                info!(tenant = %tenant.key(), var = %tenant.password_env, "Password found in env");
                tenant.password = password;
            }
            Ok(_) | Err(_) => {
                error!(tenant = %tenant.key(), var = %tenant.password_env, "Password environment variable not set");
                anyhow::bail!(
                    "{} environment variable not set (password for tenant {})",
                    tenant.password_env,
                    tenant.key()
                );
            }
        }
    }

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path_ref.display()))?;
    config.trace_loaded();
    Ok(config)
}
