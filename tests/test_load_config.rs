use std::env;
use std::fs::write;
use std::path::PathBuf;
use std::time::Duration;

use facility_sync::session::LoginWaitPolicy;
use serial_test::serial;
use tempfile::NamedTempFile;

/// A static config plus the password env vars produces a validated SyncConfig.
#[tokio::test]
#[serial]
async fn test_load_config_success_injects_passwords_from_env() {
    // Static config file with NO secrets
    let config_yaml = r#"
service:
  store: fm
  name: sync
remote:
  base_url: "https://{domain}.example.test"
  login_wait: await_in_flight
fetch:
  attempts: 3
  retry_timeout_secs: 1.5
  page_size: 200
  templates_dir: ./graphql
sessions:
  relogin_interval_secs: 600
tenants:
  - domain: acme
    principal: admin
    password_env: FS_TEST_ACME_PASSWORD
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    env::set_var("FS_TEST_ACME_PASSWORD", "top-secret-test-password");

    let config = facility_sync::load_config::load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.fetch.page_size, 200);
    assert_eq!(config.fetch.templates_dir, PathBuf::from("./graphql"));
    assert_eq!(config.retry_policy().attempts, 3);
    assert_eq!(config.retry_policy().initial_timeout, Duration::from_millis(1500));
    assert_eq!(config.retry_policy().multiplier, 3.0);
    assert_eq!(config.relogin_interval(), Duration::from_secs(600));
    assert_eq!(config.remote.login_wait, LoginWaitPolicy::AwaitInFlight);

    // Password must come directly from the environment
    assert_eq!(config.tenants.len(), 1);
    assert_eq!(config.tenants[0].password, "top-secret-test-password");
}

/// A missing password env var makes the loader fail and name the variable.
#[tokio::test]
#[serial]
async fn test_load_config_errors_on_missing_env() {
    let config_yaml = r#"
tenants:
  - domain: acme
    principal: admin
    password_env: FS_TEST_MISSING_PASSWORD
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    env::remove_var("FS_TEST_MISSING_PASSWORD");

    let err = facility_sync::load_config::load_config(config_file.path()).unwrap_err();
    let msg = err.to_string();

    assert!(
        msg.contains("FS_TEST_MISSING_PASSWORD"),
        "Must error for missing env var, got: {msg}"
    );
}

/// A file that is not valid YAML is reported as a parse error.
#[tokio::test]
#[serial]
async fn test_load_config_errors_for_invalid_file() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), b"not-yaml: [:::").unwrap();

    let err = facility_sync::load_config::load_config(config_file.path()).unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("parse") || msg.contains("YAML"),
        "Parse error expected, got: {msg}"
    );
}

/// Out-of-range values are rejected at load time, not at call time.
#[tokio::test]
#[serial]
async fn test_load_config_rejects_invalid_page_size() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), b"fetch:\n  page_size: 0\n").unwrap();

    let err = facility_sync::load_config::load_config(config_file.path()).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("page size"), "Validation error expected, got: {msg}");
}
