// facility-sync/tests/remote_integration.rs

use std::sync::Arc;

use facility_sync::contract::{Credentials, RemoteSite};
use facility_sync::dedup_log::DedupLogger;
use facility_sync::fetch::{FetchOutput, FetchRequest, PaginatedFetchEngine, RetryPolicy};
use facility_sync::remote::HttpRemoteSite;
use facility_sync::session::{SessionManager, SessionSettings, TenantKey};
use facility_sync::templates::QueryTemplates;
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn creds() -> Credentials {
    Credentials {
        username: "admin".into(),
        password: "s3cret".into(),
    }
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "XSRF-TOKEN=csrf123; Path=/"))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_string_contains("_token=csrf123"))
        .and(body_string_contains("username=admin"))
        .and(body_string_contains("password=s3cret"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "laravel_token=abc; Path=/"))
        .expect(1)
        .mount(server)
        .await;
}

fn stack(server: &MockServer) -> (Arc<SessionManager>, Arc<dyn RemoteSite>, Arc<DedupLogger>) {
    let remote: Arc<dyn RemoteSite> = Arc::new(HttpRemoteSite::new(server.uri()));
    let logger = Arc::new(DedupLogger::local("sync"));
    let sessions = Arc::new(SessionManager::new(
        remote.clone(),
        logger.clone(),
        SessionSettings::default(),
    ));
    (sessions, remote, logger)
}

#[tokio::test]
async fn login_sets_session_from_cookies() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    let (sessions, _, _) = stack(&server);
    let tenant = TenantKey::new("acme", "admin");

    assert!(sessions.login(&tenant, &creds()).await);
    assert!(sessions.session(&tenant).unwrap().last_login_at().is_some());
}

#[tokio::test]
async fn login_without_session_cookie_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "XSRF-TOKEN=csrf123; Path=/"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<form>bad password</form>"))
        .mount(&server)
        .await;
    let (sessions, _, _) = stack(&server);
    let tenant = TenantKey::new("acme", "admin");

    assert!(!sessions.login(&tenant, &creds()).await);
    let state = sessions.session(&tenant).unwrap().state();
    assert!(!state.login_in_flight);
    assert_eq!(state.last_login_ok, Some(false));
}

#[tokio::test]
async fn login_page_error_fails_without_posting() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let (sessions, _, _) = stack(&server);

    assert!(!sessions.login(&TenantKey::new("acme", "admin"), &creds()).await);
}

#[tokio::test]
async fn paginated_fetch_sends_token_and_walks_pages() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    let page = |ids: Vec<u32>| {
        json!({
            "data": { "tasks": {
                "data": ids.into_iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
                "paginatorInfo": { "total": 3 }
            }}
        })
    };
    Mock::given(method("POST"))
        .and(path("/api/graphql"))
        .and(header("x-csrf-token", "csrf123"))
        .and(header("accept", "application/json"))
        .and(header("origin", server.uri().as_str()))
        .and(body_partial_json(json!({
            "operationName": "tasks",
            "query": "query tasks { tasks(first: 2, page: 1) { id } }",
            "variables": {}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![1, 2])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/graphql"))
        .and(body_partial_json(json!({ "query": "query tasks { tasks(first: 2, page: 2) { id } }" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![3])))
        .expect(1)
        .mount(&server)
        .await;

    let (sessions, remote, logger) = stack(&server);
    let tenant = TenantKey::new("acme", "admin");
    assert!(sessions.login(&tenant, &creds()).await);

    let mut templates = QueryTemplates::new();
    templates.insert("tasks", "query tasks { tasks(first: TEMPLATE_PAGE_SIZE, page: TEMPLATE_PAGE_NUM) { id } }");
    let engine = PaginatedFetchEngine::new(sessions.clone(), remote, Arc::new(templates), logger);

    let out = engine
        .fetch(&tenant, &FetchRequest::new("tasks", 2).unwrap(), None)
        .await
        .unwrap();

    let FetchOutput::Records(records) = out else {
        panic!("expected records");
    };
    let ids: Vec<_> = records.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(records.iter().all(|r| r["__response_timestamp"].is_f64()));
}

#[tokio::test]
async fn server_errors_are_retried_until_budget_is_spent() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/graphql"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let (sessions, remote, logger) = stack(&server);
    let tenant = TenantKey::new("acme", "admin");
    assert!(sessions.login(&tenant, &creds()).await);

    let mut templates = QueryTemplates::new();
    templates.insert("tasks", "query tasks { tasks(page: TEMPLATE_PAGE_NUM) { id } }");
    let engine = PaginatedFetchEngine::new(sessions, remote, Arc::new(templates), logger).with_policy(RetryPolicy {
        attempts: 2,
        initial_timeout: std::time::Duration::from_millis(10),
        multiplier: 2.0,
    });

    let err = engine
        .fetch(&tenant, &FetchRequest::new("tasks", 10).unwrap(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("2 attempts"), "got: {err}");
}

#[tokio::test]
async fn logout_releases_the_session() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let (sessions, _, _) = stack(&server);
    let tenant = TenantKey::new("acme", "admin");
    assert!(sessions.login(&tenant, &creds()).await);

    assert!(sessions.logout(&tenant).await);
    assert!(sessions.session(&tenant).is_none());
}
