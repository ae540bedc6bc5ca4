use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use mockito::{Matcher, Server};
use serde_json::{json, Map, Value};

use super::*;
use crate::engine::storage::InMemoryStore;
use crate::models::{AuthType, CircuitState, Credentials};

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        backoff_base_ms: 1,
        ..ExecutorConfig::default()
    }
}

fn action(integration: &Integration, method: &str, path: &str, body: &str, retry_count: i32) -> ActionDefinition {
    ActionDefinition {
        id: 1,
        tenant_id: integration.tenant_id,
        integration_id: integration.id,
        name: "Disable user".to_string(),
        method: method.to_string(),
        path_template: path.to_string(),
        body_template: body.to_string(),
        retry_count,
    }
}

fn context() -> Map<String, Value> {
    match json!({"UserEmail": "jdoe@corp.test", "IssueID": "999"}) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn setup(base_url: &str, auth_type: AuthType, credentials: Credentials) -> (Arc<InMemoryStore>, Integration, HttpActionExecutor) {
    let store = Arc::new(InMemoryStore::new());
    let mut integration = Integration::new(0, 1, "Okta", ProtocolKind::Rest, base_url);
    integration.auth_type = auth_type;
    integration.credentials = credentials;
    let integration = store.upsert_integration(integration).await.unwrap();
    let executor = HttpActionExecutor::new(store.clone(), fast_config()).unwrap();
    (store, integration, executor)
}

#[test]
fn backoff_doubles_from_the_base() {
    let base = Duration::from_secs(1);
    assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
    assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
    assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
}

#[test]
fn status_codes_surface_through_exhausted() {
    let err = ActionError::Exhausted {
        attempts: 3,
        last: Box::new(ActionError::Http {
            status: 503,
            body: "busy".to_string(),
        }),
    };
    assert_eq!(err.status_code(), Some(503));
    assert_eq!(err.response_body(), Some("busy"));
    assert!(!err.is_retryable());
    assert!(!ActionError::Http { status: 401, body: String::new() }.is_retryable());
    assert!(ActionError::Http { status: 500, body: String::new() }.is_retryable());
    assert!(!ActionError::Template("bad".to_string()).is_retryable());
}

#[test]
fn pretty_body_formats_json_only() {
    let json_body = ActionResponse {
        status_code: Some(200),
        body: r#"{"ok":true}"#.to_string(),
    };
    assert_eq!(json_body.pretty_body(), "{\n  \"ok\": true\n}");

    let text = ActionResponse {
        status_code: None,
        body: "done".to_string(),
    };
    assert_eq!(text.pretty_body(), "done");
}

#[tokio::test]
async fn rest_action_renders_and_sends() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/users/jdoe@corp.test/suspend")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"issue": "999"})))
        .with_status(200)
        .with_body(r#"{"status":"suspended"}"#)
        .expect(1)
        .create_async()
        .await;

    let (store, integration, executor) = setup(&server.url(), AuthType::None, Credentials::new()).await;
    let action = action(&integration, "post", "/users/{{ UserEmail }}/suspend", r#"{"issue": "{{ IssueID }}"}"#, 3);

    let response = executor.execute(&integration, &action, &context()).await.unwrap();
    assert_eq!(response.status_code, Some(200));
    assert_eq!(response.body, r#"{"status":"suspended"}"#);
    mock.assert_async().await;

    let state = store.circuit_state(integration.id).await.unwrap();
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn server_errors_are_retried_then_counted_once() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/reset")
        .with_status(500)
        .with_body("boom")
        .expect(3)
        .create_async()
        .await;

    let (store, integration, executor) = setup(&server.url(), AuthType::None, Credentials::new()).await;
    let action = action(&integration, "POST", "/reset", "{}", 2);

    let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
    match &err {
        ActionError::Exhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.status_code(), Some(500));
    assert_eq!(err.response_body(), Some("boom"));
    mock.assert_async().await;

    let state = store.circuit_state(integration.id).await.unwrap();
    assert_eq!(state.consecutive_failures, 1);
    assert!(state.is_available);
}

#[tokio::test]
async fn auth_failures_stop_retrying() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/reset")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let (store, integration, executor) = setup(
        &server.url(),
        AuthType::Bearer,
        Credentials::new().with("token", "expired"),
    )
    .await;
    let action = action(&integration, "POST", "/reset", "", 3);

    let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(401));
    mock.assert_async().await;

    let state = store.circuit_state(integration.id).await.unwrap();
    assert_eq!(state.consecutive_failures, 1);
}

#[tokio::test]
async fn template_errors_skip_io_and_breaker() {
    let mut server = Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let (store, integration, executor) = setup(&server.url(), AuthType::None, Credentials::new()).await;
    let action = action(&integration, "POST", "/x", "{{ unclosed ", 3);

    let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
    assert!(matches!(err, ActionError::Template(_)));
    mock.assert_async().await;

    let state = store.circuit_state(integration.id).await.unwrap();
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn missing_credentials_are_named() {
    let mut server = Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let (_store, integration, executor) = setup(
        &server.url(),
        AuthType::Basic,
        Credentials::new().with("username", "svc"),
    )
    .await;
    let action = action(&integration, "POST", "/x", "", 3);

    let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
    match err {
        ActionError::MissingCredential(missing) => assert_eq!(missing.key, "password"),
        other => panic!("unexpected error: {other}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn open_circuit_fails_without_io() {
    let mut server = Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let (store, integration, executor) = setup(&server.url(), AuthType::None, Credentials::new()).await;
    for _ in 0..5 {
        store.record_circuit_failure(integration.id, 5).await.unwrap();
    }
    let action = action(&integration, "POST", "/x", "", 3);

    let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
    assert!(matches!(err, ActionError::CircuitOpen { .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn default_backoff_waits_one_then_two_seconds() {
    let hits = Arc::new(StdMutex::new(Vec::<Instant>::new()));
    let recorded = hits.clone();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/reset")
        .with_status(500)
        .with_body_from_request(move |_| {
            recorded.lock().unwrap().push(Instant::now());
            b"busy".to_vec()
        })
        .expect(3)
        .create_async()
        .await;

    let store = Arc::new(InMemoryStore::new());
    let integration = store
        .upsert_integration(Integration::new(0, 1, "Okta", ProtocolKind::Rest, server.url()))
        .await
        .unwrap();
    let executor = HttpActionExecutor::new(store.clone(), ExecutorConfig::default()).unwrap();
    let action = action(&integration, "POST", "/reset", "", 2);

    let started = Instant::now();
    let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
    assert!(matches!(err, ActionError::Exhausted { attempts: 3, .. }));
    assert!(started.elapsed() >= Duration::from_secs(3));
    mock.assert_async().await;

    let hits = hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 3);
    assert!(hits[1] - hits[0] >= Duration::from_secs(1));
    assert!(hits[2] - hits[1] >= Duration::from_secs(2));
}

#[tokio::test]
async fn breaker_trips_blocks_and_recovers_through_execute() {
    let mut server = Server::new_async().await;
    let (store, integration, executor) = setup(&server.url(), AuthType::None, Credentials::new()).await;
    // retry_count 1: two requests per execution
    let failing_a = action(&integration, "POST", "/fail-a", "", 1);
    let failing_b = action(&integration, "POST", "/fail-b", "", 1);
    let blocked = action(&integration, "POST", "/blocked", "", 1);
    let healthy = action(&integration, "POST", "/ok", "", 1);

    // Failures below the threshold are cleared by one success
    let fail_a = server
        .mock("POST", "/fail-a")
        .with_status(500)
        .expect(8)
        .create_async()
        .await;
    for _ in 0..4 {
        executor.execute(&integration, &failing_a, &context()).await.unwrap_err();
    }
    fail_a.assert_async().await;
    assert_eq!(
        store.circuit_state(integration.id).await.unwrap(),
        CircuitState {
            consecutive_failures: 4,
            is_available: true
        }
    );

    let ok = server
        .mock("POST", "/ok")
        .with_status(200)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;
    executor.execute(&integration, &healthy, &context()).await.unwrap();
    assert_eq!(store.circuit_state(integration.id).await.unwrap(), CircuitState::default());

    // Five exhausted executions in a row open the circuit
    let fail_b = server
        .mock("POST", "/fail-b")
        .with_status(503)
        .expect(10)
        .create_async()
        .await;
    for n in 1..=5 {
        executor.execute(&integration, &failing_b, &context()).await.unwrap_err();
        let state = store.circuit_state(integration.id).await.unwrap();
        assert_eq!(state.consecutive_failures, n);
        assert_eq!(state.is_available, n < 5);
    }
    fail_b.assert_async().await;

    // The sixth execution fails fast without any request
    let no_io = server
        .mock("POST", "/blocked")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;
    let err = executor.execute(&integration, &blocked, &context()).await.unwrap_err();
    assert!(matches!(err, ActionError::CircuitOpen { .. }));
    no_io.assert_async().await;
    assert_eq!(store.circuit_state(integration.id).await.unwrap().consecutive_failures, 5);

    // A manual reset lets the next success through
    store.reset_circuit(integration.id).await.unwrap();
    executor.execute(&integration, &healthy, &context()).await.unwrap();
    ok.assert_async().await;
    assert_eq!(store.circuit_state(integration.id).await.unwrap(), CircuitState::default());
}

#[tokio::test]
async fn api_key_uses_default_header() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/sessions")
        .match_header("x-api-key", "k-123")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let (_store, integration, executor) = setup(
        &server.url(),
        AuthType::ApiKey,
        Credentials::new().with("api_key", "k-123"),
    )
    .await;
    let action = action(&integration, "DELETE", "/sessions", "", 0);

    let response = executor.execute(&integration, &action, &context()).await.unwrap();
    assert_eq!(response.status_code, Some(204));
    mock.assert_async().await;
}

#[tokio::test]
async fn oauth_token_is_fetched_once_and_persisted() {
    let mut server = Server::new_async().await;
    let token_mock = server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
            Matcher::UrlEncoded("client_id".into(), "cid".into()),
            Matcher::UrlEncoded("client_secret".into(), "csecret".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"tok-1","expires_in":3600,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let action_mock = server
        .mock("POST", "/users/disable")
        .match_header("authorization", "Bearer tok-1")
        .with_status(200)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;

    let store = Arc::new(InMemoryStore::new());
    let mut integration = Integration::new(0, 1, "Graph", ProtocolKind::Rest, server.url());
    integration.auth_type = AuthType::OAuth2;
    integration.token_endpoint = Some(format!("{}/oauth/token", server.url()));
    integration.credentials = Credentials::new()
        .with("client_id", "cid")
        .with("client_secret", "csecret");
    let integration = store.upsert_integration(integration).await.unwrap();
    let executor = HttpActionExecutor::new(store.clone(), fast_config()).unwrap();
    let action = action(&integration, "POST", "/users/disable", "{}", 0);

    executor.execute(&integration, &action, &context()).await.unwrap();
    executor.execute(&integration, &action, &context()).await.unwrap();

    token_mock.assert_async().await;
    action_mock.assert_async().await;

    let saved = store.get_integration(1, integration.id).await.unwrap().unwrap();
    assert_eq!(saved.oauth_token.as_deref(), Some("tok-1"));
    assert!(saved.oauth_token_expires_at.is_some());
}
