// Integration tests for `PortalClient` using wiremock.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{bearer_token, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use carelink_api::{Error, PortalClient, StaticToken};

// ── Helpers ─────────────────────────────────────────────────────────

const TOKEN: &str = "test-bearer-token";

async fn setup() -> (MockServer, PortalClient) {
    let server = MockServer::start().await;
    let base = server.uri().parse().expect("mock server uri");
    let client = PortalClient::from_reqwest(
        base,
        reqwest::Client::new(),
        Arc::new(StaticToken::new(TOKEN)),
    );
    (server, client)
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_unread_count() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/notifications/unread-count"))
        .and(bearer_token(TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 7 })))
        .mount(&server)
        .await;

    let count = client.unread_count().await.expect("count");
    assert_eq!(count, 7);
}

#[tokio::test]
async fn test_list_notifications_pagination() {
    let (server, client) = setup().await;

    let body = json!({
        "data": [
            {
                "id": 1,
                "title": "Lab results ready",
                "body": "Your CBC panel is available",
                "severity": "info",
                "createdAt": "2026-08-01T09:30:00Z",
                "read": false
            },
            {
                "id": 2,
                "title": "Prescription renewed",
                "severity": "info",
                "read": true
            },
        ],
        "total": 12,
        "page": 0,
        "perPage": 2
    });

    Mock::given(method("GET"))
        .and(path("/api/notifications"))
        .and(query_param("page", "0"))
        .and(query_param("perPage", "2"))
        .and(bearer_token(TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .mount(&server)
        .await;

    let page = client.list_notifications(0, 2).await.expect("page");

    assert_eq!(page.total, 12);
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[0].title, "Lab results ready");
    assert!(!page.data[0].read);
    assert_eq!(page.data[1].id, 2);
    assert!(page.data[1].read);
}

#[tokio::test]
async fn test_mark_read() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/notifications/42/read"))
        .and(bearer_token(TOKEN))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client.mark_read(42).await.expect("mark read");
}

#[tokio::test]
async fn test_mark_all_read() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/notifications/read-all"))
        .and(bearer_token(TOKEN))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client.mark_all_read().await.expect("mark all read");
}

// ── Failure tests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_unauthorized_maps_to_auth_error() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/notifications/unread-count"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client.unread_count().await.expect_err("should fail");
    assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
    assert!(err.is_auth_expired());
}

#[tokio::test]
async fn test_server_error_carries_status_and_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/notifications/read-all"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .mount(&server)
        .await;

    let err = client.mark_all_read().await.expect_err("should fail");
    match err {
        Error::Api { status, ref message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database unavailable");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn test_malformed_body_is_a_deserialization_error() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/notifications/unread-count"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let err = client.unread_count().await.expect_err("should fail");
    match err {
        Error::Deserialization { ref body, .. } => {
            assert!(body.contains("not json"));
        }
        other => panic!("expected Deserialization error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_token_never_hits_network() {
    struct NoToken;
    impl carelink_api::TokenProvider for NoToken {
        fn token(&self) -> Option<secrecy::SecretString> {
            None
        }
    }

    let server = MockServer::start().await;
    let base = server.uri().parse().expect("mock server uri");
    let client = PortalClient::from_reqwest(base, reqwest::Client::new(), Arc::new(NoToken));

    // No mocks mounted: any request reaching the server would 404 into
    // an Api error instead of the expected MissingCredential.
    let err = client.unread_count().await.expect_err("should fail");
    assert!(matches!(err, Error::MissingCredential), "got {err:?}");
}
