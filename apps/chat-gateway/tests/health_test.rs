mod common;

use axum::body::Body;
use axum_test::TestServer;
use http::{Request, StatusCode};
use tower::ServiceExt;

#[tokio::test]
async fn health_reports_open_connections() {
    let env = common::test_env();
    let server = TestServer::new(common::test_app(&env)).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body = resp.json::<serde_json::Value>();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);

    let _permit = env.supervisor().try_admit().unwrap();
    let body = server.get("/health").await.json::<serde_json::Value>();
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn plain_http_on_the_chat_route_uses_no_connection_slot() {
    let mut config = common::test_config();
    config.max_connections = Some(1);
    let env = common::test_env_with(config);
    let app = common::test_app(&env);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/ws/chat/7?token=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(resp.status().is_client_error());
    assert_ne!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(env.supervisor().active(), 0);
}
