use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use kernel_gateway::app::GatewayApp;
use kernel_gateway::config::Settings;
use tower::ServiceExt;

async fn build(args: &[&str]) -> axum::Router {
    let settings = Settings::parse_from(std::iter::once("kernel-gateway").chain(args.iter().copied()));
    GatewayApp::build(settings).await.expect("app builds with no kernel specs installed").router
}

#[tokio::test]
async fn api_version_is_served_without_auth() {
    let app = build(&[]).await;
    let response = app
        .oneshot(Request::builder().uri("/api").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(value["version"].is_string());
}

#[tokio::test]
async fn kernelspecs_listing_is_well_formed() {
    let app = build(&[]).await;
    let response = app
        .oneshot(Request::builder().uri("/api/kernelspecs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(value["kernelspecs"].is_object());
}

#[tokio::test]
async fn listing_kernels_is_forbidden_by_default() {
    let app = build(&[]).await;
    let response = app
        .oneshot(Request::builder().uri("/api/kernels").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["reason"], "Forbidden");
}

#[tokio::test]
async fn listing_kernels_succeeds_when_enabled() {
    let app = build(&["--list-kernels"]).await;
    let response = app
        .oneshot(Request::builder().uri("/api/kernels").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn creating_a_kernel_with_no_specs_installed_fails_cleanly() {
    let app = build(&[]).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/kernels")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["reason"], "NoSuchKernel");
}

#[tokio::test]
async fn unauthenticated_request_is_rejected_when_a_token_is_configured() {
    let app = build(&["--auth-token", "secret"]).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api")
                .header("Authorization", "token secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn swagger_document_is_valid_json() {
    let app = build(&[]).await;
    let response = app
        .oneshot(Request::builder().uri("/api/swagger.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["swagger"], "2.0");
}

#[tokio::test]
async fn unknown_route_is_a_404() {
    let app = build(&[]).await;
    let response = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
