mod common;

use anyhow::Result;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use drive_photo_search::caption::FALLBACK_CAPTION;
use drive_photo_search::config::{DatabaseOptions, DriveOptions, LoadOptions};
use drive_photo_search::registry::ServiceRegistry;
use drive_photo_search::server::{AppState, create_app};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{header as header_eq, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::FakeLoader;

fn app(registry: Arc<ServiceRegistry>) -> Router {
    create_app(AppState::new(registry))
}

async fn send(app: &Router, req: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(req).await?;
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body)? };
    Ok((status, value))
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn unreachable_database() -> DatabaseOptions {
    DatabaseOptions {
        database_url: Some("postgres://postgres@127.0.0.1:1/photos".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn health_turns_ready_after_load() -> Result<()> {
    let registry = common::registry(FakeLoader::default());
    let app = app(registry.clone());

    let (status, body) = send(&app, get("/health")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ready"], false);
    assert_eq!(body["state"], "uninitialized");

    let (status, body) = send(&app, post_json("/trigger_load", json!({}))).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "loading_started");

    registry.wait_for_load().await;

    let (_, body) = send(&app, get("/health")).await?;
    assert_eq!(body["ready"], true);
    assert_eq!(body["state"], "ready");
    Ok(())
}

#[tokio::test]
async fn trigger_load_when_loading_is_still_accepted() -> Result<()> {
    let registry = common::registry(FakeLoader::slow(std::time::Duration::from_millis(200)));
    let app = app(registry.clone());

    let (first, _) = send(&app, get("/trigger_load")).await?;
    let (second, body) = send(&app, get("/trigger_load")).await?;
    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "loading_started");

    registry.wait_for_load().await;
    Ok(())
}

#[tokio::test]
async fn trigger_load_disabled_by_env() -> Result<()> {
    let app = app(common::disabled_registry());
    let (status, body) = send(&app, post_json("/trigger_load", json!({}))).await?;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["status"], "skipped_by_env");

    let (_, body) = send(&app, get("/health")).await?;
    assert_eq!(body["ready"], false);
    Ok(())
}

#[tokio::test]
async fn fetch_drive_requires_link() -> Result<()> {
    let app = app(common::registry(FakeLoader::default()));

    let (status, body) = send(&app, post_json("/api/fetch-drive", json!({}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Drive link is required");

    let (status, _) = send(&app, post_json("/api/fetch-drive", json!({"driveLink": ""}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn fetch_drive_without_credentials_is_unavailable() -> Result<()> {
    let app = app(common::registry(FakeLoader::default()));
    let link = "https://drive.google.com/drive/folders/abc123";
    let (status, body) = send(&app, post_json("/api/fetch-drive", json!({"driveLink": link}))).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());
    Ok(())
}

#[tokio::test]
async fn fetch_drive_lists_folder() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .and(header_eq("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                {"id": "f1", "name": "beach.jpg"},
                {"id": "f2", "name": "forest.png"},
            ]
        })))
        .mount(&server)
        .await;

    let registry = common::builder(FakeLoader::default())
        .drive_options(DriveOptions {
            drive_access_token: Some("test-token".to_string()),
            drive_api_url: server.uri(),
            ..Default::default()
        })
        .build();
    let app = app(registry);

    let link = "https://drive.google.com/drive/folders/abc123";
    let (status, body) = send(&app, post_json("/api/fetch-drive", json!({"driveLink": link}))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["images"][0]["fileName"], "beach.jpg");
    assert_eq!(body["images"][0]["driveLink"], "https://drive.google.com/file/d/f1/view");
    assert_eq!(body["images"][1]["directLink"], "https://drive.google.com/uc?export=view&id=f2");

    let (status, body) =
        send(&app, post_json("/api/fetch-drive", json!({"driveLink": "not a folder"}))).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Invalid Google Drive folder link");
    Ok(())
}

#[tokio::test]
async fn caption_requires_images() -> Result<()> {
    let app = app(common::ready_registry().await);
    let (status, body) = send(&app, post_json("/api/caption", json!({"images": []}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No images provided");
    Ok(())
}

#[tokio::test]
async fn caption_before_ready_triggers_load() -> Result<()> {
    let registry = common::registry(FakeLoader::default());
    let app = app(registry.clone());
    let images = json!({"images": [{
        "fileName": "a.jpg",
        "driveLink": "https://drive.google.com/file/d/a/view",
        "directLink": "http://127.0.0.1:1/a.jpg",
    }]});

    let (status, body) = send(&app, post_json("/api/caption", images)).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "model_not_ready");
    assert_eq!(body["captions"], json!([]));
    assert_eq!(body["count"], 0);

    registry.wait_for_load().await;
    assert!(registry.is_ready().await);
    Ok(())
}

#[tokio::test]
async fn caption_keeps_order_and_falls_back_per_image() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(common::png_bytes()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not an image".to_vec()))
        .mount(&server)
        .await;

    let app = app(common::ready_registry().await);
    let image = |name: &str| {
        json!({
            "fileName": name,
            "driveLink": format!("https://drive.google.com/file/d/{name}/view"),
            "directLink": format!("{}/{}", server.uri(), name),
        })
    };
    let request = json!({"images": [image("ok.png"), image("missing.png"), image("broken.png"), image("ok.png")]});

    let (status, body) = send(&app, post_json("/api/caption", request)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 4);
    let captions = body["captions"].as_array().unwrap();
    assert_eq!(captions[0]["caption"], "4x3 image");
    assert_eq!(captions[1]["caption"], FALLBACK_CAPTION);
    assert_eq!(captions[2]["caption"], FALLBACK_CAPTION);
    assert_eq!(captions[3]["caption"], "4x3 image");
    assert_eq!(captions[1]["fileName"], "missing.png");
    assert_eq!(captions[1]["driveLink"], "https://drive.google.com/file/d/missing.png/view");
    Ok(())
}

#[tokio::test]
async fn store_requires_photos() -> Result<()> {
    let app = app(common::ready_registry().await);
    let (status, body) = send(&app, post_json("/api/store", json!({"photos": []}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No photos provided");

    let (status, _) = send(&app, post_json("/api/store", json!({}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn store_reports_malformed_photos() -> Result<()> {
    let app = app(common::ready_registry().await);
    let photos = json!({"photos": [{"driveLink": "https://drive.google.com/file/d/x/view", "caption": "a cat"}]});
    let (status, body) = send(&app, post_json("/api/store", photos)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("fileName"), "{error}");
    assert_ne!(error, "No photos provided");
    Ok(())
}

#[tokio::test]
async fn store_without_database_is_unavailable() -> Result<()> {
    let app = app(common::ready_registry().await);
    let photos = json!({"photos": [common::photo("https://drive.google.com/file/d/x/view", "a cat")]});
    let (status, body) = send(&app, post_json("/api/store", photos)).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "database service not ready");
    Ok(())
}

#[tokio::test]
async fn store_with_loading_disabled_is_unavailable() -> Result<()> {
    let registry = common::builder(FakeLoader::default())
        .load_options(LoadOptions { skip_model_load: true, ..Default::default() })
        .database_options(unreachable_database())
        .build();
    let app = app(registry);
    let photos = json!({"photos": [common::photo("https://drive.google.com/file/d/x/view", "a cat")]});
    let (status, body) = send(&app, post_json("/api/store", photos)).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "embedding model not ready");
    Ok(())
}

#[tokio::test]
async fn store_reports_database_failure() -> Result<()> {
    let registry = common::builder(FakeLoader::default())
        .database_options(unreachable_database())
        .build();
    let app = app(registry.clone());
    let photos = json!({"photos": [common::photo("https://drive.google.com/file/d/x/view", "a cat")]});

    // 写入路径会等待模型加载完成
    let (status, body) = send(&app, post_json("/api/store", photos)).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
    assert!(registry.embedder().await.is_some());
    Ok(())
}

#[tokio::test]
async fn search_requires_query() -> Result<()> {
    let app = app(common::ready_registry().await);

    let (status, body) = send(&app, get("/api/search")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Query parameter is required");

    let (status, _) = send(&app, get("/api/search?query=")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/api/search?query=cat&limit=0")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get("/api/search?query=cat&limit=1001")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "limit must be between 1 and 1000");

    let (status, _) = send(&app, get("/api/search?query=cat&limit=18446744073709551616")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get("/api/search?query=cat&limit=abc")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    Ok(())
}

#[tokio::test]
async fn search_before_ready_is_accepted() -> Result<()> {
    let registry = common::builder(FakeLoader::default())
        .database_options(unreachable_database())
        .build();
    let app = app(registry.clone());

    let (status, body) = send(&app, get("/api/search?query=sunset%20at%20the%20beach")).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "model_not_ready");
    assert_eq!(body["results"], json!([]));
    assert_eq!(body["count"], 0);

    registry.wait_for_load().await;
    assert!(registry.is_ready().await);
    Ok(())
}

#[tokio::test]
async fn search_without_database_is_accepted() -> Result<()> {
    let app = app(common::ready_registry().await);
    let (status, body) = send(&app, get("/api/search?query=cat")).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "model_not_ready");
    Ok(())
}

#[tokio::test]
async fn openapi_document_lists_endpoints() -> Result<()> {
    let app = app(common::registry(FakeLoader::default()));
    let (status, body) = send(&app, get("/api-docs/openapi.json")).await?;
    assert_eq!(status, StatusCode::OK);
    for endpoint in ["/health", "/trigger_load", "/api/fetch-drive", "/api/caption", "/api/store", "/api/search"] {
        assert!(body["paths"].get(endpoint).is_some(), "missing {endpoint}");
    }
    Ok(())
}
