//! HTTP surface for the pack engine
//!
//! JSON endpoints for cache status, card listings, pack opening and refills.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::engine::{EngineStatus, PackEngine};
use crate::error::CacheError;
use crate::models::{CardSummary, PackSpec};
use crate::pipeline::AcquisitionReport;

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<PackEngine>,
}

/// API response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
}

fn fail<T>(status: StatusCode, message: String) -> ApiResult<T> {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
}

fn error_status(error: &CacheError) -> StatusCode {
    match error {
        CacheError::CardNotFound(_) => StatusCode::NOT_FOUND,
        CacheError::InvalidPackSpec(_) | CacheError::Parse(_) => StatusCode::BAD_REQUEST,
        CacheError::NothingAcquired { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn from_error<T>(context: &str, error: CacheError) -> ApiResult<T> {
    let status = error_status(&error);
    if status.is_server_error() {
        log::error!("{}: {}", context, error);
    } else {
        log::warn!("{}: {}", context, error);
    }
    fail(status, error.to_string())
}

/// Opened pack without image payloads
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PackResponse {
    cards: Vec<CardSummary>,
    requested: usize,
    short: bool,
}

/// Refill outcome; `report` is absent when another refill was running
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefillResponse {
    started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<AcquisitionReport>,
}

/// GET /api/status
async fn status_handler(State(state): State<AppState>) -> ApiResult<EngineStatus> {
    match state.engine.status().await {
        Ok(status) => ok(status),
        Err(e) => from_error("Status error", e),
    }
}

/// GET /api/cards
async fn cards_handler(State(state): State<AppState>) -> ApiResult<Vec<CardSummary>> {
    ok(state.engine.cards().iter().map(|c| c.summary()).collect())
}

/// GET /api/cards/{id}/image
async fn card_image_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.card(&id) {
        Ok(card) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "public, max-age=86400"),
            ],
            Body::from(card.compressed_payload),
        )
            .into_response(),
        Err(e) => {
            log::debug!("No image for {}: {}", id, e);
            (StatusCode::NOT_FOUND, format!("Image not found: {}", e)).into_response()
        }
    }
}

/// DELETE /api/cards/{id}
async fn dismiss_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<bool> {
    match state.engine.dismiss(&id).await {
        Ok(true) => ok(true),
        Ok(false) => from_error("Dismiss", CacheError::CardNotFound(id)),
        Err(e) => from_error("Dismiss error", e),
    }
}

/// POST /api/packs - body is an optional PackSpec
async fn open_pack_handler(State(state): State<AppState>, body: Bytes) -> ApiResult<PackResponse> {
    let spec = if body.iter().all(|b| b.is_ascii_whitespace()) {
        PackSpec::with_size(state.engine.config().pack_size)
    } else {
        match serde_json::from_slice::<PackSpec>(&body) {
            Ok(spec) => spec,
            Err(e) => return from_error("Pack request", e.into()),
        }
    };

    match state.engine.open_pack(&spec).await {
        Ok(pack) => {
            let short = pack.is_short();
            ok(PackResponse {
                cards: pack.cards.iter().map(|c| c.summary()).collect(),
                requested: pack.requested,
                short,
            })
        }
        Err(e) => from_error("Pack error", e),
    }
}

/// POST /api/refill
async fn refill_handler(State(state): State<AppState>) -> ApiResult<RefillResponse> {
    match state.engine.refill().await {
        Ok(report) => ok(RefillResponse {
            started: report.is_some(),
            report,
        }),
        Err(e) => from_error("Refill error", e),
    }
}

/// DELETE /api/cache
async fn clear_handler(State(state): State<AppState>) -> ApiResult<()> {
    match state.engine.clear().await {
        Ok(()) => ok(()),
        Err(e) => from_error("Clear error", e),
    }
}

/// Build the web server router
pub fn create_router(engine: Arc<PackEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/cards", get(cards_handler))
        .route("/api/cards/{id}", delete(dismiss_handler))
        .route("/api/cards/{id}/image", get(card_image_handler))
        .route("/api/packs", post(open_pack_handler))
        .route("/api/refill", post(refill_handler))
        .route("/api/cache", delete(clear_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web server, bound to all interfaces
pub async fn serve(engine: Arc<PackEngine>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(engine);
    let addr = format!("0.0.0.0:{}", port);

    log::info!("Pack API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CacheBridge;
    use crate::catalog::{LabelClassifier, ManifestCatalog};
    use crate::config::EngineConfig;
    use crate::database::RecordStore;
    use crate::images::ImageFetcher;
    use crate::models::{make_test_record, Rarity};
    use crate::storage::TierStorage;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn engine_with_cards(n: usize) -> Arc<PackEngine> {
        let bridge = CacheBridge::new(
            RecordStore::open_in_memory().unwrap(),
            Arc::new(TierStorage::in_memory()),
        );
        let records = (0..n)
            .map(|i| make_test_record(&format!("c-{}", i), Rarity::Common))
            .collect();
        bridge.add_cards(records).await.unwrap();
        Arc::new(PackEngine::new(
            bridge,
            Arc::new(ManifestCatalog::default()),
            Arc::new(LabelClassifier),
            ImageFetcher::new(Duration::from_secs(1)).unwrap(),
            EngineConfig::default(),
        ))
    }

    async fn send(app: Router, method: &str, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn json(bytes: &[u8]) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = create_router(engine_with_cards(3).await);
        let (status, body) = send(app, "GET", "/api/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);

        let body = json(&body);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["mirrorCount"], 3);
        assert_eq!(body["data"]["activeTier"], "memory");
    }

    #[tokio::test]
    async fn test_cards_listing_omits_payload() {
        let app = create_router(engine_with_cards(2).await);
        let (_, body) = send(app, "GET", "/api/cards", Body::empty()).await;
        let body = json(&body);
        let cards = body["data"].as_array().unwrap();
        assert_eq!(cards.len(), 2);
        assert!(cards[0].get("compressedPayload").is_none());
        assert_eq!(cards[0]["payloadBytes"], 4);
    }

    #[tokio::test]
    async fn test_card_image_endpoint() {
        let app = create_router(engine_with_cards(1).await);
        let (status, body) = send(app.clone(), "GET", "/api/cards/c-0/image", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..3], &[0xFF, 0xD8, 0xFF]);

        let (status, _) = send(app, "GET", "/api/cards/zz-1/image", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_open_pack_with_default_and_custom_spec() {
        let engine = engine_with_cards(30).await;
        let _held = engine.tracker().guard().try_acquire().unwrap();
        let app = create_router(Arc::clone(&engine));

        let (status, body) = send(app.clone(), "POST", "/api/packs", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["data"]["cards"].as_array().unwrap().len(), 8);
        assert_eq!(body["data"]["short"], false);

        let spec = r#"{"cardCount":3,"rarityWeights":{"common":1.0},"guaranteedRare":false}"#;
        let (status, body) = send(app, "POST", "/api/packs", Body::from(spec)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["data"]["cards"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_open_pack_rejects_invalid_spec() {
        let app = create_router(engine_with_cards(8).await);
        let spec = r#"{"cardCount":3,"rarityWeights":{"common":0.5}}"#;
        let (status, body) = send(app.clone(), "POST", "/api/packs", Body::from(spec)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["success"], false);

        let (status, _) = send(app.clone(), "POST", "/api/packs", Body::from("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let spec = format!(
            r#"{{"cardCount":{},"rarityWeights":{{"common":1.0}}}}"#,
            usize::MAX
        );
        let (status, _) = send(app, "POST", "/api/packs", Body::from(spec)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dismiss_endpoint() {
        let app = create_router(engine_with_cards(2).await);
        let (status, _) = send(app.clone(), "DELETE", "/api/cards/c-1", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(app, "DELETE", "/api/cards/c-1", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json(&body)["error"].as_str().unwrap().contains("c-1"));
    }

    #[tokio::test]
    async fn test_refill_while_in_flight() {
        let engine = engine_with_cards(0).await;
        let _held = engine.tracker().guard().try_acquire().unwrap();
        let app = create_router(engine);

        let (status, body) = send(app, "POST", "/api/refill", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["data"]["started"], false);
        assert!(body["data"].get("report").is_none());
    }

    #[tokio::test]
    async fn test_clear_endpoint() {
        let engine = engine_with_cards(4).await;
        let app = create_router(Arc::clone(&engine));
        let (status, _) = send(app, "DELETE", "/api/cache", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(engine.cards().is_empty());
    }

    #[test]
    fn test_api_response_error_serialization() {
        let response: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some("Test error".to_string()),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(!json.contains("\"data\""));
    }
}
