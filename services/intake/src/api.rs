use crate::config::ApiConfig;
use crate::intake::{IntakeError, ListTrashQuery, NewTrashSubmission, TrashService};
use crate::response::{codes, ApiResponse, ListTrashResponse, TrashResponse, UploadUrlResponse};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TrashService>,
}

/// Query parameters for the upload URL endpoint
#[derive(Debug, Deserialize, Validate)]
pub struct UploadUrlParams {
    #[validate(length(max = 64, message = "device_id must be at most 64 characters"))]
    pub device_id: Option<String>,
}

/// Body of a record submission. Fields are optional here so that a missing
/// field is reported as a validation failure rather than a parse failure.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateTrashRequest {
    #[validate(
        required(message = "device_id is required"),
        length(min = 1, max = 64, message = "device_id must be 1-64 characters")
    )]
    pub device_id: Option<String>,

    #[validate(
        required(message = "image_url is required"),
        url(message = "image_url must be a valid URL")
    )]
    pub image_url: Option<String>,

    #[validate(
        required(message = "latitude is required"),
        range(min = -90.0, max = 90.0, message = "latitude must be within [-90, 90]")
    )]
    pub latitude: Option<f64>,

    #[validate(
        required(message = "longitude is required"),
        range(min = -180.0, max = 180.0, message = "longitude must be within [-180, 180]")
    )]
    pub longitude: Option<f64>,
}

impl CreateTrashRequest {
    fn into_submission(self) -> Result<NewTrashSubmission, ApiError> {
        self.validate().map_err(ApiError::from)?;

        match (self.device_id, self.image_url, self.latitude, self.longitude) {
            (Some(device_id), Some(image_url), Some(latitude), Some(longitude)) => {
                Ok(NewTrashSubmission {
                    device_id,
                    image_url,
                    latitude,
                    longitude,
                })
            }
            _ => Err(ApiError::validation("missing required fields")),
        }
    }
}

/// Query parameters for the record list
#[derive(Debug, Deserialize, Validate)]
pub struct ListTrashParams {
    /// Filter by device ID
    pub device_id: Option<String>,
    /// Page size; 0 or absent uses the default
    #[validate(range(min = 0, max = 100, message = "limit must be within [0, 100]"))]
    pub limit: Option<i64>,
    #[validate(range(min = 0, message = "offset must not be negative"))]
    pub offset: Option<i64>,
}

impl From<ListTrashParams> for ListTrashQuery {
    fn from(params: ListTrashParams) -> Self {
        Self {
            device_id: params.device_id,
            limit: params.limit,
            offset: params.offset,
        }
    }
}

/// Error response in the API envelope
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::VALIDATION_ERROR, message)
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, message)
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => message.to_string(),
                    None => format!("{} is invalid", field),
                })
            })
            .collect();
        messages.sort();

        Self::validation(messages.join("; "))
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Validation(message) => Self::validation(message),
            IntakeError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, "Trash record not found")
            }
            IntakeError::StorageUnavailable(e) => {
                error!(error = %e, "Failed to generate upload URL");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::INTERNAL_ERROR,
                    "Failed to generate upload URL",
                )
            }
            IntakeError::Persistence(e) => {
                error!(error = %e, "Record store operation failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::INTERNAL_ERROR,
                    "Failed to access trash records",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::error(self.code, self.message))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/upload-url", get(get_upload_url))
        .route("/api/trash", get(list_trash).post(create_trash))
        .route("/api/trash/:id", get(get_trash))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn service_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Liveness
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Readiness: the database must answer; classifier state is informational
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let classifier = match state.service.classifier() {
        None => "not_configured",
        Some(classifier) => match classifier.health().await {
            Ok(true) => "healthy",
            Ok(false) => "unhealthy",
            Err(e) => {
                warn!(error = %e, "Classifier health check failed");
                "unreachable"
            }
        },
    };

    match state.service.ping_store().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected",
                "classifier": classifier
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "classifier": classifier,
                "error": e.to_string()
            })),
        ),
    }
}

/// Issue a presigned upload URL
#[instrument(skip(state, params))]
async fn get_upload_url(
    State(state): State<AppState>,
    params: std::result::Result<Query<UploadUrlParams>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<UploadUrlResponse>>> {
    let Query(params) = params.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    params.validate()?;

    let device_id = params
        .device_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                codes::MISSING_DEVICE_ID,
                "device_id is required",
            )
        })?;

    let grant = state.service.request_upload_grant(&device_id).await?;

    Ok(Json(ApiResponse::ok(grant.into())))
}

/// Create a record, classifying the image when a classifier is configured
#[instrument(skip(state, payload))]
async fn create_trash(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateTrashRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<TrashResponse>>)> {
    let Json(request) = payload.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    let submission = request.into_submission()?;

    let record = state.service.create_record(submission).await?;
    info!(record_id = %record.id, "Trash record accepted");

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(record))))
}

/// Get a single record
#[instrument(skip(state, id))]
async fn get_trash(
    State(state): State<AppState>,
    id: std::result::Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<ApiResponse<TrashResponse>>> {
    let Path(id) = id.map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_ID,
            "id must be a valid UUID",
        )
    })?;

    let record = state.service.get_record(id).await?;

    Ok(Json(ApiResponse::ok(record)))
}

/// List records newest first
#[instrument(skip(state, params))]
async fn list_trash(
    State(state): State<AppState>,
    params: std::result::Result<Query<ListTrashParams>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<ListTrashResponse>>> {
    let Query(params) = params.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    params.validate()?;

    let page = state.service.list_records(params.into()).await?;

    Ok(Json(ApiResponse::ok(page)))
}

/// Serve the router until `shutdown` resolves
pub async fn serve<F>(router: Router, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting intake API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassificationResult, Classifier, MockClassifier};
    use crate::object_storage::{MockObjectStorage, ObjectStorage, PresignedUpload, StorageError};
    use crate::record_store::memory::InMemoryTrashStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router_with(
        store: Arc<InMemoryTrashStore>,
        storage: MockObjectStorage,
        classifier: Option<MockClassifier>,
    ) -> Router {
        let storage: Arc<dyn ObjectStorage> = Arc::new(storage);
        let classifier = classifier.map(|c| Arc::new(c) as Arc<dyn Classifier>);
        let service = TrashService::new(store, storage, classifier);

        create_router(
            AppState {
                service: Arc::new(service),
            },
            &ApiConfig::default(),
        )
    }

    fn router(store: Arc<InMemoryTrashStore>) -> Router {
        router_with(store, MockObjectStorage::new(), None)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn valid_body() -> Value {
        json!({
            "device_id": "dev-1",
            "image_url": "https://pub.r2.dev/trash/dev-1/1700000000000.jpg",
            "latitude": 13.7563,
            "longitude": 100.5018
        })
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(Arc::new(InMemoryTrashStore::new()))
            .oneshot(get("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_service_info() {
        let response = router(Arc::new(InMemoryTrashStore::new()))
            .oneshot(get("/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["service"], "trash-intake");
    }

    #[tokio::test]
    async fn test_ready_reports_classifier_state() {
        let mut classifier = MockClassifier::new();
        classifier.expect_health().times(1).returning(|| Ok(false));

        let response = router_with(
            Arc::new(InMemoryTrashStore::new()),
            MockObjectStorage::new(),
            Some(classifier),
        )
        .oneshot(get("/ready"))
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["classifier"], "unhealthy");
    }

    #[tokio::test]
    async fn test_ready_fails_without_database() {
        let response = router(Arc::new(InMemoryTrashStore::failing()))
            .oneshot(get("/ready"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["database"], "disconnected");
        assert_eq!(body["classifier"], "not_configured");
    }

    #[tokio::test]
    async fn test_upload_url_requires_device_id() {
        for uri in ["/api/upload-url", "/api/upload-url?device_id="] {
            let response = router(Arc::new(InMemoryTrashStore::new()))
                .oneshot(get(uri))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], codes::MISSING_DEVICE_ID);
        }
    }

    #[tokio::test]
    async fn test_upload_url_issued() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_presign_upload()
            .withf(|key, _| key.starts_with("trash/dev-1/"))
            .times(1)
            .returning(|key, ttl| {
                Ok(PresignedUpload {
                    upload_url: format!("https://acc.r2.cloudflarestorage.com/bucket/{}?sig", key),
                    public_url: format!("https://pub.r2.dev/{}", key),
                    expires_in: ttl.as_secs() as i64,
                })
            });

        let response = router_with(Arc::new(InMemoryTrashStore::new()), storage, None)
            .oneshot(get("/api/upload-url?device_id=dev-1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["expires_in"], 900);
        let image_url = body["data"]["image_url"].as_str().unwrap();
        assert!(image_url.starts_with("https://pub.r2.dev/trash/dev-1/"));
        assert!(image_url.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_upload_url_storage_failure() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_presign_upload()
            .times(1)
            .returning(|_, _| Err(StorageError::Unavailable("connection refused".to_string())));

        let response = router_with(Arc::new(InMemoryTrashStore::new()), storage, None)
            .oneshot(get("/api/upload-url?device_id=dev-1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], codes::INTERNAL_ERROR);
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_create_trash_classified() {
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().times(1).returning(|_| {
            Ok(ClassificationResult {
                category: "glass".to_string(),
                sub_category: None,
                confidence: 0.77,
                bin_number: 3,
                bin_label: "Glass".to_string(),
                message: String::new(),
                l0_detected: false,
                l0_label: None,
                l0_confidence: None,
            })
        });

        let store = Arc::new(InMemoryTrashStore::new());
        let response = router_with(store.clone(), MockObjectStorage::new(), Some(classifier))
            .oneshot(post_json("/api/trash", valid_body().to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["category"], "glass");
        assert_eq!(body["data"]["bin_number"], 3);
        assert!(body["data"].get("message").is_none());
        assert!(body["data"].get("classified_at").is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_trash_validation_failures() {
        let mut missing_url = valid_body();
        missing_url.as_object_mut().unwrap().remove("image_url");

        let mut bad_url = valid_body();
        bad_url["image_url"] = json!("not a url");

        let mut bad_latitude = valid_body();
        bad_latitude["latitude"] = json!(91.0);

        let mut long_device = valid_body();
        long_device["device_id"] = json!("d".repeat(65));

        for body in [missing_url, bad_url, bad_latitude, long_device] {
            let store = Arc::new(InMemoryTrashStore::new());
            let response = router(store.clone())
                .oneshot(post_json("/api/trash", body.to_string()))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["error"], codes::VALIDATION_ERROR);
            assert_eq!(store.len(), 0);
        }
    }

    #[tokio::test]
    async fn test_create_trash_malformed_json() {
        let response = router(Arc::new(InMemoryTrashStore::new()))
            .oneshot(post_json("/api/trash", "{\"device_id\": ".to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_create_trash_persistence_failure() {
        let response = router(Arc::new(InMemoryTrashStore::failing()))
            .oneshot(post_json("/api/trash", valid_body().to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_get_trash_invalid_and_missing_id() {
        let store = Arc::new(InMemoryTrashStore::new());

        let response = router(store.clone())
            .oneshot(get("/api/trash/not-a-uuid"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], codes::INVALID_ID);

        let response = router(store)
            .oneshot(get(&format!("/api/trash/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_then_get_and_list() {
        let store = Arc::new(InMemoryTrashStore::new());
        let app = router(store);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(post_json("/api/trash", valid_body().to_string()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            let body = body_json(response).await;
            ids.push(body["data"]["id"].as_str().unwrap().to_string());
        }

        let response = app
            .clone()
            .oneshot(get(&format!("/api/trash/{}", ids[0])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["device_id"], "dev-1");

        let response = app
            .clone()
            .oneshot(get("/api/trash?device_id=dev-1&limit=1&offset=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["data"][0]["id"], ids[2].as_str());
        assert_eq!(
            body["data"]["pagination"],
            json!({ "total": 3, "limit": 1, "offset": 0 })
        );

        let response = app.oneshot(get("/api/trash?limit=0")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["pagination"]["limit"], 20);
    }

    #[tokio::test]
    async fn test_list_trash_rejects_bad_params() {
        let store = Arc::new(InMemoryTrashStore::new());

        let response = router(store.clone())
            .oneshot(get("/api/trash?limit=101"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], codes::VALIDATION_ERROR);

        let response = router(store.clone())
            .oneshot(get("/api/trash?offset=-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], codes::VALIDATION_ERROR);

        let response = router(store)
            .oneshot(get("/api/trash?limit=abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], codes::INVALID_REQUEST);
    }
}
