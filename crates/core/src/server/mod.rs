use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod payload;

pub use payload::{
    CreateGifResponse, CreateJobResponse, CurrentJobResponse, EncodeRequest, ImagePayload,
    JobSummary, OptionsPayload,
};

use crate::artifact::{finalize, ArtifactHandle};
use crate::config::AppConfig;
use crate::controller::{JobController, JobEvent, JobSnapshot, JobState};
use crate::error::PipelineError;
use crate::logging;
use crate::pipeline::run_pipeline;
use payload::DecodedRequest;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    controller: JobController,
    encode_semaphore: Arc<Semaphore>,
    config: RwLock<AppConfig>,
    max_body_bytes: usize,
    last_job: RwLock<Option<JobSummary>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let permits = config.server.max_concurrent_encodes.max(1);
        Self {
            inner: Arc::new(AppStateInner {
                controller: JobController::new(config.encode.background),
                encode_semaphore: Arc::new(Semaphore::new(permits)),
                max_body_bytes: config.server.max_body_bytes,
                config: RwLock::new(config),
                last_job: RwLock::new(None),
            }),
        }
    }

    pub fn controller(&self) -> &JobController {
        &self.inner.controller
    }

    async fn decode_request(&self, body: &[u8]) -> Result<DecodedRequest, AppError> {
        let request: EncodeRequest = serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?;
        let config = self.inner.config.read().await;
        request
            .into_pipeline_input(&config)
            .map_err(AppError::BadRequest)
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.inner.max_body_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/createGif", post(create_gif).fallback(method_not_allowed))
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/current", get(current_job))
        .route("/api/jobs/current/cancel", post(cancel_job))
        .route("/api/jobs/ws", any(job_ws))
        .route(
            "/api/artifacts/{handle}",
            get(download_artifact).delete(release_artifact),
        )
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn method_not_allowed(method: Method) -> AppError {
    AppError::MethodNotAllowed(format!("method not allowed: {method}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    let config = state.inner.config.read().await.clone();
    Json(config)
}

/// Request/response encode. No progress and no cancellation: the call only
/// returns once the animation is finished or has failed.
async fn create_gif(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateGifResponse>, AppError> {
    let DecodedRequest { frames, options } = state.decode_request(&body).await?;
    let background = state.inner.config.read().await.encode.background;
    let total_frames = frames.len();

    let permit = Arc::clone(&state.inner.encode_semaphore)
        .acquire_owned()
        .await
        .map_err(|_| AppError::Internal("encoder pool is closed".to_string()))?;

    // The permit travels with the blocking task: a client that disconnects
    // drops this handler, but the encode keeps its slot until it returns.
    let stream = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _context = logging::enter_encode_context(None, total_frames);
        run_pipeline(
            &frames,
            &options,
            background,
            &mut |_| {},
            &CancellationToken::new(),
        )
    })
    .await
    .map_err(|e| AppError::Internal(format!("encoder task failed: {e}")))??;

    let artifact = finalize(stream);
    info!(
        total_frames,
        bytes = artifact.size_bytes(),
        "createGif request completed"
    );
    Ok(Json(CreateGifResponse::from(&artifact)))
}

async fn create_job(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let DecodedRequest { frames, options } = state.decode_request(&body).await?;
    let handle = state.inner.controller.start(frames, options)?;
    let id = handle.id();
    let total_frames = handle.total_frames();

    let watcher = state.clone();
    tokio::spawn(async move {
        let outcome = handle.wait().await;
        *watcher.inner.last_job.write().await = Some(JobSummary::from_outcome(id, &outcome));
    });

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            id,
            state: JobState::Running,
            total_frames,
            created_at: Utc::now(),
        }),
    ))
}

async fn current_job(State(state): State<AppState>) -> Json<CurrentJobResponse> {
    let snapshot = state.inner.controller.snapshot();
    let last = state.inner.last_job.read().await.clone();
    Json(CurrentJobResponse { snapshot, last })
}

async fn cancel_job(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<JobSnapshot>), AppError> {
    state.inner.controller.cancel()?;
    Ok((StatusCode::ACCEPTED, Json(state.inner.controller.snapshot())))
}

async fn job_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.inner.controller.subscribe();
    ws.on_upgrade(move |socket| handle_ws(socket, rx))
}

async fn handle_ws(mut socket: WebSocket, mut rx: broadcast::Receiver<JobEvent>) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(_) => break,
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket receiver lagged by {n} job events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

fn parse_handle(raw: &str) -> Result<ArtifactHandle, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid artifact handle: {raw}")))
}

async fn download_artifact(
    State(state): State<AppState>,
    Path(raw_handle): Path<String>,
) -> Result<Response, AppError> {
    let handle = parse_handle(&raw_handle)?;
    let artifact = state
        .inner
        .controller
        .artifacts()
        .get(&handle)
        .ok_or_else(|| AppError::NotFound(format!("artifact not found: {handle}")))?;

    let headers = [
        (header::CONTENT_TYPE, artifact.mime_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.file_name()),
        ),
    ];
    Ok((headers, Body::from(artifact.bytes().to_vec())).into_response())
}

async fn release_artifact(
    State(state): State<AppState>,
    Path(raw_handle): Path<String>,
) -> Result<StatusCode, AppError> {
    let handle = parse_handle(&raw_handle)?;
    if state.inner.controller.artifacts().release(&handle) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("artifact not found: {handle}")))
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    MethodNotAllowed(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::MethodNotAllowed(msg) => (StatusCode::METHOD_NOT_ALLOWED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(_) | PipelineError::Decode { .. } => {
                AppError::BadRequest(err.to_string())
            }
            PipelineError::CallerMisuse(_) => AppError::Conflict(err.to_string()),
            PipelineError::Encode { .. } | PipelineError::Cancelled => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

pub fn default_app_state() -> AppState {
    let dd = crate::config::data_dir(None);
    let cfg_path = crate::config::config_path(&dd);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    AppState::new(config)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use image::{Rgba, RgbaImage};
    use tower::{Service, ServiceExt};

    use super::*;

    fn test_router() -> Router {
        app_router(AppState::new(AppConfig::default()))
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn png_base64(img: &RgbaImage) -> String {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        STANDARD.encode(buf)
    }

    fn solid_base64(w: u32, h: u32, color: [u8; 4]) -> String {
        png_base64(&RgbaImage::from_pixel(w, h, Rgba(color)))
    }

    fn noisy_base64(w: u32, h: u32, seed: u32) -> String {
        let mut state = seed.wrapping_mul(2_246_822_519).wrapping_add(7);
        png_base64(&RgbaImage::from_fn(w, h, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, _] = state.to_le_bytes();
            Rgba([r, g, b, 255])
        }))
    }

    fn three_frame_body() -> serde_json::Value {
        serde_json::json!({
            "images": [
                { "image": solid_base64(20, 10, [255, 0, 0, 255]), "delay_ms": 100 },
                { "image": solid_base64(10, 20, [0, 255, 0, 255]), "delay_ms": 250 },
                { "image": solid_base64(16, 16, [0, 0, 255, 255]), "delay_ms": 400 }
            ],
            "options": { "width": 32, "height": 32, "quality": 10 }
        })
    }

    fn slow_body() -> serde_json::Value {
        let images: Vec<_> = (0..5)
            .map(|i| serde_json::json!({ "image": noisy_base64(400, 400, i + 1), "delay_ms": 100 }))
            .collect();
        serde_json::json!({
            "images": images,
            "options": { "width": 400, "height": 400, "quality": 1 }
        })
    }

    fn gif_delays(bytes: &[u8]) -> Vec<u16> {
        let mut decode_options = gif::DecodeOptions::new();
        decode_options.set_color_output(gif::ColorOutput::Indexed);
        let mut decoder = decode_options.read_info(Cursor::new(bytes)).unwrap();
        let mut delays = Vec::new();
        while let Some(frame) = decoder.read_next_frame().unwrap() {
            delays.push(frame.delay);
        }
        delays
    }

    async fn wait_for_last_job(router: &mut Router) -> serde_json::Value {
        const MAX_POLLS: usize = 200;
        const POLL_INTERVAL_MS: u64 = 25;

        for _ in 0..MAX_POLLS {
            let json = json_body(send_request(router, get_request("/api/jobs/current")).await).await;
            if !json["last"].is_null() && json["state"] != "running" {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }

        panic!("job did not reach a terminal state within timeout");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_get_config_endpoint() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/config")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let config: AppConfig = serde_json::from_slice(&body).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_create_gif_returns_encoded_animation() {
        let mut app = test_router();
        let resp = send_request(&mut app, post_json("/api/createGif", &three_frame_body())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = json_body(resp).await;
        assert_eq!(json["mime_type"], "image/gif");
        assert_eq!(json["frame_count"], 3);
        assert_eq!(json["width"], 32);
        assert_eq!(json["height"], 32);

        let bytes = STANDARD.decode(json["gif"].as_str().unwrap()).unwrap();
        assert_eq!(json["size_bytes"], bytes.len());
        assert_eq!(gif_delays(&bytes), vec![10, 25, 40]);
    }

    #[tokio::test]
    async fn test_create_gif_rejects_other_methods() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/createGif")).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        let json = json_body(resp).await;
        assert!(json["error"].as_str().unwrap().contains("GET"));
    }

    #[tokio::test]
    async fn test_create_gif_malformed_inputs_are_bad_requests() {
        let mut app = test_router();

        let not_json = Request::builder()
            .method("POST")
            .uri("/api/createGif")
            .header("content-type", "application/json")
            .body(Body::from("{nope"))
            .unwrap();
        let resp = send_request(&mut app, not_json).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid JSON body"));

        for body in [
            serde_json::json!({ "images": [] }),
            serde_json::json!({ "images": [{ "image": "***" }] }),
            serde_json::json!({ "images": [{ "image": STANDARD.encode(b"not an image") }] }),
            serde_json::json!({ "images": [{ "image": solid_base64(2, 2, [0, 0, 0, 255]), "delay_ms": 0 }] }),
            serde_json::json!({
                "images": [{ "image": solid_base64(2, 2, [0, 0, 0, 255]) }],
                "options": { "width": 0 }
            }),
        ] {
            let resp = send_request(&mut app, post_json("/api/createGif", &body)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn test_create_gif_enforces_frame_limit() {
        let image = solid_base64(2, 2, [1, 1, 1, 255]);
        let images: Vec<_> = (0..11).map(|_| serde_json::json!({ "image": image })).collect();

        let mut app = test_router();
        let resp = send_request(
            &mut app,
            post_json("/api/createGif", &serde_json::json!({ "images": images })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "too many images: 11 (limit 10)");
    }

    #[tokio::test]
    async fn test_create_gif_rejects_oversized_canvas() {
        let mut app = test_router();
        let body = serde_json::json!({
            "images": [{ "image": solid_base64(2, 2, [1, 1, 1, 255]) }],
            "options": { "width": 65535, "height": 65535 }
        });
        let resp = send_request(&mut app, post_json("/api/createGif", &body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("65535x65535"));
    }

    async fn wait_for_permits(state: &AppState, expected: usize, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while state.inner.encode_semaphore.available_permits() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "encode permits never reached {expected}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_gif_abort_keeps_permit_until_encode_finishes() {
        let state = AppState::new(AppConfig::default());
        let body = Bytes::from(serde_json::to_vec(&slow_body()).unwrap());

        let request = tokio::spawn(create_gif(State(state.clone()), body));
        wait_for_permits(&state, 0, Duration::from_secs(30)).await;

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert_eq!(state.inner.encode_semaphore.available_permits(), 0);

        wait_for_permits(&state, 1, Duration::from_secs(300)).await;
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/does/not/exist")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(resp).await["error"],
            "api endpoint not found: /api/does/not/exist"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_lifecycle_download_and_release() {
        let mut app = test_router();

        let resp = send_request(&mut app, post_json("/api/jobs", &three_frame_body())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        assert_eq!(created["state"], "running");
        assert_eq!(created["total_frames"], 3);

        let current = wait_for_last_job(&mut app).await;
        assert_eq!(current["state"], "idle");
        assert_eq!(current["last"]["id"], created["id"]);
        assert_eq!(current["last"]["state"], "completed");
        let handle = current["last"]["artifact"]["handle"].as_str().unwrap().to_string();

        let resp = send_request(&mut app, get_request(&format!("/api/artifacts/{handle}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/gif");
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"animation.gif\""
        );
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(gif_delays(&bytes), vec![10, 25, 40]);

        let delete = |handle: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/artifacts/{handle}"))
                .body(Body::empty())
                .unwrap()
        };
        let resp = send_request(&mut app, delete(&handle)).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = send_request(&mut app, delete(&handle)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send_request(&mut app, get_request(&format!("/api/artifacts/{handle}"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_job_conflicts_and_cancel_is_accepted() {
        let mut app = test_router();

        let resp = send_request(&mut app, post_json("/api/jobs", &slow_body())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_request(&mut app, post_json("/api/jobs", &three_frame_body())).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send_request(&mut app, post_json("/api/jobs/current/cancel", &serde_json::json!({}))).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let current = wait_for_last_job(&mut app).await;
        assert_eq!(current["last"]["state"], "cancelled");
        assert!(current["last"]["artifact"].is_null());
    }

    #[tokio::test]
    async fn test_cancel_without_running_job_conflicts() {
        let mut app = test_router();
        let resp = send_request(&mut app, post_json("/api/jobs/current/cancel", &serde_json::json!({}))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["error"], "no encode job is running");
    }

    #[tokio::test]
    async fn test_invalid_artifact_handle_is_bad_request() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/artifacts/not-a-uuid")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn pipeline_errors_map_to_http_statuses() {
        let status = |err: PipelineError| AppError::from(err).into_response().status();
        assert_eq!(
            status(PipelineError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(PipelineError::CallerMisuse("busy".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(PipelineError::encode(Some(1), "boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
