//! HTTP Server for the REST API
//!
//! Every route except `/health` requires `Authorization: Bearer <token>`.
//! Failures are returned as `{"error": <kind>, "message": <text>}` with a
//! status derived from the error kind.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use vmctl_provision::{
    CloudInitDocuments, DiskRequest, Error, ErrorKind, GuestCommand, PasswordReset,
    ProvisionRequest, Provisioner, SnapshotRequest,
};

/// Shared state for HTTP handlers
pub struct AppState {
    /// Provisioning pipeline
    pub provisioner: Arc<Provisioner>,
    /// Expected bearer token; requests are rejected while unset
    pub auth_token: Option<String>,
    /// Include captured stderr in error bodies
    pub expose_command_output: bool,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::PathConflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppState {
    fn fail(&self, err: Error) -> (StatusCode, Json<ApiError>) {
        let kind = err.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(error = %err, kind = %kind, "Request failed");
        } else {
            warn!(error = %err, kind = %kind, "Request rejected");
        }
        (
            status,
            Json(ApiError::new(kind.as_str(), &err.public_message(self.expose_command_output))),
        )
    }
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value).map_err(|rejection| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorKind::Validation.as_str(), &rejection.body_text())),
        )
    })
}

fn success() -> Json<serde_json::Value> {
    Json(json!({ "status": "success" }))
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    #[serde(rename = "remoteState", default)]
    remote_state: bool,
}

// ============================================================================
// Server
// ============================================================================

/// Start the REST API server
pub async fn run_http_server(http_addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    if state.auth_token.is_none() {
        warn!("No auth token configured, every API route except /health will fail");
    }

    let app = build_app_router(state);

    info!(address = %http_addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE]);

    let api_routes = Router::new()
        // VM endpoints
        .route("/vm", post(create_vm))
        .route("/vm/:vm_id", get(get_vm).patch(update_vm).delete(delete_vm))
        .route("/vm/:vm_id/start", post(start_vm))
        .route("/vm/:vm_id/stop", post(stop_vm))
        .route("/vm/:vm_id/power_off", post(power_off_vm))
        .route("/vm/:vm_id/reboot", post(reboot_vm))
        .route("/vm/:vm_id/reset", post(reset_vm))
        .route("/vm/:vm_id/pause", post(pause_vm))
        .route("/vm/:vm_id/resume", post(resume_vm))
        // Guest customization and agent endpoints
        .route("/vm/:vm_id/cloud-init", post(write_cloud_init))
        .route("/vm/:vm_id/exec", post(exec_in_guest))
        .route("/vm/:vm_id/reset-password", post(reset_password))
        // Snapshot endpoints
        .route("/vm/:vm_id/snapshots", post(create_snapshot))
        .route("/vm/:vm_id/snapshots/:name", delete(delete_snapshot))
        .route("/vm/:vm_id/snapshots/:name/revert", post(revert_snapshot))
        // Storage endpoints
        .route("/disk", post(create_disk))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .merge(api_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn require_bearer(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(expected) = state.auth_token.as_deref().filter(|t| !t.is_empty()) else {
        error!("Rejecting request: no auth token configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new("auth_not_configured", "Server authentication is not configured")),
        )
            .into_response();
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new("unauthorized", "Invalid or missing token")),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new("unauthorized", "Missing Authorization header")),
        )
            .into_response(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - Liveness check
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /vm - Provision a VM
async fn create_vm(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_body(body)?;
    info!(vm_id = %request.id, "Create VM requested via API");

    let created = state.provisioner.create(request).await.map_err(|e| state.fail(e))?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /vm/:vm_id - Domain status, optionally with guest agent details
async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .provisioner
        .status(&vm_id, query.remote_state)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(status))
}

/// PATCH /vm/:vm_id - Update a provisioned VM
async fn update_vm(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_body(body)?;
    info!(vm_id = %vm_id, "Update VM requested via API");

    let report = state
        .provisioner
        .update(&vm_id, request)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(report))
}

/// DELETE /vm/:vm_id - Tear down a VM and its directory
async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    info!(vm_id = %vm_id, "Delete VM requested via API");

    state.provisioner.delete(&vm_id).await.map_err(|e| state.fail(e))?;
    Ok(Json(json!({
        "success": true,
        "message": "Domain deleted successfully",
    })))
}

macro_rules! lifecycle_handler {
    ($name:ident, $op:ident, $doc:literal) => {
        #[doc = $doc]
        async fn $name(
            State(state): State<Arc<AppState>>,
            Path(vm_id): Path<String>,
        ) -> ApiResult<impl IntoResponse> {
            state.provisioner.$op(&vm_id).await.map_err(|e| state.fail(e))?;
            Ok(success())
        }
    };
}

lifecycle_handler!(start_vm, start, "POST /vm/:vm_id/start");
lifecycle_handler!(stop_vm, stop, "POST /vm/:vm_id/stop - Graceful shutdown");
lifecycle_handler!(power_off_vm, power_off, "POST /vm/:vm_id/power_off - Hard power-off");
lifecycle_handler!(reboot_vm, reboot, "POST /vm/:vm_id/reboot");
lifecycle_handler!(reset_vm, reset, "POST /vm/:vm_id/reset - Hard reset");
lifecycle_handler!(pause_vm, pause, "POST /vm/:vm_id/pause");
lifecycle_handler!(resume_vm, resume, "POST /vm/:vm_id/resume");

/// POST /vm/:vm_id/cloud-init - Replace customization documents and rebuild the ISO
async fn write_cloud_init(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    body: Result<Json<CloudInitDocuments>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let documents = parse_body(body)?;

    let iso = state
        .provisioner
        .write_customization(&vm_id, documents)
        .await
        .map_err(|e| state.fail(e))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "cloud-init drive generated",
            "id": vm_id,
            "path": iso,
        })),
    ))
}

/// POST /vm/:vm_id/exec - Run an allow-listed program in the guest
async fn exec_in_guest(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    body: Result<Json<GuestCommand>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let command = parse_body(body)?;

    let output = state
        .provisioner
        .guest_exec(&vm_id, command)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(output))
}

/// POST /vm/:vm_id/reset-password
async fn reset_password(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    body: Result<Json<PasswordReset>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let reset = parse_body(body)?;
    info!(vm_id = %vm_id, user = %reset.user, "Password reset requested via API");

    state
        .provisioner
        .reset_password(&vm_id, reset)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(json!({
        "success": true,
        "message": "Password reset successfully",
    })))
}

/// POST /vm/:vm_id/snapshots
async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    body: Result<Json<SnapshotRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_body(body)?;
    let name = request.name.clone();

    state
        .provisioner
        .create_snapshot(&vm_id, request)
        .await
        .map_err(|e| state.fail(e))?;
    Ok((StatusCode::CREATED, Json(json!({ "id": vm_id, "snapshot": name }))))
}

/// POST /vm/:vm_id/snapshots/:name/revert
async fn revert_snapshot(
    State(state): State<Arc<AppState>>,
    Path((vm_id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state
        .provisioner
        .revert_snapshot(&vm_id, &name)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(success())
}

/// DELETE /vm/:vm_id/snapshots/:name
async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path((vm_id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state
        .provisioner
        .delete_snapshot(&vm_id, &name)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(success())
}

/// POST /disk - Create a standalone disk from a template
async fn create_disk(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DiskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_body(body)?;

    let created = state.provisioner.create_disk(request).await.map_err(|e| state.fail(e))?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use vmctl_provision::{MockFetcher, MockResponse, MockRunner, ProvisionerSettings};

    const TOKEN: &str = "test-token";
    const TEMPLATE: &str = "https://images.example.com/jammy.qcow2";

    struct TestApp {
        _tmp: TempDir,
        runner: Arc<MockRunner>,
        router: Router,
    }

    fn app_with(auth_token: Option<&str>, expose_command_output: bool) -> TestApp {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.serve(TEMPLATE, b"template".to_vec());

        let settings = ProvisionerSettings {
            definitions_dir: tmp.path().join("vms"),
            ..Default::default()
        };
        let provisioner = Provisioner::from_settings(settings, runner.clone(), fetcher);
        let state = Arc::new(AppState {
            provisioner: Arc::new(provisioner),
            auth_token: auth_token.map(str::to_string),
            expose_command_output,
        });

        TestApp {
            _tmp: tmp,
            runner,
            router: build_app_router(state),
        }
    }

    fn app() -> TestApp {
        app_with(Some(TOKEN), false)
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn vm_body() -> Value {
        json!({
            "id": "vm-1",
            "xmlConfig": "<domain type='kvm'><name>vm-1</name></domain>",
            "disks": [{"id": 0, "capacity": 10}],
            "template": {"imageURL": TEMPLATE},
            "cloudInit": {"userData": "#cloud-config\n"}
        })
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let app = app_with(None, false);
        let request = HttpRequest::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_auth_is_enforced() {
        let app = app();
        let request = HttpRequest::get("/vm/vm-1").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let request = HttpRequest::get("/vm/vm-1")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(app.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_unset_token_fails_closed() {
        let app = app_with(None, false);
        let (status, body) = send(&app, authed("GET", "/vm/vm-1", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "auth_not_configured");
    }

    #[tokio::test]
    async fn test_create_then_status() {
        let app = app();
        let (status, body) = send(&app, authed("POST", "/vm", Some(vm_body()))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "vm-1");

        app.runner
            .respond("virsh", "dominfo", MockResponse::output("Name: vm-1\nState:          running\n"));
        let (status, body) = send(&app, authed("GET", "/vm/vm-1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": "vm-1", "status": "running"}));
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let app = app();

        let mut invalid = vm_body();
        invalid["xmlConfig"] = json!("");
        let (status, body) = send(&app, authed("POST", "/vm", Some(invalid))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, body) = send(&app, authed("DELETE", "/vm/missing", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let request = HttpRequest::post("/vm")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_command_output_is_hidden_by_default() {
        for (expose, leaks) in [(false, false), (true, true)] {
            let app = app_with(Some(TOKEN), expose);
            app.runner
                .respond("virsh", "define", MockResponse::failure("error: secret libvirt detail"));

            let (status, body) = send(&app, authed("POST", "/vm", Some(vm_body()))).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["error"], "external_command_error");
            let message = body["message"].as_str().unwrap();
            assert_eq!(message.contains("secret libvirt detail"), leaks);
        }
    }

    #[tokio::test]
    async fn test_lifecycle_routes() {
        let app = app();
        let (status, _) = send(&app, authed("POST", "/vm", Some(vm_body()))).await;
        assert_eq!(status, StatusCode::CREATED);

        for (route, subcommand) in [
            ("start", "start"),
            ("stop", "shutdown"),
            ("power_off", "destroy"),
            ("reboot", "reboot"),
            ("reset", "reset"),
            ("pause", "suspend"),
            ("resume", "resume"),
        ] {
            let uri = format!("/vm/vm-1/{}", route);
            let (status, body) = send(&app, authed("POST", &uri, None)).await;
            assert_eq!(status, StatusCode::OK, "route {}", route);
            assert_eq!(body["status"], "success");
            assert_eq!(app.runner.calls_to("virsh", subcommand).len(), 1, "route {}", route);
        }
    }

    #[tokio::test]
    async fn test_exec_denied_without_allowlist() {
        let app = app();
        send(&app, authed("POST", "/vm", Some(vm_body()))).await;

        let (status, body) = send(
            &app,
            authed("POST", "/vm/vm-1/exec", Some(json!({"path": "/bin/sh", "args": ["-c", "id"]}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
        assert!(app.runner.calls_to("virsh", "qemu-agent-command").is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_routes() {
        let app = app();
        send(&app, authed("POST", "/vm", Some(vm_body()))).await;

        let (status, body) = send(
            &app,
            authed("POST", "/vm/vm-1/snapshots", Some(json!({"name": "before-upgrade"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["snapshot"], "before-upgrade");

        let (status, _) =
            send(&app, authed("POST", "/vm/vm-1/snapshots/before-upgrade/revert", None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, authed("DELETE", "/vm/vm-1/snapshots/before-upgrade", None)).await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(
            app.runner.subcommands("virsh"),
            vec!["define", "snapshot-create-as", "snapshot-revert", "snapshot-delete"]
        );
    }

    #[tokio::test]
    async fn test_create_disk_route() {
        let app = app();
        let dir = app._tmp.path().join("disks");
        let (status, body) = send(
            &app,
            authed(
                "POST",
                "/disk",
                Some(json!({"id": 7, "size": 20, "path": dir, "image_url": TEMPLATE})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], 7);
        assert!(dir.join("7.img").exists());
    }
}
