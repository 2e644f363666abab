use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use proxmed_api::config::{DEFAULT_ACCESS_TOKEN_MINUTES, DEFAULT_REFRESH_TOKEN_DAYS};
use proxmed_api::{ApiResponse, DispatchError, ProxmedApi, ProxmedConfig};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
struct ServiceState {
    api: ProxmedApi,
    operation_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct OperationList {
    operations: Vec<&'static str>,
}

#[derive(Debug, Parser)]
#[command(name = "proxmed-service")]
#[command(about = "HTTP service for the Proxmed clinical data API")]
struct Args {
    #[arg(long, env = "PROXMED_DB", default_value = "./proxmed.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PROXMED_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "PROXMED_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
    /// Accept a missing or short signing secret.
    #[arg(long, env = "PROXMED_DEV")]
    dev: bool,
    #[arg(long, env = "PROXMED_ACCESS_TOKEN_MINUTES", default_value_t = DEFAULT_ACCESS_TOKEN_MINUTES)]
    access_token_minutes: i64,
    #[arg(long, env = "PROXMED_REFRESH_TOKEN_DAYS", default_value_t = DEFAULT_REFRESH_TOKEN_DAYS)]
    refresh_token_days: i64,
    /// Let any authenticated user change plans, features, permissions and subscriptions.
    #[arg(long)]
    open_catalog: bool,
    /// Deadline for reads. Writes always run to completion and instead give
    /// up on a held database lock after this long.
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> ProxmedConfig {
        ProxmedConfig {
            access_token_minutes: self.access_token_minutes,
            refresh_token_days: self.refresh_token_days,
            require_admin_for_catalog: !self.open_catalog,
            busy_timeout_ms: self.operation_timeout_ms,
            ..ProxmedConfig::with_secret(self.db.clone(), self.jwt_secret.clone(), self.dev)
        }
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn dispatch_failure(err: &DispatchError) -> ServiceFailure {
        match err {
            DispatchError::UnknownOperation(name) => Self::failure(
                StatusCode::NOT_FOUND,
                "unknown_operation",
                err.to_string(),
                Some(json!({"operation": name})),
            ),
            DispatchError::InvalidInput { operation, .. } => Self::failure(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                err.to_string(),
                Some(json!({"operation": operation})),
            ),
        }
    }

    /// Runs `op` on the blocking pool. A `bounded` call is abandoned with a
    /// 504 after the operation timeout. Writes must not be bounded: the
    /// blocking task cannot be cancelled and would still commit.
    async fn run_blocking<T, F>(
        &self,
        operation_label: &str,
        bounded: bool,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ProxmedApi) -> anyhow::Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        if !bounded {
            return Self::finish(operation_label, handle.await);
        }
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                warn!(operation = operation_label, "operation timed out");
                Self::failure(
                    StatusCode::GATEWAY_TIMEOUT,
                    "operation_timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;
        Self::finish(operation_label, join_result)
    }

    fn finish<T>(
        operation_label: &str,
        join_result: Result<anyhow::Result<T>, tokio::task::JoinError>,
    ) -> Result<T, ServiceFailure> {
        let op_result = join_result.map_err(|err| {
            error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        op_result.map_err(|err| {
            error!(operation = operation_label, error = %format!("{err:#}"), "operation failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} failed: internal error"),
                None,
            )
        })
    }
}

/// The token from an `Authorization: Bearer <token>` header, if present.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ops", get(list_operations))
        .route("/v1/ops/:operation", post(run_operation))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proxmed=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = ProxmedApi::new(args.config())?;
    api.migrate()?;

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "proxmed service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", message: "API is running" })
}

async fn list_operations() -> Json<OperationList> {
    Json(OperationList { operations: ProxmedApi::operations().collect() })
}

async fn run_operation(
    State(state): State<ServiceState>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ApiResponse<Value>>, ServiceFailure> {
    let Json(input) = payload.map_err(|rejection| ServiceState::invalid_json(&rejection))?;
    let bearer = bearer_token(&headers);
    let label = operation.clone();
    let bounded = ProxmedApi::is_write(&operation) != Some(true);
    let dispatched = state
        .run_blocking(&label, bounded, move |api| {
            Ok(api.execute(&operation, bearer.as_deref(), input))
        })
        .await?;
    dispatched
        .map(Json)
        .map_err(|err| ServiceState::dispatch_failure(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use proxmed_core::Role;
    use tower::ServiceExt;

    const ADMIN_PASSWORD: &str = "Admin-pass-1";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("proxmed-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf, timeout_ms: u64) -> ServiceState {
        let api = match ProxmedApi::new(ProxmedConfig {
            busy_timeout_ms: timeout_ms,
            ..ProxmedConfig::dev(db_path)
        }) {
            Ok(api) => api,
            Err(err) => panic!("failed to build api: {err:#}"),
        };
        if let Err(err) = api.migrate() {
            panic!("failed to migrate test database: {err:#}");
        }
        ServiceState { api, operation_timeout: Duration::from_millis(timeout_ms) }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_op(router: Router, operation: &str, bearer: Option<&str>, body: String) -> Response {
        let mut builder = Request::builder()
            .uri(format!("/v1/ops/{operation}"))
            .method("POST")
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value, json!({"status": "ok", "message": "API is running"}));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn bearer_token_reaches_the_operation() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), 2500);
        if let Err(err) = state.api.create_user_with_role(
            "admin@example.org",
            ADMIN_PASSWORD,
            Role::Admin,
            None,
        ) {
            panic!("failed to create admin: {err:#}");
        }
        let router = app(state);

        let login = post_op(
            router.clone(),
            "login",
            None,
            json!({"email": "admin@example.org", "password": ADMIN_PASSWORD}).to_string(),
        )
        .await;
        assert_eq!(login.status(), StatusCode::OK);
        let login = response_json(login).await;
        let token = login["data"]["accessToken"].as_str().unwrap_or_default().to_string();
        assert!(!token.is_empty(), "login did not return a token: {login}");

        let me = response_json(post_op(router.clone(), "me", Some(&token), "{}".to_string()).await).await;
        assert_eq!(me["success"], json!(true));
        assert_eq!(me["data"]["role"], json!("admin"));

        let anonymous = post_op(router, "me", None, "{}".to_string()).await;
        assert_eq!(anonymous.status(), StatusCode::OK);
        let anonymous = response_json(anonymous).await;
        assert_eq!(anonymous["success"], json!(false));
        assert_eq!(anonymous["data"], Value::Null);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn business_failures_stay_inside_a_200_envelope() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = post_op(router, "plan", None, json!({"id": 404}).to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["message"], json!("Plan not found"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_operations_and_bad_arguments_are_protocol_errors() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let unknown = post_op(router.clone(), "dropDatabase", None, "{}".to_string()).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        let unknown = response_json(unknown).await;
        assert_eq!(unknown["error"]["code"], json!("unknown_operation"));

        let bad = post_op(router, "plan", None, json!({"id": "seven"}).to_string()).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let bad = response_json(bad).await;
        assert_eq!(bad["error"]["code"], json!("invalid_input"));
        assert_eq!(bad["error"]["details"]["operation"], json!("plan"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn invalid_json_payload_returns_invalid_json_error() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = post_op(router, "login", None, "{".to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("invalid_json"));
        assert!(
            value["error"]["details"]["rejection"].as_str().is_some(),
            "missing json rejection details: {value}"
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn run_blocking_times_out_with_gateway_timeout() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), 1);

        let result = state
            .run_blocking("unit_timeout_operation", true, |_api| {
                std::thread::sleep(Duration::from_millis(25));
                Ok::<_, anyhow::Error>(())
            })
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
                assert_eq!(err.code, "operation_timeout");
                assert!(err.message.contains("timed out"), "{}", err.message);
                assert!(err.details.is_some(), "timeout error should include details");
            }
        }

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-007
    #[test]
    fn bearer_header_parsing_is_scheme_insensitive() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, http::HeaderValue::from_static("bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, http::HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn operation_listing_includes_auth_and_capture() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));
        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/ops")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let value = response_json(response).await;
        let names: Vec<&str> = value["operations"]
            .as_array()
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        assert!(names.contains(&"login"));
        assert!(names.contains(&"setValue"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn write_behind_a_held_lock_fails_without_committing() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 300));

        let holder = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open lock holder: {err}"),
        };
        if let Err(err) = holder.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to take write lock: {err}");
        }

        let response = post_op(
            router,
            "register",
            None,
            json!({"email": "late@example.org", "password": "Late-pass-1"}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["success"], json!(false), "{value}");

        if let Err(err) = holder.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }
        let check = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to reopen database: {err}"),
        };
        let users: i64 = match check.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)) {
            Ok(users) => users,
            Err(err) => panic!("failed to count users: {err}"),
        };
        assert_eq!(users, 0);

        let _ = std::fs::remove_file(&db_path);
    }
}
