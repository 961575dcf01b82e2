//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use crate::auth::{AuthContext, Permission};
use crate::error::TestError;
use crate::manager::StatusMessageKind;
use crate::status::TestStatusMessage;

/// Header carrying the authenticated user id, set by the auth proxy.
pub const USER_HEADER: &str = "x-loadcontrol-user";
/// Header carrying the caller's role: `readonly`, `worker`, `user`, or `admin`.
pub const ROLE_HEADER: &str = "x-loadcontrol-role";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tests/running", get(running_tests))
        .route("/tests/{id}", get(get_test))
        .route("/tests/{id}/status", get(get_test_status).put(put_test_status))
        .route("/tests/{id}/previous", get(previous_submission))
        .route("/tests/{id}/cancel", put(cancel_test))
        .route("/search", get(search))
        .route("/schedule", get(calendar))
        .route("/schedule/{id}", delete(remove_scheduled))
}

fn auth_from_headers(headers: &HeaderMap) -> AuthContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let user_id = header(USER_HEADER).map(str::to_string);
    let permission = match (user_id.is_some(), header(ROLE_HEADER)) {
        (false, _) => Permission::ReadOnly,
        (true, Some("admin")) => Permission::Admin,
        (true, Some("readonly")) => Permission::ReadOnly,
        (true, Some("worker")) => Permission::Worker,
        (true, _) => Permission::User,
    };
    AuthContext { user_id, permission }
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn health() -> Json<Value> {
    envelope(json!({ "status": "ok" }))
}

async fn get_test(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, TestError> {
    let record = state.controller.manager().query_test(&id).await?;
    Ok(envelope(record))
}

async fn get_test_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, TestError> {
    let status = state.controller.manager().query_test_status(&id).await?;
    Ok(envelope(json!({ "testId": id, "status": status })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate {
    #[serde(default)]
    kind: StatusMessageKind,
    #[serde(flatten)]
    message: TestStatusMessage,
}

/// Inbound worker status, for deployments where workers report over HTTP
/// instead of a queue. Restricted to the worker and admin roles.
async fn put_test_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Value>, TestError> {
    if !auth_from_headers(&headers).may_report_status() {
        return Err(TestError::permission("only workers and admins may report test status"));
    }
    let record = state
        .controller
        .manager()
        .update_running_test(&id, &update.message, update.kind)
        .await?;
    Ok(envelope(record))
}

async fn previous_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, TestError> {
    let previous = state.controller.manager().query_previous_submission(&id).await?;
    Ok(envelope(previous))
}

async fn running_tests(State(state): State<AppState>) -> Json<Value> {
    envelope(state.controller.manager().running_tests())
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    #[serde(default)]
    kill: bool,
}

async fn cancel_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, TestError> {
    let auth = auth_from_headers(&headers);
    state.controller.manager().cancel_test(&id, &auth, params.kill).await?;
    Ok(envelope(json!({ "testId": id, "kill": params.kill })))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    prefix: String,
    max_results: Option<usize>,
}

async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Result<Response, TestError> {
    let results = state
        .controller
        .manager()
        .search_tests(&params.prefix, params.max_results)
        .await?;
    if results.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(envelope(results).into_response())
}

async fn calendar(State(state): State<AppState>) -> Result<Json<Value>, TestError> {
    let events = state.controller.scheduler().get_calendar_events().await?;
    Ok(envelope(events))
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    #[serde(default)]
    delete_storage: bool,
}

async fn remove_scheduled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RemoveParams>,
    headers: HeaderMap,
) -> Result<StatusCode, TestError> {
    let auth = auth_from_headers(&headers);
    state
        .controller
        .scheduler()
        .remove_test(&id, &auth, params.delete_storage)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::clock::ManualClock;
    use crate::config::ControllerConfig;
    use crate::queue::{InMemoryQueue, QueuePool};
    use crate::storage::InMemoryObjectStore;
    use crate::validator::StaticValidator;
    use crate::Controller;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let controller = Controller::new(
            ControllerConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            QueuePool::new().with_queue("default", Arc::new(InMemoryQueue::new())),
            Arc::new(StaticValidator::new(30, 1000)),
            Arc::new(clock),
        )
        .unwrap();
        router(AppState::new(Arc::new(controller)))
    }

    async fn send(app: Router, method: &str, uri: &str) -> StatusCode {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(send(app(), "GET", "/api/v1/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_error_codes() {
        assert_eq!(send(app(), "GET", "/api/v1/tests/not-an-id").await, StatusCode::BAD_REQUEST);
        assert_eq!(
            send(app(), "GET", "/api/v1/tests/basic20240101T000000000").await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            send(app(), "DELETE", "/api/v1/schedule/basic20240101T000000000").await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(send(app(), "GET", "/api/v1/search?prefix=basic").await, StatusCode::NO_CONTENT);
        assert_eq!(send(app(), "GET", "/nowhere").await, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_auth_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(auth_from_headers(&headers).permission, Permission::ReadOnly);
        headers.insert(USER_HEADER, "alice".parse().unwrap());
        assert_eq!(auth_from_headers(&headers), AuthContext::user("alice"));
        headers.insert(ROLE_HEADER, "admin".parse().unwrap());
        assert_eq!(auth_from_headers(&headers), AuthContext::admin("alice"));
    }

    #[tokio::test]
    async fn test_status_report_requires_worker_role() {
        let body = r#"{"kind":"finished","startTime":1704067200000,"endTime":1704069000000,"status":"finished"}"#;
        let put = |role: Option<&str>| {
            let mut builder = Request::builder()
                .method("PUT")
                .uri("/api/v1/tests/basic20240101T000000000/status")
                .header("content-type", "application/json");
            if let Some(role) = role {
                builder = builder.header(USER_HEADER, "agent-1").header(ROLE_HEADER, role);
            }
            builder.body(Body::from(body)).unwrap()
        };

        let anonymous = app().oneshot(put(None)).await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);
        let user = app().oneshot(put(Some("user"))).await.unwrap();
        assert_eq!(user.status(), StatusCode::FORBIDDEN);
        let worker = app().oneshot(put(Some("worker"))).await.unwrap();
        assert_eq!(worker.status(), StatusCode::OK);
    }
}
