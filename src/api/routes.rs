use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::domain::{OrgId, Provenance};
use crate::observability::{MetricsRegistry, Operation};
use crate::provisioning::{AlertRuleProvisioning, ErrorKind, ProvisioningError};

use super::request::{AlertRuleRequest, RuleGroupRequest};
use super::response::{AlertRuleResponse, ErrorResponse, HealthResponse, RuleGroupResponse};

/// Header selecting the organization; defaults to [`DEFAULT_ORG_ID`].
pub const ORG_ID_HEADER: &str = "x-org-id";

/// Header marking a request as unmanaged; its presence means `Provenance::None`.
pub const DISABLE_PROVENANCE_HEADER: &str = "x-disable-provenance";

pub const DEFAULT_ORG_ID: OrgId = 1;

/// Shared application state.
pub struct AppState {
    /// Provisioning service over the configured backend
    pub service: Arc<dyn AlertRuleProvisioning>,

    pub metrics: Arc<MetricsRegistry>,

    /// Application start time
    pub start_time: Instant,

    /// Application version
    pub version: String,
}

/// Create the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/provisioning/alert-rules",
            post(handle_create_rule),
        )
        .route(
            "/api/v1/provisioning/alert-rules/:uid",
            get(handle_get_rule)
                .put(handle_update_rule)
                .delete(handle_delete_rule),
        )
        .route(
            "/api/v1/provisioning/folder/:namespace_uid/rule-groups/:group",
            put(handle_update_rule_group),
        )
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn org_id(headers: &HeaderMap) -> Result<OrgId, Response> {
    let Some(value) = headers.get(ORG_ID_HEADER) else {
        return Ok(DEFAULT_ORG_ID);
    };

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<OrgId>().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::bad_request("invalid organization id")),
            )
                .into_response()
        })
}

fn provenance(headers: &HeaderMap) -> Provenance {
    if headers.contains_key(DISABLE_PROVENANCE_HEADER) {
        Provenance::None
    } else {
        Provenance::Api
    }
}

fn error_response(state: &AppState, err: ProvisioningError) -> Response {
    state.metrics.record_failure(&err);

    let status = match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "Provisioning request failed");
    } else {
        warn!(error = %err, code = err.code(), "Provisioning request rejected");
    }

    (status, Json(ErrorResponse::new(err.to_string(), err.code()))).into_response()
}

/// Fetch a rule and its provenance.
async fn handle_get_rule(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Response {
    let org_id = match org_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.service.get_alert_rule(org_id, &uid).await {
        Ok((rule, provenance)) => {
            (StatusCode::OK, Json(AlertRuleResponse { rule, provenance })).into_response()
        }
        Err(e) => error_response(&state, e),
    }
}

/// Create a rule.
async fn handle_create_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AlertRuleRequest>,
) -> Response {
    let org_id = match org_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let provenance = provenance(&headers);

    match state
        .service
        .create_alert_rule(req.into_rule(org_id), provenance)
        .await
    {
        Ok(rule) => {
            state.metrics.record_success(Operation::Create);
            (
                StatusCode::CREATED,
                Json(AlertRuleResponse { rule, provenance }),
            )
                .into_response()
        }
        Err(e) => error_response(&state, e),
    }
}

/// Replace a rule.
async fn handle_update_rule(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AlertRuleRequest>,
) -> Response {
    let org_id = match org_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let provenance = provenance(&headers);
    let rule = req.into_rule(org_id).with_uid(uid);

    match state.service.update_alert_rule(rule, provenance).await {
        Ok(rule) => {
            state.metrics.record_success(Operation::Update);
            (StatusCode::OK, Json(AlertRuleResponse { rule, provenance })).into_response()
        }
        Err(e) => error_response(&state, e),
    }
}

/// Delete a rule.
async fn handle_delete_rule(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Response {
    let org_id = match org_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state
        .service
        .delete_alert_rule(org_id, &uid, provenance(&headers))
        .await
    {
        Ok(()) => {
            state.metrics.record_success(Operation::Delete);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(&state, e),
    }
}

/// Change the interval of a rule group.
async fn handle_update_rule_group(
    State(state): State<Arc<AppState>>,
    Path((namespace_uid, group)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<RuleGroupRequest>,
) -> Response {
    let org_id = match org_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state
        .service
        .update_rule_group(org_id, &namespace_uid, &group, req.interval)
        .await
    {
        Ok(()) => {
            state.metrics.record_success(Operation::UpdateGroup);
            (
                StatusCode::OK,
                Json(RuleGroupResponse {
                    namespace_uid,
                    rule_group: group,
                    interval: req.interval,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&state, e),
    }
}

/// Health check endpoint.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Metrics endpoint (Prometheus format).
async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = format!(
        r#"# HELP ruleprov_uptime_seconds Application uptime in seconds
# TYPE ruleprov_uptime_seconds counter
ruleprov_uptime_seconds {}

{}"#,
        state.start_time.elapsed().as_secs(),
        state.metrics.to_prometheus(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::tracing::init_test_tracing;
    use crate::provisioning::RuleProvisioningService;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app_state() -> Arc<AppState> {
        init_test_tracing();

        let store = MemoryStore::new();
        let service = RuleProvisioningService::new(
            store.clone(),
            store.clone(),
            store,
            60,
            10,
        );

        Arc::new(AppState {
            service: Arc::new(service),
            metrics: Arc::new(MetricsRegistry::new()),
            start_time: Instant::now(),
            version: "0.1.0-test".to_string(),
        })
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn rule_body(group: &str) -> serde_json::Value {
        serde_json::json!({
            "title": "High CPU",
            "namespace_uid": "folder-a",
            "rule_group": group,
            "labels": {"team": "infra"}
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(test_app_state());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_get_rule() {
        let app = create_router(test_app_state());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/provisioning/alert-rules",
                rule_body("cpu"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let created = body_json(response).await;
        assert_eq!(created["provenance"], "api");
        assert_eq!(created["interval_seconds"], 60);
        let uid = created["uid"].as_str().unwrap().to_string();

        let request = Request::builder()
            .uri(format!("/api/v1/provisioning/alert-rules/{}", uid))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let fetched = body_json(response).await;
        assert_eq!(fetched["uid"], uid.as_str());
        assert_eq!(fetched["provenance"], "api");
    }

    #[tokio::test]
    async fn test_missing_rule_is_404() {
        let app = create_router(test_app_state());

        let request = Request::builder()
            .uri("/api/v1/provisioning/alert-rules/nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "RULE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unmanaged_delete_of_provisioned_rule_is_409() {
        let state = test_app_state();
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/provisioning/alert-rules",
                rule_body("cpu"),
            ))
            .await
            .unwrap();
        let uid = body_json(response).await["uid"]
            .as_str()
            .unwrap()
            .to_string();

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/provisioning/alert-rules/{}", uid))
            .header(DISABLE_PROVENANCE_HEADER, "true")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "PROVENANCE_CONFLICT");

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/provisioning/alert-rules/{}", uid))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let metrics = state.metrics.to_prometheus();
        assert!(metrics.contains("ruleprov_rejections_total{cause=\"provenance_conflict\"} 1"));
        assert!(metrics.contains("ruleprov_operations_total{operation=\"delete\"} 1"));
    }

    #[tokio::test]
    async fn test_provisioning_into_unmanaged_group_is_400() {
        let app = create_router(test_app_state());

        let mut request = json_request(
            "POST",
            "/api/v1/provisioning/alert-rules",
            rule_body("cpu"),
        );
        request
            .headers_mut()
            .insert(DISABLE_PROVENANCE_HEADER, "true".parse().unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["provenance"], "");

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/provisioning/alert-rules",
                rule_body("cpu"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "GROUP_NOT_PROVISIONED");
    }

    #[tokio::test]
    async fn test_update_rule_group() {
        let app = create_router(test_app_state());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/provisioning/alert-rules",
                rule_body("cpu"),
            ))
            .await
            .unwrap();
        let uid = body_json(response).await["uid"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v1/provisioning/folder/folder-a/rule-groups/cpu",
                serde_json::json!({"interval": 15}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_INTERVAL");

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v1/provisioning/folder/folder-a/rule-groups/cpu",
                serde_json::json!({"interval": 120}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri(format!("/api/v1/provisioning/alert-rules/{}", uid))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await["interval_seconds"], 120);
    }

    #[tokio::test]
    async fn test_invalid_org_header_is_400() {
        let app = create_router(test_app_state());

        let request = Request::builder()
            .uri("/api/v1/provisioning/alert-rules/abc")
            .header(ORG_ID_HEADER, "not-a-number")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_rule_endpoint() {
        let app = create_router(test_app_state());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/provisioning/alert-rules",
                rule_body("cpu"),
            ))
            .await
            .unwrap();
        let uid = body_json(response).await["uid"]
            .as_str()
            .unwrap()
            .to_string();

        let mut body = rule_body("cpu");
        body["title"] = serde_json::json!("Very high CPU");
        let response = app
            .oneshot(json_request(
                "PUT",
                &format!("/api/v1/provisioning/alert-rules/{}", uid),
                body,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let updated = body_json(response).await;
        assert_eq!(updated["title"], "Very high CPU");
        assert_eq!(updated["version"], 2);
    }
}
