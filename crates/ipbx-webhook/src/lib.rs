//! HTTP receiver for InsidePBX real-time call callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use chrono_tz::Tz;
use ipbx_api::call_record_from_callback;
use ipbx_transport::timezone_from_lookup;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ipbx-webhook";

#[derive(Debug, Clone)]
pub struct AppState {
    pub tenant_id: String,
    pub timezone: Tz,
}

impl AppState {
    pub fn new(tenant_id: impl Into<String>, timezone: Tz) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            timezone,
        }
    }

    /// Receiver-only settings: `IPBX_TENANT_ID` and `IPBX_TIMEZONE`. No API token needed.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let timezone = timezone_from_lookup(&lookup)?;
        Ok(Self::new(lookup("IPBX_TENANT_ID").unwrap_or_default(), timezone))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/callback",
            get(callback_query_handler).post(callback_form_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "callback receiver listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn callback_form_handler(
    State(state): State<Arc<AppState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    handle_callback(&state, &params)
}

async fn callback_query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_callback(&state, &params)
}

fn handle_callback(state: &AppState, params: &HashMap<String, String>) -> Response {
    match call_record_from_callback(params, &state.tenant_id, state.timezone) {
        Ok(record) => {
            info!(
                call_id = %record.id,
                status = ?record.status,
                extension = ?record.extension,
                caller = ?record.caller_number,
                "call callback received"
            );
            Json(record).into_response()
        }
        Err(err) => {
            warn!(error = %err, fields = params.len(), "rejecting malformed call callback");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn test_app() -> Router {
        app(AppState::new("1000", chrono_tz::Europe::Bucharest))
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn state_from_lookup_needs_no_token() {
        let vars = HashMap::from([
            ("IPBX_TENANT_ID", "1000"),
            ("IPBX_TIMEZONE", "Europe/London"),
        ]);
        let state = AppState::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(state.tenant_id, "1000");
        assert_eq!(state.timezone, chrono_tz::Europe::London);

        let empty: HashMap<&str, &str> = HashMap::new();
        let state = AppState::from_lookup(|k| empty.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(state.tenant_id, "");
        assert_eq!(state.timezone, chrono_tz::Europe::Bucharest);

        let bad_zone = HashMap::from([("IPBX_TIMEZONE", "Mars/Olympus")]);
        assert!(AppState::from_lookup(|k| bad_zone.get(k).map(|v| v.to_string())).is_err());
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn form_callback_returns_call_record() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/callback")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(
                        "uuid=cb-1&extension_number=1000101&call_status=Hangup&call_direction=inbound\
                         &call_duration=42&call_answer_time=2024-01-15+10%3A00%3A00&reason=NORMAL_CLEARING",
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], "cb-1");
        assert_eq!(json["extension"], "101");
        assert_eq!(json["status"], "Hangup");
        assert_eq!(json["direction"], "inbound");
        assert_eq!(json["duration_seconds"], 42);
        assert_eq!(json["answer_time"], "2024-01-15T08:00:00Z");
    }

    #[tokio::test]
    async fn query_callback_is_accepted() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/callback?uuid=cb-2&caller_number=0721123456")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["caller_number"], "0721123456");
    }

    #[tokio::test]
    async fn callback_without_uuid_is_unprocessable() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/callback")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("caller_number=0721123456"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("uuid"));
    }
}
