//! Local operator surface: a read-only status snapshot plus the two manual
//! timer commands. Cancel is irreversible, so it is gated behind an explicit
//! `confirm=true` query parameter.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::info;

use crate::api::CommandOutcome;
use crate::command::CommandDispatcher;
use crate::duration::parse_manual_input;
use crate::schedule::ZoneId;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Router state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub dispatcher: CommandDispatcher,
    pub pending_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route(
            "/api/zones/{id}/timer",
            axum::routing::post(start_timer).delete(cancel_timer),
        )
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status(app.pending_timeout))
}

#[derive(Deserialize)]
struct StartBody {
    /// Direct duration in seconds…
    seconds: Option<u32>,
    /// …or operator-typed text run through the manual-entry parser.
    input: Option<String>,
    #[serde(default)]
    legacy: bool,
}

async fn start_timer(
    State(app): State<AppState>,
    Path(id): Path<ZoneId>,
    Json(body): Json<StartBody>,
) -> impl IntoResponse {
    if !zone_known(&app, id).await {
        return (StatusCode::NOT_FOUND, format!("unknown zone {id}")).into_response();
    }

    let seconds = match (body.seconds, body.input) {
        (Some(s), _) if s > 0 => s,
        (_, Some(text)) => match parse_manual_input(&text, body.legacy) {
            Ok(d) => {
                // Buffer the typed text; a successful start consumes it, a
                // failed one leaves it for the operator to retry.
                app.shared.write().await.manual_input.insert(id, text);
                d.total_seconds()
            }
            Err(e) => {
                return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response();
            }
        },
        _ => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                "provide seconds or input".to_string(),
            )
                .into_response();
        }
    };

    outcome_response(app.dispatcher.start_manual_timer(id, seconds).await)
}

#[derive(Deserialize)]
struct CancelQuery {
    #[serde(default)]
    confirm: bool,
}

async fn cancel_timer(
    State(app): State<AppState>,
    Path(id): Path<ZoneId>,
    Query(q): Query<CancelQuery>,
) -> impl IntoResponse {
    if !q.confirm {
        return (
            StatusCode::BAD_REQUEST,
            "cancel is irreversible; pass confirm=true".to_string(),
        )
            .into_response();
    }
    if !zone_known(&app, id).await {
        return (StatusCode::NOT_FOUND, format!("unknown zone {id}")).into_response();
    }
    outcome_response(app.dispatcher.cancel_timer(id).await)
}

async fn zone_known(app: &AppState, id: ZoneId) -> bool {
    let st = app.shared.read().await;
    // Before the first schedule fetch, accept any id the poller has seen.
    st.zone(id).is_some() || st.runtime.contains_key(&id) || st.zones.is_empty()
}

fn outcome_response(outcome: CommandOutcome) -> axum::response::Response {
    match outcome {
        CommandOutcome::Ok => Json(serde_json::json!({"ok": true})).into_response(),
        CommandOutcome::Transient(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
        CommandOutcome::Rejected(msg) => (StatusCode::CONFLICT, msg).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("operator api listening on http://{addr}");

    axum::serve(listener, router(app))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::schedule::{Period, TimeSlot, Zone, ZoneMode};
    use crate::state::SupervisorState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::util::ServiceExt;

    fn test_app() -> (AppState, SharedState) {
        let shared: SharedState = Arc::new(RwLock::new(SupervisorState::new()));
        // Backend is unreachable; command tests only exercise request
        // validation, which never gets that far.
        let client = ApiClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        let app = AppState {
            shared: shared.clone(),
            dispatcher: CommandDispatcher::new(client, shared.clone()),
            pending_timeout: Duration::from_secs(30),
        };
        (app, shared)
    }

    fn test_zone(id: ZoneId) -> Zone {
        Zone {
            zone_id: id,
            mode: ZoneMode::Active,
            period: Period::Daily,
            cycles: 1,
            start_day: None,
            slots: vec![TimeSlot {
                code: "07:00".to_string(),
                duration_secs: 600,
            }],
        }
    }

    // -- status --------------------------------------------------------------

    #[tokio::test]
    async fn status_returns_snapshot() {
        let (app, shared) = test_app();
        shared.write().await.zones.push(test_zone(1));

        let resp = router(app)
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["zones"][0]["zone_id"], 1);
        assert_eq!(json["zones"][0]["color"], "gray");
    }

    // -- cancel gating -------------------------------------------------------

    #[tokio::test]
    async fn cancel_without_confirm_is_rejected() {
        let (app, shared) = test_app();
        shared.write().await.zones.push(test_zone(1));

        let resp = router(app)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/zones/1/timer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_idle_zone_with_confirm_is_ok_noop() {
        let (app, shared) = test_app();
        shared.write().await.zones.push(test_zone(1));

        let resp = router(app)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/zones/1/timer?confirm=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // No pending action and no active timer: the dispatcher no-ops
        // without touching the (unreachable) backend.
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // -- start validation ----------------------------------------------------

    #[tokio::test]
    async fn start_unknown_zone_is_404() {
        let (app, shared) = test_app();
        shared.write().await.zones.push(test_zone(1));

        let resp = router(app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/zones/99/timer")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"seconds": 600}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_bad_manual_input_is_422() {
        let (app, shared) = test_app();
        shared.write().await.zones.push(test_zone(1));

        let resp = router(app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/zones/1/timer")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"input": "24:00:00"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let msg = String::from_utf8_lossy(&bytes);
        assert!(msg.contains("hours"), "field-specific message, got: {msg}");
    }

    #[tokio::test]
    async fn start_with_unreachable_backend_is_502() {
        let (app, shared) = test_app();
        shared.write().await.zones.push(test_zone(1));

        let resp = router(app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/zones/1/timer")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"seconds": 600}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        // And the optimistic state was rolled back.
        let st = shared.read().await;
        assert!(!st.is_pending(1));
    }
}
