//! `conductor serve`: the webhook intake HTTP server plus the dispatcher
//! and sweeper background tasks, with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use conductor_core::error::{as_orchestrator_error, OrchestratorError};
use conductor_core::intake::{self, IntakeOutcome, WebhookEvent};
use conductor_core::orchestrator::OrchestratorContext;
use conductor_core::queue::Dispatcher;
use conductor_core::reactivation::ReactivationDecision;
use conductor_core::sweeper::Sweeper;
use conductor_db::models::ValidationDecision;
use conductor_db::queries::{queue as queue_db, runs as run_db, steps as step_db,
    tickets as ticket_db, validations as validation_db};

// ---------------------------------------------------------------------------
// Signature verification seam
// ---------------------------------------------------------------------------

/// Webhook signature verification. The real check (HMAC against the
/// tracker's secret, mTLS, ...) lives in a surrounding collaborator; the
/// intake only needs the verdict.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> bool;
}

/// Default verifier: accepts everything (deployments front this server with
/// their own gateway).
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    /// Map core error kinds onto response codes.
    pub fn from_core(err: anyhow::Error) -> Self {
        let status = match as_orchestrator_error(&err) {
            Some(OrchestratorError::ValidationConflict { .. }) => StatusCode::CONFLICT,
            Some(OrchestratorError::ValidationExpired { .. }) => StatusCode::GONE,
            Some(OrchestratorError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(OrchestratorError::TicketCoolingDown { .. }) => StatusCode::ACCEPTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State & router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServeState {
    pub ctx: Arc<OrchestratorContext>,
    pub verifier: Arc<dyn SignatureVerifier>,
}

pub fn build_router(ctx: Arc<OrchestratorContext>, verifier: Arc<dyn SignatureVerifier>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks", post(receive_webhook))
        .route("/validations/{uuid}/response", post(receive_validation_response))
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{id}", get(get_ticket_detail))
        .layer(CorsLayer::permissive())
        .with_state(ServeState { ctx, verifier })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run intake, dispatcher, and sweepers until Ctrl+C.
pub async fn run_serve(ctx: Arc<OrchestratorContext>, bind: &str, port: u16) -> Result<()> {
    let shutdown = CancellationToken::new();

    let dispatcher_ctx = Arc::clone(&ctx);
    let dispatcher_shutdown = shutdown.clone();
    let dispatcher = tokio::spawn(async move {
        if let Err(err) = Dispatcher::new(dispatcher_ctx).run(dispatcher_shutdown).await {
            tracing::error!(error = %err, "dispatcher exited with error");
        }
    });

    let sweeper_ctx = Arc::clone(&ctx);
    let sweeper_shutdown = shutdown.clone();
    let sweeper = tokio::spawn(async move {
        Sweeper::new(sweeper_ctx).run(sweeper_shutdown).await;
    });

    let app = build_router(ctx, Arc::new(AcceptAllVerifier));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("conductor serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // The token is cancelled; wait for the background tasks to drain.
    let _ = dispatcher.await;
    let _ = sweeper.await;

    tracing::info!("conductor serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<ServeState>) -> Result<axum::response::Response, AppError> {
    let (pending, running, waiting) = queue_db::queue_depth(&state.ctx.pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({
        "status": "ok",
        "queue": { "pending": pending, "running": running, "waiting_validation": waiting },
    }))
    .into_response())
}

/// The single intake endpoint: 202 accepted, 200 deduped, 400 malformed,
/// 401 signature failure.
async fn receive_webhook(
    State(state): State<ServeState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, AppError> {
    if !state.verifier.verify(&headers, &body) {
        return Ok((StatusCode::UNAUTHORIZED, Json(json!({"error": "bad signature"})))
            .into_response());
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("malformed event: {err}")})),
            )
                .into_response());
        }
    };

    let outcome = match intake::process_event(&state.ctx, &event).await {
        Ok(outcome) => outcome,
        Err(err) => {
            // Reactivation guards report through 202 bodies, not errors.
            if let Some(OrchestratorError::ReactivationDepthExceeded { .. }) =
                as_orchestrator_error(&err)
            {
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(json!({"status": "skipped", "reason": "reactivation_depth_exceeded"})),
                )
                    .into_response());
            }
            return Err(AppError::from_core(err));
        }
    };

    let response = match outcome {
        IntakeOutcome::Deduplicated => (
            StatusCode::OK,
            Json(json!({"status": "duplicate"})),
        ),
        IntakeOutcome::Malformed(reason) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": reason})),
        ),
        IntakeOutcome::Enqueued { entry_id, ticket_id } => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "enqueued", "entry_id": entry_id, "ticket_id": ticket_id})),
        ),
        IntakeOutcome::SkippedCooldown { until } => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "skipped", "reason": "ticket_cooling_down", "until": until})),
        ),
        IntakeOutcome::Reactivation(decision) => {
            let (status_str, reason) = match decision {
                ReactivationDecision::Reactivated { run_id } => {
                    return Ok((
                        StatusCode::ACCEPTED,
                        Json(json!({"status": "reactivated", "run_id": run_id})),
                    )
                        .into_response());
                }
                ReactivationDecision::SkippedCooldown => ("skipped", "ticket_cooling_down"),
                ReactivationDecision::SkippedLocked => ("skipped", "ticket_locked"),
                ReactivationDecision::DepthExceeded => ("skipped", "reactivation_depth_exceeded"),
                ReactivationDecision::Ignored => ("ignored", "not_actionable"),
            };
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": status_str, "reason": reason})),
            )
        }
        IntakeOutcome::ValidationRecorded(_) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "validation_recorded"})),
        ),
    };

    Ok(response.into_response())
}

#[derive(Debug, Deserialize)]
struct ValidationResponseBody {
    status: ValidationDecision,
    #[serde(default)]
    comments: Option<String>,
    #[serde(default)]
    validator_id: Option<String>,
}

/// Dedicated validation-response endpoint; idempotent on the uuid (second
/// call returns 409).
async fn receive_validation_response(
    State(state): State<ServeState>,
    Path(uuid): Path<Uuid>,
    Json(body): Json<ValidationResponseBody>,
) -> Result<axum::response::Response, AppError> {
    let payload = json!({
        "uuid": uuid,
        "status": body.status,
        "comments": body.comments,
        "validator_id": body.validator_id,
    });

    let outcome = intake::record_validation_response(&state.ctx, &payload)
        .await
        .map_err(AppError::from_core)?;

    match outcome {
        IntakeOutcome::ValidationRecorded(disposition) => Ok((
            StatusCode::OK,
            Json(json!({"status": "recorded", "disposition": format!("{disposition:?}")})),
        )
            .into_response()),
        IntakeOutcome::Malformed(reason) => {
            Ok((StatusCode::BAD_REQUEST, Json(json!({"error": reason}))).into_response())
        }
        other => Ok((
            StatusCode::OK,
            Json(json!({"status": other.log_tag()})),
        )
            .into_response()),
    }
}

async fn list_tickets(
    State(state): State<ServeState>,
) -> Result<axum::response::Response, AppError> {
    let tickets = ticket_db::list_tickets(&state.ctx.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tickets).into_response())
}

async fn get_ticket_detail(
    State(state): State<ServeState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let ticket = crate::resolve::resolve_ticket(&state.ctx.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("ticket {id} not found")))?;

    let runs = run_db::list_runs_for_ticket(&state.ctx.pool, ticket.id)
        .await
        .map_err(AppError::internal)?;

    let mut run_details = Vec::with_capacity(runs.len());
    for run in runs {
        let steps = step_db::list_steps_for_run(&state.ctx.pool, run.id)
            .await
            .map_err(AppError::internal)?;
        let validations = validation_db::list_validations_for_run(&state.ctx.pool, run.id)
            .await
            .map_err(AppError::internal)?;
        run_details.push(json!({
            "run": run,
            "steps": steps,
            "validations": validations,
        }));
    }

    let entries = queue_db::list_entries_for_item(&state.ctx.pool, &ticket.external_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({
        "ticket": ticket,
        "runs": run_details,
        "queue_entries": entries,
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use conductor_core::broker::LocalBroker;
    use conductor_core::clock::SystemClock;
    use conductor_core::handler;
    use conductor_core::notify::TracingNotifier;
    use conductor_core::orchestrator::{OrchestratorContext, Settings};
    use conductor_core::reactivation::PayloadClassifier;
    use conductor_db::queries::queue as queue_db;

    use conductor_test_utils::{create_test_db, drop_test_db};

    use super::{build_router, AcceptAllVerifier, SignatureVerifier};

    /// A verifier that refuses everything, for the 401 path.
    struct RejectAllVerifier;

    impl SignatureVerifier for RejectAllVerifier {
        fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> bool {
            false
        }
    }

    async fn test_ctx() -> (Arc<OrchestratorContext>, String) {
        let (pool, db_name) = create_test_db().await;
        let ctx = OrchestratorContext::new(
            pool.clone(),
            handler::passthrough_defaults(),
            Arc::new(LocalBroker::new(pool)),
            Arc::new(TracingNotifier),
            Arc::new(SystemClock),
            Arc::new(PayloadClassifier),
            Settings::for_tests(),
        )
        .await
        .expect("context should build");
        (ctx, db_name)
    }

    async fn post_json(
        ctx: Arc<OrchestratorContext>,
        verifier: Arc<dyn SignatureVerifier>,
        uri: &str,
        body: serde_json::Value,
    ) -> axum::response::Response {
        let app = build_router(ctx, verifier);
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn event(event_id: &str, item_id: &str) -> serde_json::Value {
        json!({
            "source": "tracker",
            "event_id": event_id,
            "event_type": "item_created",
            "payload": {"item_id": item_id, "title": "Add export", "repo": "git://x/y"},
        })
    }

    #[tokio::test]
    async fn accepted_event_returns_202_and_enqueues() {
        let (ctx, db_name) = test_ctx().await;

        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(AcceptAllVerifier),
            "/webhooks",
            event("e1", "T1"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "enqueued");

        let entries = queue_db::list_entries_for_item(&ctx.pool, "T1").await.unwrap();
        assert_eq!(entries.len(), 1);

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn duplicate_event_returns_200() {
        let (ctx, db_name) = test_ctx().await;

        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(AcceptAllVerifier),
            "/webhooks",
            event("e1", "T2"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(AcceptAllVerifier),
            "/webhooks",
            event("e1", "T2"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "duplicate");

        let entries = queue_db::list_entries_for_item(&ctx.pool, "T2").await.unwrap();
        assert_eq!(entries.len(), 1, "dedup keeps one entry");

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn malformed_event_returns_400() {
        let (ctx, db_name) = test_ctx().await;

        // Not even the envelope parses.
        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(AcceptAllVerifier),
            "/webhooks",
            json!({"nope": true}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Envelope parses but the payload is missing item_id.
        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(AcceptAllVerifier),
            "/webhooks",
            json!({
                "source": "tracker",
                "event_id": "e9",
                "event_type": "item_created",
                "payload": {},
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn failed_signature_returns_401() {
        let (ctx, db_name) = test_ctx().await;

        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(RejectAllVerifier),
            "/webhooks",
            event("e1", "T3"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let entries = queue_db::list_entries_for_item(&ctx.pool, "T3").await.unwrap();
        assert!(entries.is_empty(), "rejected event must not enqueue");

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn unknown_validation_uuid_returns_404() {
        let (ctx, db_name) = test_ctx().await;

        let uuid = uuid::Uuid::new_v4();
        let resp = post_json(
            Arc::clone(&ctx),
            Arc::new(AcceptAllVerifier),
            &format!("/validations/{uuid}/response"),
            json!({"status": "approved", "validator_id": "human"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn healthz_reports_queue_depth() {
        let (ctx, db_name) = test_ctx().await;

        let app = build_router(Arc::clone(&ctx), Arc::new(AcceptAllVerifier));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["queue"]["pending"], 0);

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn unknown_ticket_detail_returns_404() {
        let (ctx, db_name) = test_ctx().await;

        let app = build_router(Arc::clone(&ctx), Arc::new(AcceptAllVerifier));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/tickets/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        ctx.pool.close().await;
        drop_test_db(&db_name).await;
    }
}
