//! REST API handlers for chain triggers, operator actions, interaction
//! ingestion and operational endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use dripline_chains::approval::ApprovalGate;
use dripline_chains::types::{
    ApprovalDecision, ApprovalDraft, CancelTrigger, ChainDefinition, ChainProcess, ChainStats,
    DraftStatus, EnrollmentTrigger,
};
use dripline_chains::ChainOrchestrator;
use dripline_channels::{EmailWebhookEvent, InteractionLog, OperatorInbox, ProfileTags, SendGridMailer};
use dripline_core::delivery::DecisionRequest;
use dripline_core::types::{InteractionEvent, InteractionKind};
use dripline_core::ChainError;

/// Maximum string field length (subscriber id, trigger key, ...).
const MAX_FIELD_LEN: usize = 256;

/// Maximum number of events in one webhook batch.
const MAX_WEBHOOK_BATCH: usize = 1000;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ChainOrchestrator,
    pub mailer: Arc<SendGridMailer>,
    pub interactions: Arc<InteractionLog>,
    pub inbox: Arc<OperatorInbox>,
    pub tags: Arc<ProfileTags>,
    pub node_id: String,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn bad_request(error: &str, message: impl Into<String>) -> ApiError {
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Maps engine errors onto HTTP statuses.
fn chain_error(e: ChainError) -> ApiError {
    let (status, code) = match &e {
        ChainError::ProcessNotFound(_) => (StatusCode::NOT_FOUND, "process_not_found"),
        ChainError::DraftNotFound(_) => (StatusCode::NOT_FOUND, "draft_not_found"),
        ChainError::ChainNotFound(_) => (StatusCode::NOT_FOUND, "chain_not_found"),
        ChainError::DuplicateEnrollment { .. } => (StatusCode::CONFLICT, "duplicate_enrollment"),
        ChainError::DraftAlreadyResolved { .. } => (StatusCode::CONFLICT, "draft_already_resolved"),
        ChainError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        ChainError::StoreWriteConflict { .. } | ChainError::LeaseLost(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "write_conflict")
        }
        ChainError::InvalidDefinition(_) => (StatusCode::BAD_REQUEST, "invalid_definition"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        error!(error = %e, "Request failed");
        metrics::counter!("api.errors").increment(1);
    }
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: e.to_string(),
        }),
    )
}

fn validate_field(name: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(bad_request("invalid_request", format!("'{}' must not be empty", name)));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(bad_request(
            "invalid_request",
            format!("'{}' exceeds maximum length", name),
        ));
    }
    Ok(())
}

// ─── Triggers ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollmentResult {
    pub chain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub trigger_key: String,
    pub subscriber_id: String,
    pub enrollments: Vec<EnrollmentResult>,
}

/// POST /v1/triggers/enroll: Enroll a subscriber in every chain listening
/// to the trigger key.
pub async fn handle_enroll(
    State(state): State<AppState>,
    Json(trigger): Json<EnrollmentTrigger>,
) -> ApiResult<EnrollResponse> {
    validate_field("trigger_key", &trigger.trigger_key)?;
    validate_field("subscriber_id", &trigger.subscriber_id)?;
    if !trigger.context.email.contains('@') {
        return Err(bad_request("invalid_request", "'context.email' must be an email address"));
    }

    let enrollments = state
        .orchestrator
        .handle_enrollment_trigger(&trigger)
        .into_iter()
        .map(|(chain_id, result)| match result {
            Ok(process_id) => EnrollmentResult {
                chain_id,
                process_id: Some(process_id),
                error: None,
            },
            Err(e) => EnrollmentResult {
                chain_id,
                process_id: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Ok(Json(EnrollResponse {
        trigger_key: trigger.trigger_key,
        subscriber_id: trigger.subscriber_id,
        enrollments,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: Vec<Uuid>,
}

/// POST /v1/triggers/cancel: Cancel a subscriber's open processes in one
/// chain, or in every chain started by a trigger key.
pub async fn handle_cancel_trigger(
    State(state): State<AppState>,
    Json(trigger): Json<CancelTrigger>,
) -> ApiResult<CancelResponse> {
    validate_field("subscriber_id", &trigger.subscriber_id)?;
    if trigger.chain_id.is_none() && trigger.match_key.is_none() {
        return Err(bad_request(
            "invalid_request",
            "one of 'chain_id' or 'match_key' is required",
        ));
    }

    let cancelled = state
        .orchestrator
        .cancel_trigger(&trigger)
        .map_err(chain_error)?;
    for process_id in &cancelled {
        dismiss_awaited(&state, *process_id);
    }
    Ok(Json(CancelResponse { cancelled }))
}

// ─── Drafts ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct DecisionBody {
    pub decision: ApprovalDecision,
}

/// POST /v1/drafts/:id/decision: Approve or reject a pending draft.
pub async fn handle_decision(
    State(state): State<AppState>,
    Path(draft_id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<ApprovalDraft> {
    let draft = state
        .orchestrator
        .decide(draft_id, body.decision)
        .await
        .map_err(chain_error)?;
    state.inbox.dismiss(draft_id);
    info!(draft_id = %draft_id, status = %draft.status, "Operator decision applied");
    Ok(Json(draft))
}

/// GET /v1/drafts: Decision requests still waiting on an operator.
pub async fn list_pending_drafts(State(state): State<AppState>) -> Json<Vec<DecisionRequest>> {
    let pending = state
        .inbox
        .pending()
        .into_iter()
        .filter(|request| {
            let still_pending = state
                .orchestrator
                .get_draft(request.draft_id)
                .map(|d| d.status == DraftStatus::Pending)
                .unwrap_or(false);
            if !still_pending {
                state.inbox.dismiss(request.draft_id);
            }
            still_pending
        })
        .collect();
    Json(pending)
}

/// GET /v1/drafts/:id
pub async fn get_draft(
    State(state): State<AppState>,
    Path(draft_id): Path<Uuid>,
) -> ApiResult<ApprovalDraft> {
    state
        .orchestrator
        .get_draft(draft_id)
        .map(Json)
        .map_err(chain_error)
}

// ─── Processes ──────────────────────────────────────────────────────────

/// GET /v1/processes/:id
pub async fn get_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
) -> ApiResult<ChainProcess> {
    state
        .orchestrator
        .get_process(process_id)
        .map(Json)
        .map_err(chain_error)
}

/// POST /v1/processes/:id/pause
pub async fn pause_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
) -> ApiResult<ChainProcess> {
    state
        .orchestrator
        .pause(process_id)
        .map(Json)
        .map_err(chain_error)
}

/// POST /v1/processes/:id/resume
pub async fn resume_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
) -> ApiResult<ChainProcess> {
    state
        .orchestrator
        .resume(process_id)
        .map(Json)
        .map_err(chain_error)
}

/// POST /v1/processes/:id/cancel
pub async fn cancel_process(
    State(state): State<AppState>,
    Path(process_id): Path<Uuid>,
) -> ApiResult<ChainProcess> {
    let process = state
        .orchestrator
        .cancel(process_id, Some("operator"))
        .map_err(chain_error)?;
    dismiss_awaited(&state, process_id);
    Ok(Json(process))
}

fn dismiss_awaited(state: &AppState, process_id: Uuid) {
    if let Ok(process) = state.orchestrator.get_process(process_id) {
        if let Some(draft_id) = ApprovalGate::awaited_draft(&process) {
            state.inbox.dismiss(draft_id);
        }
    }
}

/// Interactions returned with a subscriber view.
const RECENT_INTERACTIONS: usize = 50;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriberView {
    pub subscriber_id: String,
    pub tags: Vec<String>,
    pub processes: Vec<ChainProcess>,
    /// Newest first.
    pub recent_interactions: Vec<InteractionEvent>,
}

/// GET /v1/subscribers/:id: Processes, tags and recent interactions of one
/// subscriber.
pub async fn get_subscriber(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
) -> Json<SubscriberView> {
    Json(SubscriberView {
        tags: state.tags.tags_for(&subscriber_id),
        processes: state.orchestrator.processes_for_subscriber(&subscriber_id),
        recent_interactions: state.interactions.recent(&subscriber_id, RECENT_INTERACTIONS),
        subscriber_id,
    })
}

// ─── Chains ─────────────────────────────────────────────────────────────

/// GET /v1/chains
pub async fn list_chains(State(state): State<AppState>) -> Json<Vec<ChainDefinition>> {
    Json(
        state
            .orchestrator
            .catalog()
            .list()
            .into_iter()
            .map(|c| c.as_ref().clone())
            .collect(),
    )
}

/// GET /v1/chains/:id/stats
pub async fn chain_stats(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> ApiResult<ChainStats> {
    state
        .orchestrator
        .chain_stats(&chain_id)
        .map(Json)
        .map_err(chain_error)
}

// ─── Interactions ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct InteractionBody {
    pub subscriber_id: String,
    pub kind: InteractionKind,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub ignored: usize,
}

/// POST /v1/interactions: Record a subscriber interaction directly.
pub async fn record_interaction(
    State(state): State<AppState>,
    Json(body): Json<InteractionBody>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    validate_field("subscriber_id", &body.subscriber_id)?;

    let mut event = InteractionEvent::new(
        body.subscriber_id,
        body.kind,
        body.occurred_at.unwrap_or_else(Utc::now),
    );
    if let Some(reference) = body.reference {
        event = event.with_reference(reference);
    }
    let accepted = state.interactions.record(event);
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: usize::from(accepted),
            ignored: usize::from(!accepted),
        }),
    ))
}

/// POST /v1/webhooks/email: SendGrid event webhook (batched).
pub async fn handle_email_webhook(
    State(state): State<AppState>,
    Json(events): Json<Vec<EmailWebhookEvent>>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    if events.len() > MAX_WEBHOOK_BATCH {
        warn!(count = events.len(), "Webhook batch too large");
        return Err(bad_request("invalid_webhook", "webhook batch exceeds maximum size"));
    }

    let accepted = events
        .iter()
        .filter(|event| state.mailer.process_webhook(event).is_some())
        .count();
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted,
            ignored: events.len() - accepted,
        }),
    ))
}

// ─── Operational ────────────────────────────────────────────────────────

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        chains: state.orchestrator.catalog().len(),
    })
}

/// GET /ready: Readiness probe. Ready once at least one chain is loaded.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.orchestrator.catalog().is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /live: Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub chains: usize,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}
