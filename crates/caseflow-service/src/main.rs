use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use ulid::Ulid;

use caseflow_bus::{BusError, BusLimits, EventBus};
use caseflow_core::{
    Actor, ActorId, Complaint, ComplaintId, ComplaintPatch, ComplaintStatus, CreateComplaint,
    Frame, LocalId, NotificationId, Priority, Role, SyncError, CORE_CONTRACT_VERSION,
};
use caseflow_store_sqlite::{Committed, ComplaintStats, SqliteChangeStore};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

const BUSINESS_DATE_FORMAT: &[BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    bus: EventBus,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    core_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_version: Option<i64>,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterActorRequest {
    id: ActorId,
    role: Role,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateComplaintRequest {
    summary: String,
    priority: Priority,
    /// Business date of receipt, `YYYY-MM-DD`; its year keys the sequence.
    business_date: String,
    local_id: Option<LocalId>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateComplaintRequest {
    summary: Option<String>,
    status: Option<ComplaintStatus>,
    priority: Option<Priority>,
    expected_version: Option<i64>,
    local_id: Option<LocalId>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeleteQuery {
    local_id: Option<LocalId>,
}

/// Envelope payload for every committed mutation: the client's `SubmitAck`.
#[derive(Debug, Clone, Serialize)]
struct MutationResponse {
    record: Option<Complaint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior: Option<Complaint>,
    already_applied: bool,
    /// Broadcast sequence assigned to the change; `None` on a replay hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    event_seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct NotificationsQuery {
    recipient_id: ActorId,
    unread: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReadAllRequest {
    recipient_id: ActorId,
}

#[derive(Debug, Clone, Serialize)]
struct AcknowledgedResponse {
    acknowledged: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct EventsQuery {
    recipient_id: ActorId,
    last_seen: Option<u64>,
}

/// One polling drain: unread notifications first, then every change frame
/// the lookback ring still covers past `last_seen`.
#[derive(Debug, Clone, Serialize)]
struct EventsResponse {
    resync_required: bool,
    latest_seq: u64,
    frames: Vec<Frame>,
}

#[derive(Debug, Parser)]
#[command(name = "caseflow-service")]
#[command(about = "Local HTTP service for CaseFlow")]
struct Args {
    #[arg(long, default_value = "./caseflow.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, error: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: error.into(),
            expected_version: None,
            current_version: None,
            status,
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }
}

impl From<SyncError> for ServiceError {
    fn from(err: SyncError) -> Self {
        match &err {
            SyncError::Conflict { expected, current, .. } => {
                let mut service_err =
                    Self::new(StatusCode::CONFLICT, "version_conflict", err.to_string());
                service_err.expected_version = Some(*expected);
                service_err.current_version = Some(*current);
                service_err
            }
            SyncError::ReplayMismatch { .. } => {
                Self::new(StatusCode::CONFLICT, "replay_mismatch", err.to_string())
            }
            SyncError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            SyncError::Validation(_) => Self::validation(err.to_string()),
            SyncError::AllocationContention | SyncError::TransportUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
            }
            SyncError::Storage(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", err.to_string())
            }
        }
    }
}

impl From<BusError> for ServiceError {
    fn from(err: BusError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "bus", err.to_string())
    }
}

impl ServiceState {
    /// Per-request connection; the schema is migrated once at startup.
    fn open_store(&self) -> Result<SqliteChangeStore, ServiceError> {
        Ok(SqliteChangeStore::open(&self.db_path)?)
    }

    /// Publish a committed mutation strictly after its transaction: first the
    /// change frame to every connection, then notifications to their
    /// recipients. A replay hit carries no change and publishes nothing.
    fn broadcast(&self, committed: &Committed) -> Result<Option<u64>, ServiceError> {
        let seq = match &committed.change {
            Some(change) => Some(self.bus.publish(change)?),
            None => None,
        };
        for notification in &committed.notifications {
            self.bus.publish_notification(notification)?;
        }
        Ok(seq)
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        core_contract_version: CORE_CONTRACT_VERSION,
        data,
    }
}

fn mutation_response(committed: Committed, event_seq: Option<u64>) -> MutationResponse {
    MutationResponse {
        record: committed.record,
        prior: committed.prior,
        already_applied: committed.already_applied,
        event_seq,
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ServiceError> {
    let id = header_value(headers, "x-actor-id")?;
    let id = Ulid::from_string(id)
        .map(ActorId)
        .map_err(|err| ServiceError::validation(format!("invalid x-actor-id: {err}")))?;
    let role = header_value(headers, "x-actor-role")?;
    let role = Role::parse(role)
        .ok_or_else(|| ServiceError::validation("x-actor-role must be staff or field"))?;
    Ok(Actor { id, role })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ServiceError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ServiceError::validation(format!("missing {name} header")))
}

fn parse_complaint_id(raw: &str) -> Result<ComplaintId, ServiceError> {
    Ulid::from_string(raw)
        .map(ComplaintId)
        .map_err(|err| ServiceError::validation(format!("invalid complaint id: {err}")))
}

fn parse_business_date(raw: &str) -> Result<time::Date, ServiceError> {
    time::Date::parse(raw, BUSINESS_DATE_FORMAT)
        .map_err(|err| ServiceError::validation(format!("invalid business_date: {err}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/actors", post(actors_register))
        .route("/v1/complaints", post(complaints_create).get(complaints_list))
        .route("/v1/complaints/stats", get(complaints_stats))
        .route(
            "/v1/complaints/:id",
            get(complaints_show).patch(complaints_update).delete(complaints_delete),
        )
        .route("/v1/notifications", get(notifications_list))
        .route("/v1/notifications/read-all", post(notifications_read_all))
        .route("/v1/notifications/:id/read", post(notifications_read))
        .route("/v1/events", get(events_poll))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    SqliteChangeStore::open(&args.db)?.migrate()?;

    let state = ServiceState { db_path: args.db, bus: EventBus::new(BusLimits::default()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "caseflow service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn actors_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterActorRequest>,
) -> Result<Json<ServiceEnvelope<Actor>>, ServiceError> {
    let actor = Actor { id: request.id, role: request.role };
    state.open_store()?.register_actor(actor)?;
    Ok(Json(envelope(actor)))
}

async fn complaints_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateComplaintRequest>,
) -> Result<Json<ServiceEnvelope<MutationResponse>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let input = CreateComplaint {
        summary: request.summary,
        priority: request.priority,
        business_date: parse_business_date(&request.business_date)?,
    };

    let mut store = state.open_store()?;
    let committed = store.create(&input, actor, request.local_id)?;
    let event_seq = state.broadcast(&committed)?;
    if let Some(record) = &committed.record {
        tracing::info!(
            actor = %actor.id,
            record = %record.id,
            already_applied = committed.already_applied,
            "complaint created"
        );
    }
    Ok(Json(envelope(mutation_response(committed, event_seq))))
}

async fn complaints_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Complaint>>>, ServiceError> {
    let records = state.open_store()?.list()?;
    Ok(Json(envelope(records)))
}

async fn complaints_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ComplaintStats>>, ServiceError> {
    let stats = state.open_store()?.stats()?;
    Ok(Json(envelope(stats)))
}

async fn complaints_show(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Complaint>>, ServiceError> {
    let id = parse_complaint_id(&id)?;
    let record = state.open_store()?.get(id)?.ok_or(SyncError::NotFound(id))?;
    Ok(Json(envelope(record)))
}

async fn complaints_update(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateComplaintRequest>,
) -> Result<Json<ServiceEnvelope<MutationResponse>>, ServiceError> {
    let id = parse_complaint_id(&id)?;
    let actor = actor_from_headers(&headers)?;
    let patch = ComplaintPatch {
        summary: request.summary,
        status: request.status,
        priority: request.priority,
    };

    let mut store = state.open_store()?;
    let committed = store.update(id, &patch, actor, request.expected_version, request.local_id)?;
    let event_seq = state.broadcast(&committed)?;
    Ok(Json(envelope(mutation_response(committed, event_seq))))
}

async fn complaints_delete(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<ServiceEnvelope<MutationResponse>>, ServiceError> {
    let id = parse_complaint_id(&id)?;
    let actor = actor_from_headers(&headers)?;

    let mut store = state.open_store()?;
    let committed = store.delete(id, actor, query.local_id)?;
    let event_seq = state.broadcast(&committed)?;
    Ok(Json(envelope(mutation_response(committed, event_seq))))
}

async fn notifications_list(
    State(state): State<ServiceState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<ServiceEnvelope<Vec<caseflow_core::NotificationEvent>>>, ServiceError> {
    let unread_only = query.unread.unwrap_or(false);
    let events = state.open_store()?.notifications_for(query.recipient_id, unread_only)?;
    Ok(Json(envelope(events)))
}

async fn notifications_read(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<AcknowledgedResponse>>, ServiceError> {
    let id = Ulid::from_string(&id)
        .map(NotificationId)
        .map_err(|err| ServiceError::validation(format!("invalid notification id: {err}")))?;
    let acknowledged = state.open_store()?.mark_notification_read(id)?;
    if !acknowledged {
        return Err(ServiceError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("notification not found: {id}"),
        ));
    }
    Ok(Json(envelope(AcknowledgedResponse { acknowledged: 1 })))
}

async fn notifications_read_all(
    State(state): State<ServiceState>,
    Json(request): Json<ReadAllRequest>,
) -> Result<Json<ServiceEnvelope<AcknowledgedResponse>>, ServiceError> {
    let acknowledged = state.open_store()?.mark_all_notifications_read(request.recipient_id)?;
    Ok(Json(envelope(AcknowledgedResponse { acknowledged })))
}

/// One subscribe-drain-unsubscribe cycle against the bus. Unread persisted
/// notifications come first so a reconnecting client never misses them, then
/// whatever the lookback ring replayed past `last_seen`.
async fn events_poll(
    State(state): State<ServiceState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<ServiceEnvelope<EventsResponse>>, ServiceError> {
    let unread = state.open_store()?.notifications_for(query.recipient_id, true)?;

    let mut subscription = state.bus.subscribe(query.recipient_id, query.last_seen)?;
    let mut frames: Vec<Frame> = unread.into_iter().map(Frame::Notification).collect();
    while let Ok(frame) = subscription.receiver.try_recv() {
        frames.push(frame);
    }
    state.bus.unsubscribe(subscription.connection_id)?;

    let latest_seq = state.bus.latest_seq()?;
    Ok(Json(envelope(EventsResponse {
        resync_required: subscription.resync_required,
        latest_seq,
        frames,
    })))
}
