//! HTTP API handlers for Gestparc.
//!
//! Every handler runs the lifecycle rules from [`crate::lifecycle`] against
//! the stored record, then persists the result through [`Storage`]. Writes
//! to an existing report are conditional on the version that was read, so
//! two reviewers acting on the same report cannot both succeed: the loser
//! gets `409 Conflict` and has to re-fetch.
//!
//! The acting user is carried by the `X-Actor-Id` and `X-Actor-Role`
//! headers. Requests without them are rejected with `401`.
//!
//! # Error mapping
//!
//! | Rejection                                   | Status |
//! |---------------------------------------------|--------|
//! | input rule ([`Violation`])                  | 422    |
//! | role or assignment rule                     | 403    |
//! | state rule, stale version, duplicate report | 409    |
//! | unknown id                                  | 404    |

use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use chrono::Utc;
use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
use crate::error::Violation;
use crate::lifecycle::{self, LeadTimePolicy};
use crate::model::{
    Actor, AssignRequest, ErrorBody, Incident, IncidentId, InvalidateRequest, NewIncident,
    Notification, NotificationId, NotificationKind, NotificationPayload, NotificationsQuery,
    PlanRequest, PushEvent, Report, ReportId, ReportSubmission, ReportsQuery, Role,
};
use crate::scheduling::SchedulingBoard;
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub events: broadcast::Sender<PushEvent>,
    pub lead_time: LeadTimePolicy,
}

impl AppState {
    pub fn new(storage: Storage, lead_time: LeadTimePolicy, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            storage,
            events,
            lead_time,
        }
    }

    fn publish(&self, event: PushEvent) {
        // No subscriber is not an error: the notification is stored anyway
        if let Err(e) = self.events.send(event) {
            debug!(event = e.0.name(), "No live subscriber for event");
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/incidents", post(create_incident))
        .route("/incidents/:id", get(get_incident))
        .route("/incidents/:id/rapport", get(get_incident_report))
        .route("/incidents/:id/technicien", post(assign_technician))
        .route("/rapports", get(list_reports).post(create_report))
        .route("/rapports/:id", get(get_report).patch(update_report))
        .route("/rapports/:id/valider", post(validate_report))
        .route("/rapports/:id/invalider", post(invalidate_report))
        .route("/rapports/:id/planification", put(plan_report))
        .route("/planification", get(scheduling_board))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/lu", post(mark_notification_read))
        .route("/events", get(events))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ============================================================================
// Errors and extractors
// ============================================================================

/// Rejection of an API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] Violation),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Rejected(v) if v.is_state_conflict() => StatusCode::CONFLICT,
            ApiError::Rejected(v) if v.is_forbidden() => StatusCode::FORBIDDEN,
            ApiError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Violation> for ErrorBody {
    fn from(violation: Violation) -> Self {
        let kind = if violation.is_state_conflict() {
            "conflict"
        } else if violation.is_forbidden() {
            "forbidden"
        } else {
            "validation"
        };
        ErrorBody {
            kind: kind.to_string(),
            message: violation.to_string(),
            violation: Some(violation),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Rejected(violation) => ErrorBody::from(violation),
            ApiError::Internal(e) => {
                error!(error = %e, "Request failed");
                ErrorBody {
                    kind: "internal".to_string(),
                    message: "internal error".to_string(),
                    violation: None,
                }
            }
            other => {
                let kind = match other {
                    ApiError::NotFound(_) => "not_found",
                    ApiError::Conflict(_) => "conflict",
                    _ => "unauthorized",
                };
                ErrorBody {
                    kind: kind.to_string(),
                    message: other.to_string(),
                    violation: None,
                }
            }
        };
        (status, Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        let id = header(ACTOR_ID_HEADER)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ApiError::Unauthorized(format!("missing or invalid {ACTOR_ID_HEADER}")))?;
        let role = header(ACTOR_ROLE_HEADER)
            .and_then(Role::parse)
            .ok_or_else(|| {
                ApiError::Unauthorized(format!("missing or invalid {ACTOR_ROLE_HEADER}"))
            })?;

        Ok(Actor::new(id, role))
    }
}

async fn load_incident(state: &AppState, id: IncidentId) -> Result<Incident, ApiError> {
    state
        .storage
        .get_incident(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("incident {id}")))
}

async fn load_report(state: &AppState, id: ReportId) -> Result<Report, ApiError> {
    state
        .storage
        .get_report(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("report {id}")))
}

/// Persist a transition computed from `report`, unless someone else wrote first.
async fn save_transition(state: &AppState, next: &Report) -> Result<Report, ApiError> {
    match state.storage.update_report(next).await? {
        Some(saved) => Ok(saved),
        None => {
            warn!(
                report_id = next.id,
                version = next.version,
                "Stale report version, transition refused"
            );
            Err(ApiError::Conflict(format!(
                "report {} was modified concurrently, reload it",
                next.id
            )))
        }
    }
}

// ============================================================================
// Incidents
// ============================================================================

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// POST /incidents - Declare an incident.
///
/// Notifies the IT managers (`RESPONSABLE_SI`) and pushes an `incident`
/// event to their live channels.
#[instrument(skip(state, request), fields(actor_id = actor.id))]
pub async fn create_incident(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<NewIncident>,
) -> Result<(StatusCode, Json<Incident>), ApiError> {
    let incident = lifecycle::declare_incident(&request, &actor, Utc::now(), &state.lead_time)?;
    let incident = state.storage.insert_incident(&incident).await?;

    let notification = state
        .storage
        .insert_notification(&Notification {
            id: 0,
            kind: NotificationKind::Incident,
            lu: false,
            destinataire_role: Role::ResponsableSi,
            destinataire: None,
            payload: NotificationPayload::for_incident(&incident),
            date_creation: Utc::now(),
        })
        .await?;
    state.publish(PushEvent::Incident(notification));

    info!(
        incident_id = incident.id,
        priorite = %incident.priorite,
        echeance = %incident.echeance,
        "Incident declared"
    );
    Ok((StatusCode::CREATED, Json(incident)))
}

/// GET /incidents/:id
#[instrument(skip(state, _actor))]
pub async fn get_incident(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<IncidentId>,
) -> Result<Json<Incident>, ApiError> {
    Ok(Json(load_incident(&state, id).await?))
}

/// GET /incidents/:id/rapport - The report of an incident, `404` if none yet.
#[instrument(skip(state, _actor))]
pub async fn get_incident_report(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<IncidentId>,
) -> Result<Json<Report>, ApiError> {
    load_incident(&state, id).await?;
    state
        .storage
        .get_report_by_incident(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("report of incident {id}")))
}

/// POST /incidents/:id/technicien - Assign the technician in charge.
///
/// Pushes an `incident_assign` event to the assigned technician.
#[instrument(skip(state, request), fields(actor_id = actor.id, technicien = request.technicien_id))]
pub async fn assign_technician(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<IncidentId>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<Incident>, ApiError> {
    let incident = load_incident(&state, id).await?;
    let existing = state.storage.get_report_by_incident(id).await?;
    let assigned =
        lifecycle::assign_technician(&incident, existing.as_ref(), &actor, request.technicien_id)?;

    if !state
        .storage
        .assign_technician(id, request.technicien_id)
        .await?
    {
        // A report was submitted between the read and the write
        return Err(Violation::WorkAlreadyStarted.into());
    }

    let notification = state
        .storage
        .insert_notification(&Notification {
            id: 0,
            kind: NotificationKind::Incident,
            lu: false,
            destinataire_role: Role::Technicien,
            destinataire: Some(request.technicien_id),
            payload: NotificationPayload::for_incident(&assigned),
            date_creation: Utc::now(),
        })
        .await?;
    state.publish(PushEvent::IncidentAssign(notification));

    info!(incident_id = id, "Technician assigned");
    Ok(Json(assigned))
}

// ============================================================================
// Reports
// ============================================================================

/// GET /rapports - List reports, optionally filtered by `statut`.
#[instrument(skip(state, _actor))]
pub async fn list_reports(
    State(state): State<AppState>,
    _actor: Actor,
    Query(query): Query<ReportsQuery>,
) -> Result<Json<Vec<Report>>, ApiError> {
    Ok(Json(state.storage.list_reports(query.statut).await?))
}

/// POST /rapports - First submission of the report of an incident.
#[instrument(skip(state, submission), fields(actor_id = actor.id, incident_id = submission.incident_id))]
pub async fn create_report(
    State(state): State<AppState>,
    actor: Actor,
    Json(submission): Json<ReportSubmission>,
) -> Result<(StatusCode, Json<Report>), ApiError> {
    let incident = load_incident(&state, submission.incident_id).await?;
    if let Some(existing) = state.storage.get_report_by_incident(incident.id).await? {
        return Err(ApiError::Conflict(format!(
            "incident {} already has report {}",
            incident.id, existing.id
        )));
    }

    let report = lifecycle::submit_report(&incident, None, &submission, &actor, Utc::now())?;
    let report = state.storage.insert_report(&report).await?.ok_or_else(|| {
        ApiError::Conflict(format!("incident {} already has a report", incident.id))
    })?;

    info!(
        report_id = report.id,
        incident_id = incident.id,
        resolution = report.nature_resolution.as_str(),
        "Report submitted"
    );
    Ok((StatusCode::CREATED, Json(report)))
}

/// GET /rapports/:id
#[instrument(skip(state, _actor))]
pub async fn get_report(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<ReportId>,
) -> Result<Json<Report>, ApiError> {
    Ok(Json(load_report(&state, id).await?))
}

/// PATCH /rapports/:id - Resubmit a report, typically after a correction request.
#[instrument(skip(state, submission), fields(actor_id = actor.id))]
pub async fn update_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<ReportId>,
    Json(submission): Json<ReportSubmission>,
) -> Result<Json<Report>, ApiError> {
    let current = load_report(&state, id).await?;
    if current.incident_id != submission.incident_id {
        return Err(Violation::IncidentMismatch {
            expected: current.incident_id,
            submitted: submission.incident_id,
        }
        .into());
    }
    let incident = load_incident(&state, current.incident_id).await?;

    let next =
        lifecycle::submit_report(&incident, Some(&current), &submission, &actor, Utc::now())?;
    let saved = save_transition(&state, &next).await?;

    info!(report_id = id, from = %current.statut, "Report resubmitted");
    Ok(Json(saved))
}

/// POST /rapports/:id/valider - Close a report.
#[instrument(skip(state), fields(actor_id = actor.id))]
pub async fn validate_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<ReportId>,
) -> Result<Json<Report>, ApiError> {
    let current = load_report(&state, id).await?;
    let next = lifecycle::validate(&current, &actor, Utc::now())?;
    let saved = save_transition(&state, &next).await?;

    info!(report_id = id, from = %current.statut, "Report validated");
    Ok(Json(saved))
}

/// POST /rapports/:id/invalider - Send a report back for correction.
#[instrument(skip(state, request), fields(actor_id = actor.id))]
pub async fn invalidate_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<ReportId>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<Report>, ApiError> {
    let current = load_report(&state, id).await?;
    let next = lifecycle::invalidate(&current, &actor, &request.remarque)?;
    let saved = save_transition(&state, &next).await?;

    info!(report_id = id, from = %current.statut, "Report sent back for correction");
    Ok(Json(saved))
}

/// PUT /rapports/:id/planification - Set or clear (`null`) the planning date.
#[instrument(skip(state), fields(actor_id = actor.id))]
pub async fn plan_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<ReportId>,
    Json(request): Json<PlanRequest>,
) -> Result<Json<Report>, ApiError> {
    let current = load_report(&state, id).await?;
    let next = match request.date_planification {
        Some(date) => lifecycle::plan(&current, &actor, date, Utc::now().date_naive())?,
        None => lifecycle::unplan(&current, &actor)?,
    };
    let saved = save_transition(&state, &next).await?;

    info!(
        report_id = id,
        date_planification = ?saved.date_planification,
        "Report planning updated"
    );
    Ok(Json(saved))
}

/// GET /planification - Reports awaiting a date and reports already planned.
#[instrument(skip(state, _actor))]
pub async fn scheduling_board(
    State(state): State<AppState>,
    _actor: Actor,
) -> Result<Json<SchedulingBoard>, ApiError> {
    let reports = state.storage.list_reports(None).await?;
    Ok(Json(SchedulingBoard::from_reports(reports)))
}

// ============================================================================
// Notifications and push channel
// ============================================================================

/// GET /notifications - Notifications addressed to the caller, newest first.
#[instrument(skip(state), fields(actor_id = actor.id))]
pub async fn list_notifications(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    Ok(Json(
        state
            .storage
            .list_notifications(&actor, query.non_lues)
            .await?,
    ))
}

/// POST /notifications/:id/lu - Mark a notification read.
#[instrument(skip(state), fields(actor_id = actor.id))]
pub async fn mark_notification_read(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<NotificationId>,
) -> Result<Json<Notification>, ApiError> {
    state
        .storage
        .mark_notification_read(id, &actor)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("notification {id}")))
}

/// GET /events - Server-sent events addressed to the caller.
///
/// The subscription is taken before the response is returned. A subscriber
/// that falls behind the channel capacity receives a `resync` event and is
/// expected to reload its notifications.
#[instrument(skip(state), fields(actor_id = actor.id))]
pub async fn events(
    State(state): State<AppState>,
    actor: Actor,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    info!(role = %actor.role, "Live channel opened");
    Sse::new(event_stream(receiver, actor)).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<PushEvent>,
    actor: Actor,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            let next = receiver.recv().await;
            match next {
                Ok(event) if event.notification().is_addressed_to(&actor) => {
                    let sse = match Event::default()
                        .event(event.name())
                        .json_data(event.notification())
                    {
                        Ok(sse) => sse,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode push event");
                            continue;
                        }
                    };
                    return Some((Ok(sse), receiver));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(actor_id = actor.id, skipped, "Live subscriber lagged, requesting resync");
                    return Some((Ok(Event::default().event("resync").data("{}")), receiver));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ReportStatus};
    use futures::StreamExt;

    #[test]
    fn test_violation_status_mapping() {
        let conflict = ApiError::from(Violation::InvalidTransition {
            from: ReportStatus::Valide,
            action: Action::Plan,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let forbidden = ApiError::from(Violation::NotAssignedTechnician);
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let invalid = ApiError::from(Violation::RemarkRequired);
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_error_body_from_violation() {
        let body = ErrorBody::from(Violation::AwaitingPlanning);
        assert_eq!(body.kind, "conflict");
        assert_eq!(body.violation, Some(Violation::AwaitingPlanning));

        let body = ErrorBody::from(Violation::Forbidden {
            role: Role::Technicien,
            action: Action::Validate,
        });
        assert_eq!(body.kind, "forbidden");

        let body = ErrorBody::from(Violation::NegativeCost);
        assert_eq!(body.kind, "validation");
        assert!(!body.message.is_empty());
    }

    fn notification_for(role: Role, user: Option<i64>) -> Notification {
        let now = Utc::now();
        Notification {
            id: 1,
            kind: NotificationKind::Incident,
            lu: false,
            destinataire_role: role,
            destinataire: user,
            payload: NotificationPayload {
                priorite: crate::model::Priority::Urgent,
                createur: 2,
                type_equipement: "Imprimante".to_string(),
                localisation: "Bureau 3".to_string(),
                date_creation: now,
                incident_id: Some(1),
            },
            date_creation: now,
        }
    }

    #[tokio::test]
    async fn test_event_stream_filters_by_addressee() {
        let (sender, receiver) = broadcast::channel(8);
        let technician = Actor::new(7, Role::Technicien);
        let mut stream = Box::pin(event_stream(receiver, technician));

        sender
            .send(PushEvent::Incident(notification_for(Role::ResponsableSi, None)))
            .unwrap();
        sender
            .send(PushEvent::IncidentAssign(notification_for(
                Role::Technicien,
                Some(8),
            )))
            .unwrap();
        sender
            .send(PushEvent::IncidentAssign(notification_for(
                Role::Technicien,
                Some(7),
            )))
            .unwrap();
        drop(sender);

        // Only the notification for technician 7 goes through
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_event_stream_lag_yields_resync() {
        let (sender, receiver) = broadcast::channel(1);
        let manager = Actor::new(1, Role::ResponsableSi);
        let mut stream = Box::pin(event_stream(receiver, manager));

        for _ in 0..3 {
            sender
                .send(PushEvent::Incident(notification_for(Role::ResponsableSi, None)))
                .unwrap();
        }
        drop(sender);

        // resync, then the one retained event, then end of stream
        let mut count = 0;
        while stream.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
