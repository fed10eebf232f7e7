//! HTTP client for the Gestparc service.
//!
//! [`HttpBackend`] implements [`Backend`] over the JSON contract served by
//! [`crate::api`]. The acting user travels in the `X-Actor-Id` and
//! `X-Actor-Role` headers.
//!
//! Responses are decoded into the strict model types; a body that does not
//! match is logged and reported as [`ClientError::Malformed`] instead of
//! being passed on half-filled. Error bodies are decoded back into the
//! [`crate::error::Violation`] the server applied.
//!
//! [`HttpBackend::subscribe`] opens the server-sent event channel and yields
//! [`StreamEvent`]s.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::backend::Backend;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::model::{
    Actor, AssignRequest, ErrorBody, Incident, IncidentId, InvalidateRequest, NewIncident,
    Notification, NotificationId, PlanRequest, PushEvent, Report, ReportId, ReportStatus,
    ReportSubmission, UserId,
};
use crate::scheduling::SchedulingBoard;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Client for the incident lifecycle service.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    actor: Actor,
}

impl HttpBackend {
    /// Create a client acting as `actor` against `base_url`.
    pub fn new(base_url: &str, actor: Actor) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            actor,
        }
    }

    /// Create a client from configuration, with a request timeout.
    pub fn from_config(config: &ClientConfig, actor: Actor) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            actor,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(ACTOR_ID_HEADER, self.actor.id.to_string())
            .header(ACTOR_ROLE_HEADER, self.actor.role.as_str())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        let response = check_status(response).await?;
        decode(response).await
    }

    async fn send_json<B, T>(&self, request: RequestBuilder, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(request.json(body)).await
    }

    /// Open the push channel.
    ///
    /// The server subscribes the channel before answering, so every event
    /// emitted after this call returns is delivered.
    #[instrument(skip(self), fields(actor_id = self.actor.id))]
    pub async fn subscribe(&self) -> Result<EventStream, ClientError> {
        // The channel is long-lived: no whole-request timeout applies here
        let response = reqwest::Client::new()
            .get(format!("{}/events", self.base_url))
            .header(ACTOR_ID_HEADER, self.actor.id.to_string())
            .header(ACTOR_ROLE_HEADER, self.actor.role.as_str())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check_status(response).await?;
        debug!("Event stream opened");
        Ok(EventStream::from_bytes(response.bytes_stream()))
    }

    /// Liveness probe.
    pub async fn health(&self, timeout: Duration) -> Result<(), ClientError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text).ok();
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| format!("HTTP {status}: {text}"));
    let violation = body.and_then(|b| b.violation);

    Err(match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::CONFLICT => ClientError::Conflict { message, violation },
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
            match violation {
                Some(violation) => ClientError::Validation(violation),
                None => ClientError::Malformed(message),
            }
        }
        _ => ClientError::Transport(message),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let url = response.url().to_string();
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        warn!(url = %url, error = %e, "Rejected malformed payload");
        ClientError::Malformed(format!("{url}: {e}"))
    })
}

#[async_trait]
impl Backend for HttpBackend {
    fn actor(&self) -> &Actor {
        &self.actor
    }

    #[instrument(skip(self, incident), fields(priorite = %incident.priorite))]
    async fn create_incident(&self, incident: &NewIncident) -> Result<Incident, ClientError> {
        self.send_json(self.request(Method::POST, "/incidents"), incident)
            .await
    }

    #[instrument(skip(self))]
    async fn get_incident(&self, id: IncidentId) -> Result<Incident, ClientError> {
        self.send(self.request(Method::GET, &format!("/incidents/{id}")))
            .await
    }

    #[instrument(skip(self))]
    async fn assign_technician(
        &self,
        incident_id: IncidentId,
        technician: UserId,
    ) -> Result<Incident, ClientError> {
        self.send_json(
            self.request(Method::POST, &format!("/incidents/{incident_id}/technicien")),
            &AssignRequest {
                technicien_id: technician,
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_report(&self, id: ReportId) -> Result<Report, ClientError> {
        self.send(self.request(Method::GET, &format!("/rapports/{id}")))
            .await
    }

    #[instrument(skip(self))]
    async fn get_report_by_incident(
        &self,
        incident_id: IncidentId,
    ) -> Result<Option<Report>, ClientError> {
        let result = self
            .send(self.request(Method::GET, &format!("/incidents/{incident_id}/rapport")))
            .await;
        match result {
            Ok(report) => Ok(Some(report)),
            Err(ClientError::NotFound(_)) => {
                // Distinguish "no report yet" from "no such incident"
                self.get_incident(incident_id).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn list_reports(&self, statut: Option<ReportStatus>) -> Result<Vec<Report>, ClientError> {
        let path = match statut {
            Some(statut) => format!("/rapports?statut={}", urlencoding::encode(statut.as_str())),
            None => "/rapports".to_string(),
        };
        self.send(self.request(Method::GET, &path)).await
    }

    #[instrument(skip(self, submission), fields(incident_id = submission.incident_id))]
    async fn create_report(&self, submission: &ReportSubmission) -> Result<Report, ClientError> {
        self.send_json(self.request(Method::POST, "/rapports"), submission)
            .await
    }

    #[instrument(skip(self, submission))]
    async fn update_report(
        &self,
        id: ReportId,
        submission: &ReportSubmission,
    ) -> Result<Report, ClientError> {
        self.send_json(
            self.request(Method::PATCH, &format!("/rapports/{id}")),
            submission,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn validate(&self, id: ReportId) -> Result<Report, ClientError> {
        self.send(self.request(Method::POST, &format!("/rapports/{id}/valider")))
            .await
    }

    #[instrument(skip(self, remark))]
    async fn invalidate(&self, id: ReportId, remark: &str) -> Result<Report, ClientError> {
        self.send_json(
            self.request(Method::POST, &format!("/rapports/{id}/invalider")),
            &InvalidateRequest {
                remarque: remark.to_string(),
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn plan(&self, id: ReportId, date: Option<NaiveDate>) -> Result<Report, ClientError> {
        self.send_json(
            self.request(Method::PUT, &format!("/rapports/{id}/planification")),
            &PlanRequest {
                date_planification: date,
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn scheduling_board(&self) -> Result<SchedulingBoard, ClientError> {
        self.send(self.request(Method::GET, "/planification")).await
    }

    #[instrument(skip(self))]
    async fn list_notifications(
        &self,
        unread_only: bool,
    ) -> Result<Vec<Notification>, ClientError> {
        let path = if unread_only {
            "/notifications?nonLues=true"
        } else {
            "/notifications"
        };
        self.send(self.request(Method::GET, path)).await
    }

    #[instrument(skip(self))]
    async fn mark_notification_read(
        &self,
        id: NotificationId,
    ) -> Result<Notification, ClientError> {
        self.send(self.request(Method::POST, &format!("/notifications/{id}/lu")))
            .await
    }
}

// ============================================================================
// Server-sent events
// ============================================================================

/// Something received on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Push(PushEvent),
    /// The server dropped events for this subscriber; reload everything.
    Resync,
}

/// An open push channel.
pub struct EventStream {
    events: Pin<Box<dyn Stream<Item = Result<Event, ClientError>> + Send>>,
}

impl EventStream {
    /// Decode a `text/event-stream` body.
    pub fn from_bytes<S, B, E>(bytes: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]>,
        E: Into<ClientError> + 'static,
    {
        let events = bytes
            .map_err(Into::<ClientError>::into)
            .eventsource()
            .map(|item| {
                item.map_err(|e| match e {
                    EventStreamError::Transport(e) => e,
                    other => ClientError::Malformed(other.to_string()),
                })
            });
        Self {
            events: Box::pin(events),
        }
    }

    /// Wait for the next event. `Ok(None)` means the server closed the stream.
    pub async fn next(&mut self) -> Result<Option<StreamEvent>, ClientError> {
        while let Some(event) = self.events.next().await {
            if let Some(event) = translate(event?) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

fn translate(event: Event) -> Option<StreamEvent> {
    if event.event == "resync" {
        return Some(StreamEvent::Resync);
    }
    match PushEvent::from_parts(&event.event, &event.data) {
        Ok(Some(push)) => Some(StreamEvent::Push(push)),
        Ok(None) => {
            debug!(event = %event.event, "Ignoring unknown event");
            None
        }
        Err(e) => {
            warn!(event = %event.event, error = %e, "Rejected malformed event payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static str]) -> EventStream {
        let parts: Vec<Result<&'static [u8], ClientError>> =
            parts.iter().copied().map(|p| Ok(p.as_bytes())).collect();
        EventStream::from_bytes(stream::iter(parts))
    }

    #[tokio::test]
    async fn test_resync_across_chunks() {
        let mut events = chunks(&[":keep-alive\n\nevent: res", "ync\r\ndata: 3\r\n\r\n"]);

        assert_eq!(events.next().await.unwrap(), Some(StreamEvent::Resync));
        assert_eq!(events.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events_are_skipped() {
        let mut events = chunks(&[
            "event: incident\ndata: not json\n\n",
            "event: heartbeat\ndata: {}\n\n",
            "event: resync\ndata: 1\n\n",
        ]);

        assert_eq!(events.next().await.unwrap(), Some(StreamEvent::Resync));
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let parts: Vec<Result<&'static [u8], ClientError>> =
            vec![Err(ClientError::Transport("connection reset".to_string()))];
        let mut events = EventStream::from_bytes(stream::iter(parts));

        let err = events.next().await.unwrap_err();
        assert!(err.requires_refresh());
    }
}
