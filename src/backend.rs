//! The backend operations the coordinator depends on.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::ClientError;
use crate::model::{
    Actor, Incident, IncidentId, NewIncident, Notification, NotificationId, Report, ReportId,
    ReportStatus, ReportSubmission, UserId,
};
use crate::scheduling::SchedulingBoard;

/// Remote system of record for incidents, reports and notifications.
///
/// Every call is made on behalf of [`Backend::actor`]. Implementations must
/// report failures through [`ClientError`] and never fabricate a success.
#[async_trait]
pub trait Backend: Send + Sync {
    fn actor(&self) -> &Actor;

    async fn create_incident(&self, incident: &NewIncident) -> Result<Incident, ClientError>;

    async fn get_incident(&self, id: IncidentId) -> Result<Incident, ClientError>;

    async fn assign_technician(
        &self,
        incident_id: IncidentId,
        technician: UserId,
    ) -> Result<Incident, ClientError>;

    async fn get_report(&self, id: ReportId) -> Result<Report, ClientError>;

    /// `Ok(None)` when no report has been submitted for the incident yet.
    async fn get_report_by_incident(
        &self,
        incident_id: IncidentId,
    ) -> Result<Option<Report>, ClientError>;

    async fn list_reports(&self, statut: Option<ReportStatus>) -> Result<Vec<Report>, ClientError>;

    async fn create_report(&self, submission: &ReportSubmission) -> Result<Report, ClientError>;

    async fn update_report(
        &self,
        id: ReportId,
        submission: &ReportSubmission,
    ) -> Result<Report, ClientError>;

    async fn validate(&self, id: ReportId) -> Result<Report, ClientError>;

    async fn invalidate(&self, id: ReportId, remark: &str) -> Result<Report, ClientError>;

    /// Set (`Some`) or clear (`None`) the planning date.
    async fn plan(&self, id: ReportId, date: Option<NaiveDate>) -> Result<Report, ClientError>;

    async fn scheduling_board(&self) -> Result<SchedulingBoard, ClientError>;

    async fn list_notifications(&self, unread_only: bool)
    -> Result<Vec<Notification>, ClientError>;

    async fn mark_notification_read(
        &self,
        id: NotificationId,
    ) -> Result<Notification, ClientError>;
}
