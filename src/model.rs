//! Data models for Gestparc.
//!
//! These types are the single schema shared by the reference service, the
//! HTTP client and the client-side coordinator. Field names follow the wire
//! format (camelCase, French domain vocabulary); enum values are the
//! upper-case constants the front-end pages exchange.
//!
//! Payloads are decoded strictly: a missing required field or an unknown
//! enum value is a decode error, never a silently defaulted value. The few
//! historical naming variants seen in backend payloads (`familleMI` for
//! `famille`) are accepted through serde aliases so they are normalised at
//! the boundary.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Violation;

pub type IncidentId = i64;
pub type ReportId = i64;
pub type UserId = i64;
pub type NotificationId = i64;

/// Urgency declared by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Urgent,
    Normale,
    Basse,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "URGENT",
            Priority::Normale => "NORMALE",
            Priority::Basse => "BASSE",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the equipment at the time the incident was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquipmentState {
    EnMarche,
    Arret,
}

impl EquipmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentState::EnMarche => "EN_MARCHE",
            EquipmentState::Arret => "ARRET",
        }
    }
}

/// Who performs the intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionNature {
    /// In-house technician.
    Interne,
    /// External contractor.
    SousTraitant,
}

impl InterventionNature {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionNature::Interne => "INTERNE",
            InterventionNature::SousTraitant => "SOUS_TRAITANT",
        }
    }
}

/// Whether the fix was applied on the spot or must be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionNature {
    Immediate,
    APlanifier,
}

impl ResolutionNature {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionNature::Immediate => "IMMEDIATE",
            ResolutionNature::APlanifier => "A_PLANIFIER",
        }
    }
}

/// Review status of a report.
///
/// The coordinator itself only produces `Soumis`, `ACorriger` and `Valide`.
/// The planning-track statuses (`APlanifier`, `NonPlanifie`, `ModPlanifier`)
/// and `Invalide` are still part of the schema because the backend may
/// report them for older records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Soumis,
    APlanifier,
    Invalide,
    Valide,
    ACorriger,
    NonPlanifie,
    ModPlanifier,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Soumis => "SOUMIS",
            ReportStatus::APlanifier => "A_PLANIFIER",
            ReportStatus::Invalide => "INVALIDE",
            ReportStatus::Valide => "VALIDE",
            ReportStatus::ACorriger => "A_CORRIGER",
            ReportStatus::NonPlanifie => "NON_PLANIFIE",
            ReportStatus::ModPlanifier => "MOD_PLANIFIER",
        }
    }

    /// `VALIDE` closes the report for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Valide)
    }

    /// The technician has to rework and resubmit the report.
    pub fn needs_correction(&self) -> bool {
        matches!(self, ReportStatus::ACorriger | ReportStatus::Invalide)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application role of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Declares incidents.
    Demandeur,
    /// Diagnoses incidents and writes reports.
    Technicien,
    /// Reviews reports, assigns technicians and schedules work.
    ResponsableSi,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Demandeur => "DEMANDEUR",
            Role::Technicien => "TECHNICIEN",
            Role::ResponsableSi => "RESPONSABLE_SI",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEMANDEUR" => Some(Role::Demandeur),
            "TECHNICIEN" => Some(Role::Technicien),
            "RESPONSABLE_SI" => Some(Role::ResponsableSi),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated user performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }
}

/// Lifecycle operations, used to name the action a rule rejected and the
/// actions surfaced to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    DeclareIncident,
    AssignTechnician,
    SubmitReport,
    Validate,
    Invalidate,
    Plan,
    Unplan,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::DeclareIncident => "declare_incident",
            Action::AssignTechnician => "assign_technician",
            Action::SubmitReport => "submit_report",
            Action::Validate => "validate",
            Action::Invalidate => "invalidate",
            Action::Plan => "plan",
            Action::Unplan => "unplan",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the equipment an incident targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentRef {
    pub id: i64,

    /// Equipment family ("famille" on newer pages, "familleMI" on older ones).
    #[serde(alias = "familleMI")]
    pub famille: String,

    pub localisation: String,
}

/// A reported equipment problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: IncidentId,
    pub createur: UserId,
    pub priorite: Priority,
    pub equipement: EquipmentRef,
    pub etat_equipement: EquipmentState,
    pub description: String,
    #[serde(default)]
    pub pieces_jointes: Vec<String>,
    pub date_creation: DateTime<Utc>,
    pub echeance: NaiveDate,
    #[serde(default)]
    pub technicien: Option<UserId>,
}

/// Request body for `POST /incidents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIncident {
    pub priorite: Priority,
    pub equipement: EquipmentRef,
    pub etat_equipement: EquipmentState,
    pub description: String,
    #[serde(default)]
    pub pieces_jointes: Vec<String>,
    pub echeance: NaiveDate,
}

/// Contact details of an external contractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalContact {
    pub nom: String,
    pub email: String,
    pub telephone: String,
}

/// What a technician submits (or resubmits) for an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSubmission {
    pub incident_id: IncidentId,
    pub diagnostic: String,
    pub nature_intervention: InterventionNature,
    pub nature_resolution: ResolutionNature,
    #[serde(default)]
    pub travaux: String,
    pub date_debut: DateTime<Utc>,
    #[serde(default)]
    pub date_fin: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cout: f64,
    #[serde(default)]
    pub intervenant_externe: Option<ExternalContact>,
}

/// The technician's record of diagnosis and work for an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: ReportId,
    pub incident_id: IncidentId,
    pub technicien: UserId,
    pub diagnostic: String,
    pub nature_intervention: InterventionNature,
    pub nature_resolution: ResolutionNature,
    pub travaux: String,
    pub date_debut: DateTime<Utc>,
    pub date_fin: DateTime<Utc>,
    pub duree_minutes: i64,
    pub cout: f64,
    #[serde(default)]
    pub intervenant_externe: Option<ExternalContact>,
    pub statut: ReportStatus,
    #[serde(default)]
    pub date_planification: Option<NaiveDate>,
    #[serde(default)]
    pub remarque_responsable: Option<String>,
    #[serde(default)]
    pub date_validation: Option<DateTime<Utc>>,
    pub date_soumission: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl Report {
    pub fn is_planned(&self) -> bool {
        self.date_planification.is_some()
    }

    pub fn needs_planning(&self) -> bool {
        self.nature_resolution == ResolutionNature::APlanifier
    }
}

/// Request body for `POST /incidents/:id/technicien`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub technicien_id: UserId,
}

/// Request body for `POST /rapports/:id/invalider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub remarque: String,
}

/// Request body for `PUT /rapports/:id/planification`; `null` unplans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub date_planification: Option<NaiveDate>,
}

/// Query parameters for `GET /rapports`.
#[derive(Debug, Default, Deserialize)]
pub struct ReportsQuery {
    pub statut: Option<ReportStatus>,
}

/// Query parameters for `GET /notifications`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsQuery {
    #[serde(default)]
    pub non_lues: bool,
}

/// Category of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Incident,
    Applicatif,
    Demande,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Incident => "incident",
            NotificationKind::Applicatif => "applicatif",
            NotificationKind::Demande => "demande",
        }
    }
}

/// Snapshot of the incident facts a notification was emitted for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub priorite: Priority,
    pub createur: UserId,
    #[serde(alias = "familleMI", alias = "famille")]
    pub type_equipement: String,
    pub localisation: String,
    pub date_creation: DateTime<Utc>,
    #[serde(default)]
    pub incident_id: Option<IncidentId>,
}

impl NotificationPayload {
    pub fn for_incident(incident: &Incident) -> Self {
        Self {
            priorite: incident.priorite,
            createur: incident.createur,
            type_equipement: incident.equipement.famille.clone(),
            localisation: incident.equipement.localisation.clone(),
            date_creation: incident.date_creation,
            incident_id: Some(incident.id),
        }
    }
}

/// An event record surfaced to a role (and optionally a single user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub lu: bool,
    pub destinataire_role: Role,
    #[serde(default)]
    pub destinataire: Option<UserId>,
    pub payload: NotificationPayload,
    pub date_creation: DateTime<Utc>,
}

impl Notification {
    /// Whether `actor` is an addressee of this notification.
    pub fn is_addressed_to(&self, actor: &Actor) -> bool {
        self.destinataire_role == actor.role
            && self.destinataire.is_none_or(|user| user == actor.id)
    }
}

/// Real-time event pushed on the `/events` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "notification", rename_all = "snake_case")]
pub enum PushEvent {
    /// A new incident was declared.
    Incident(Notification),
    /// A technician was assigned to an incident.
    IncidentAssign(Notification),
}

impl PushEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Incident(_) => "incident",
            PushEvent::IncidentAssign(_) => "incident_assign",
        }
    }

    pub fn notification(&self) -> &Notification {
        match self {
            PushEvent::Incident(n) | PushEvent::IncidentAssign(n) => n,
        }
    }

    /// Rebuild an event from its SSE name and JSON data.
    pub fn from_parts(name: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let notification = match name {
            "incident" | "incident_assign" => serde_json::from_str::<Notification>(data)?,
            _ => return Ok(None),
        };
        Ok(Some(if name == "incident" {
            PushEvent::Incident(notification)
        } else {
            PushEvent::IncidentAssign(notification)
        }))
    }
}

/// Error body returned by every non-2xx response of the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// One of `validation`, `forbidden`, `conflict`, `not_found`,
    /// `unauthorized`, `internal`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_wire_values() {
        assert_eq!(
            serde_json::to_value(ResolutionNature::APlanifier).unwrap(),
            json!("A_PLANIFIER")
        );
        assert_eq!(
            serde_json::to_value(ReportStatus::ModPlanifier).unwrap(),
            json!("MOD_PLANIFIER")
        );
        assert_eq!(
            serde_json::to_value(InterventionNature::SousTraitant).unwrap(),
            json!("SOUS_TRAITANT")
        );
        assert_eq!(
            serde_json::to_value(Role::ResponsableSi).unwrap(),
            json!("RESPONSABLE_SI")
        );
        assert_eq!(
            serde_json::to_value(EquipmentState::EnMarche).unwrap(),
            json!("EN_MARCHE")
        );
    }

    #[test]
    fn test_equipment_family_alias() {
        let legacy: EquipmentRef = serde_json::from_value(json!({
            "id": 4,
            "familleMI": "Imprimante",
            "localisation": "Bâtiment B"
        }))
        .unwrap();
        assert_eq!(legacy.famille, "Imprimante");

        let current: EquipmentRef = serde_json::from_value(json!({
            "id": 4,
            "famille": "Imprimante",
            "localisation": "Bâtiment B"
        }))
        .unwrap();
        assert_eq!(legacy, current);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let result = serde_json::from_value::<ReportStatus>(json!("EN_COURS"));
        assert!(result.is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("responsable_si"), Some(Role::ResponsableSi));
        assert_eq!(Role::parse(" TECHNICIEN "), Some(Role::Technicien));
        assert_eq!(Role::parse("visiteur"), None);
    }

    #[test]
    fn test_notification_addressing() {
        let notification = Notification {
            id: 1,
            kind: NotificationKind::Incident,
            lu: false,
            destinataire_role: Role::Technicien,
            destinataire: Some(7),
            payload: NotificationPayload {
                priorite: Priority::Urgent,
                createur: 2,
                type_equipement: "Serveur".to_string(),
                localisation: "Salle 1".to_string(),
                date_creation: Utc::now(),
                incident_id: Some(3),
            },
            date_creation: Utc::now(),
        };

        assert!(notification.is_addressed_to(&Actor::new(7, Role::Technicien)));
        assert!(!notification.is_addressed_to(&Actor::new(8, Role::Technicien)));
        assert!(!notification.is_addressed_to(&Actor::new(7, Role::ResponsableSi)));
    }

    #[test]
    fn test_push_event_from_parts() {
        let data = json!({
            "id": 5,
            "type": "incident",
            "lu": false,
            "destinataireRole": "RESPONSABLE_SI",
            "payload": {
                "priorite": "BASSE",
                "createur": 1,
                "typeEquipement": "Climatiseur",
                "localisation": "Hall",
                "dateCreation": "2026-01-10T08:00:00Z",
                "incidentId": 9
            },
            "dateCreation": "2026-01-10T08:00:00Z"
        })
        .to_string();

        let event = PushEvent::from_parts("incident_assign", &data)
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "incident_assign");
        assert_eq!(event.notification().payload.incident_id, Some(9));

        assert!(PushEvent::from_parts("keepalive", "").unwrap().is_none());
        assert!(PushEvent::from_parts("incident", "{}").is_err());
    }
}
