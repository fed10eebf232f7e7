//! Error types shared by the lifecycle core, the service and the client.
//!
//! [`Violation`] is the explicit rejection of a lifecycle rule. It is
//! serialised into the service's error body (tagged by `code`) so the client
//! decodes exactly the rule the server applied.
//!
//! [`ClientError`] is the taxonomy a caller of the backend has to handle:
//! validation errors are recovered by re-prompting the actor; conflict,
//! not-found and transport errors require re-fetching authoritative state
//! before any retry.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Action, IncidentId, Priority, ReportStatus, Role};

/// A lifecycle rule that rejected an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Violation {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error(
        "due date too early for {priorite} priority: minimum lead time is {min_days} days, earliest allowed date is {earliest}"
    )]
    LeadTimeTooShort {
        priorite: Priority,
        min_days: i64,
        earliest: NaiveDate,
    },

    #[error(
        "incompatible resolution/intervention nature: subcontracted work must be A_PLANIFIER"
    )]
    IncompatibleNatures,

    #[error("external contact required for subcontracted work: missing {field}")]
    ExternalContactRequired { field: String },

    #[error("external contact email is not a valid address")]
    InvalidExternalEmail,

    #[error("external contact is only allowed for subcontracted work")]
    ExternalContactNotAllowed,

    #[error("submission names incident {submitted} but the report belongs to incident {expected}")]
    IncidentMismatch {
        expected: IncidentId,
        submitted: IncidentId,
    },

    #[error("cost cannot be negative")]
    NegativeCost,

    #[error("remark required to invalidate")]
    RemarkRequired,

    #[error("role {role} may not {action}")]
    Forbidden { role: Role, action: Action },

    #[error("only the assigned technician may submit this report")]
    NotAssignedTechnician,

    #[error("no technician is assigned to this incident")]
    NoTechnicianAssigned,

    #[error("work has already started on this incident")]
    WorkAlreadyStarted,

    #[error("cannot {action} a report in status {from}")]
    InvalidTransition { from: ReportStatus, action: Action },

    #[error("report is already validated: cannot {action}")]
    AlreadyValidated { action: Action },

    #[error("report resolution is not A_PLANIFIER: nothing to schedule")]
    NotPlannable,

    #[error("report must be planned before it can be reviewed")]
    AwaitingPlanning,

    #[error("report is not planned")]
    NotPlanned,

    #[error("planning date {date} is before today ({today})")]
    PlanningDateInPast { date: NaiveDate, today: NaiveDate },
}

impl Violation {
    pub fn missing(field: &str) -> Self {
        Violation::MissingField {
            field: field.to_string(),
        }
    }

    /// The rule depends on the current state of the record rather than on
    /// the submitted input. Such rejections surface as conflicts.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            Violation::InvalidTransition { .. }
                | Violation::AlreadyValidated { .. }
                | Violation::AwaitingPlanning
                | Violation::NotPlanned
                | Violation::NoTechnicianAssigned
                | Violation::WorkAlreadyStarted
        )
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            Violation::Forbidden { .. } | Violation::NotAssignedTechnician
        )
    }
}

/// Errors returned by backend operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Precondition failure, detected locally or by the server.
    #[error(transparent)]
    Validation(#[from] Violation),

    /// The server rejected a transition because the record changed.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        violation: Option<Violation>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Network or server failure; no state change is guaranteed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a payload that does not match the schema.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl ClientError {
    /// Whether authoritative state has to be re-fetched before retrying.
    pub fn requires_refresh(&self) -> bool {
        matches!(
            self,
            ClientError::Conflict { .. } | ClientError::NotFound(_) | ClientError::Transport(_)
        )
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            ClientError::Validation(v) => Some(v),
            ClientError::Conflict { violation, .. } => violation.as_ref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Malformed(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_violation_wire_shape() {
        let violation = Violation::InvalidTransition {
            from: ReportStatus::Valide,
            action: Action::Invalidate,
        };
        let value = serde_json::to_value(&violation).unwrap();
        assert_eq!(
            value,
            json!({ "code": "invalid_transition", "from": "VALIDE", "action": "invalidate" })
        );

        let back: Violation = serde_json::from_value(value).unwrap();
        assert_eq!(back, violation);
    }

    #[test]
    fn test_violation_messages_name_the_rule() {
        assert_eq!(
            Violation::RemarkRequired.to_string(),
            "remark required to invalidate"
        );
        assert!(
            Violation::IncompatibleNatures
                .to_string()
                .starts_with("incompatible resolution/intervention nature")
        );
        assert!(
            Violation::ExternalContactRequired {
                field: "nom".to_string()
            }
            .to_string()
            .contains("external contact required")
        );
    }

    #[test]
    fn test_conflict_classification() {
        assert!(Violation::NotPlanned.is_state_conflict());
        assert!(!Violation::RemarkRequired.is_state_conflict());
        assert!(
            Violation::Forbidden {
                role: Role::Technicien,
                action: Action::Validate
            }
            .is_forbidden()
        );
    }

    #[test]
    fn test_refresh_required() {
        assert!(ClientError::Transport("reset".to_string()).requires_refresh());
        assert!(
            ClientError::Conflict {
                message: "stale".to_string(),
                violation: None
            }
            .requires_refresh()
        );
        assert!(!ClientError::Validation(Violation::NegativeCost).requires_refresh());
    }
}
