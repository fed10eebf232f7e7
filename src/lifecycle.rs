//! Incident lifecycle rules.
//!
//! Every function here is pure: it takes the current record, the acting
//! user and the reference time, and returns either the next version of the
//! record or the [`Violation`] that forbids the transition. Both the service
//! (before persisting) and the client coordinator (before any network call)
//! run the same checks.
//!
//! ```text
//! (none) --submit--> SOUMIS
//! SOUMIS[IMMEDIATE]            --validate-->   VALIDE (terminal)
//! SOUMIS[A_PLANIFIER, planned] --validate-->   VALIDE
//! SOUMIS | A_CORRIGER          --invalidate--> A_CORRIGER (remark stored)
//! A_CORRIGER | INVALIDE        --submit-->     SOUMIS
//! A_PLANIFIER reports          --plan/unplan--> datePlanification set/cleared
//! ```

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::Violation;
use crate::model::{
    Action, Actor, ExternalContact, Incident, InterventionNature, NewIncident,
    Priority, Report, ReportStatus, ReportSubmission, ResolutionNature, Role, UserId,
};

/// Duration recorded when the end of an intervention is missing or not
/// after its start.
pub const DEFAULT_DURATION_MINUTES: i64 = 24 * 60;

/// Minimum number of days between the declaration of an incident and its
/// requested due date, per priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadTimePolicy {
    urgent_days: i64,
    normale_days: i64,
    basse_days: i64,
}

impl Default for LeadTimePolicy {
    fn default() -> Self {
        Self {
            urgent_days: 2,
            normale_days: 4,
            basse_days: 7,
        }
    }
}

impl LeadTimePolicy {
    /// Build a policy; lower priorities may not require a shorter lead time
    /// than higher ones.
    pub fn new(urgent_days: i64, normale_days: i64, basse_days: i64) -> anyhow::Result<Self> {
        if urgent_days < 0 {
            anyhow::bail!("lead time cannot be negative (got {urgent_days} days for URGENT)");
        }
        if !(urgent_days <= normale_days && normale_days <= basse_days) {
            anyhow::bail!(
                "lead times must not decrease with priority: URGENT={urgent_days}, NORMALE={normale_days}, BASSE={basse_days}"
            );
        }
        Ok(Self {
            urgent_days,
            normale_days,
            basse_days,
        })
    }

    pub fn min_days(&self, priorite: Priority) -> i64 {
        match priorite {
            Priority::Urgent => self.urgent_days,
            Priority::Normale => self.normale_days,
            Priority::Basse => self.basse_days,
        }
    }

    /// First acceptable due date for an incident declared at `created`.
    pub fn earliest_due(&self, priorite: Priority, created: DateTime<Utc>) -> NaiveDate {
        created.date_naive() + Duration::days(self.min_days(priorite))
    }

    pub fn check(
        &self,
        priorite: Priority,
        created: DateTime<Utc>,
        echeance: NaiveDate,
    ) -> Result<(), Violation> {
        let earliest = self.earliest_due(priorite, created);
        if echeance < earliest {
            return Err(Violation::LeadTimeTooShort {
                priorite,
                min_days: self.min_days(priorite),
                earliest,
            });
        }
        Ok(())
    }
}

fn require_role(actor: &Actor, allowed: &[Role], action: Action) -> Result<(), Violation> {
    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(Violation::Forbidden {
            role: actor.role,
            action,
        })
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Check a declaration and build the incident record (id assigned by storage).
pub fn declare_incident(
    new: &NewIncident,
    actor: &Actor,
    now: DateTime<Utc>,
    policy: &LeadTimePolicy,
) -> Result<Incident, Violation> {
    if is_blank(&new.description) {
        return Err(Violation::missing("description"));
    }
    if is_blank(&new.equipement.famille) {
        return Err(Violation::missing("equipement.famille"));
    }
    policy.check(new.priorite, now, new.echeance)?;

    Ok(Incident {
        id: 0,
        createur: actor.id,
        priorite: new.priorite,
        equipement: new.equipement.clone(),
        etat_equipement: new.etat_equipement,
        description: new.description.trim().to_string(),
        pieces_jointes: new.pieces_jointes.clone(),
        date_creation: now,
        echeance: new.echeance,
        technicien: None,
    })
}

/// Associate a technician with an incident. Refused once a report exists.
pub fn assign_technician(
    incident: &Incident,
    existing: Option<&Report>,
    actor: &Actor,
    technician: UserId,
) -> Result<Incident, Violation> {
    require_role(
        actor,
        &[Role::ResponsableSi, Role::Admin],
        Action::AssignTechnician,
    )?;
    if existing.is_some() {
        return Err(Violation::WorkAlreadyStarted);
    }
    Ok(Incident {
        technicien: Some(technician),
        ..incident.clone()
    })
}

fn check_external_contact(contact: &ExternalContact) -> Result<(), Violation> {
    for (field, value) in [
        ("nom", &contact.nom),
        ("email", &contact.email),
        ("telephone", &contact.telephone),
    ] {
        if is_blank(value) {
            return Err(Violation::ExternalContactRequired {
                field: field.to_string(),
            });
        }
    }
    if !contact.email.contains('@') {
        return Err(Violation::InvalidExternalEmail);
    }
    Ok(())
}

/// Input-only checks on a submission: everything that can be verified
/// without knowing the incident or the current report.
pub fn check_submission(submission: &ReportSubmission) -> Result<(), Violation> {
    if is_blank(&submission.diagnostic) {
        return Err(Violation::missing("diagnostic"));
    }
    if submission.nature_resolution == ResolutionNature::Immediate
        && is_blank(&submission.travaux)
    {
        return Err(Violation::missing("travaux"));
    }
    if !submission.cout.is_finite() || submission.cout < 0.0 {
        return Err(Violation::NegativeCost);
    }

    match submission.nature_intervention {
        InterventionNature::SousTraitant => {
            if submission.nature_resolution != ResolutionNature::APlanifier {
                return Err(Violation::IncompatibleNatures);
            }
            let contact = submission
                .intervenant_externe
                .as_ref()
                .ok_or_else(|| Violation::ExternalContactRequired {
                    field: "intervenantExterne".to_string(),
                })?;
            check_external_contact(contact)?;
        }
        InterventionNature::Interne => {
            if submission.intervenant_externe.is_some() {
                return Err(Violation::ExternalContactNotAllowed);
            }
        }
    }
    Ok(())
}

/// End date and duration recorded for an intervention.
///
/// A missing end, or one that is not after the start, falls back to a
/// 24 hour intervention.
pub fn intervention_window(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, i64) {
    match end {
        Some(end) if end > start => (end, (end - start).num_minutes()),
        _ => (
            start + Duration::minutes(DEFAULT_DURATION_MINUTES),
            DEFAULT_DURATION_MINUTES,
        ),
    }
}

/// Submit or resubmit the report of `incident`.
///
/// Returns the report to persist, in status `SOUMIS`. A new report carries
/// id 0 until storage assigns one.
pub fn submit_report(
    incident: &Incident,
    existing: Option<&Report>,
    submission: &ReportSubmission,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Report, Violation> {
    require_role(actor, &[Role::Technicien], Action::SubmitReport)?;
    let technician = incident.technicien.ok_or(Violation::NoTechnicianAssigned)?;
    if technician != actor.id {
        return Err(Violation::NotAssignedTechnician);
    }

    if let Some(report) = existing {
        if report.statut.is_terminal() {
            return Err(Violation::AlreadyValidated {
                action: Action::SubmitReport,
            });
        }
        if !matches!(
            report.statut,
            ReportStatus::Soumis | ReportStatus::ACorriger | ReportStatus::Invalide
        ) {
            return Err(Violation::InvalidTransition {
                from: report.statut,
                action: Action::SubmitReport,
            });
        }
    }

    check_submission(submission)?;

    let (date_fin, duree_minutes) =
        intervention_window(submission.date_debut, submission.date_fin);
    if submission.date_fin.is_none_or(|end| end <= submission.date_debut) {
        tracing::warn!(
            incident_id = incident.id,
            "Intervention end missing or not after start, recording a 24h duration"
        );
    }

    // Planning survives a resubmission only while the work is still to be planned.
    let date_planification = match submission.nature_resolution {
        ResolutionNature::APlanifier => existing.and_then(|r| r.date_planification),
        ResolutionNature::Immediate => None,
    };

    Ok(Report {
        id: existing.map_or(0, |r| r.id),
        incident_id: incident.id,
        technicien: actor.id,
        diagnostic: submission.diagnostic.trim().to_string(),
        nature_intervention: submission.nature_intervention,
        nature_resolution: submission.nature_resolution,
        travaux: submission.travaux.trim().to_string(),
        date_debut: submission.date_debut,
        date_fin,
        duree_minutes,
        cout: submission.cout,
        intervenant_externe: submission.intervenant_externe.clone(),
        statut: ReportStatus::Soumis,
        date_planification,
        remarque_responsable: existing.and_then(|r| r.remarque_responsable.clone()),
        date_validation: None,
        date_soumission: now,
        version: existing.map_or(0, |r| r.version),
    })
}

fn check_reviewable(report: &Report, action: Action) -> Result<(), Violation> {
    match report.statut {
        ReportStatus::Valide => Err(Violation::AlreadyValidated { action }),
        ReportStatus::ACorriger => Ok(()),
        ReportStatus::Soumis => match report.nature_resolution {
            ResolutionNature::Immediate => Ok(()),
            ResolutionNature::APlanifier if report.is_planned() => Ok(()),
            ResolutionNature::APlanifier => Err(Violation::AwaitingPlanning),
        },
        from => Err(Violation::InvalidTransition { from, action }),
    }
}

/// Close a report. Irreversible.
pub fn validate(report: &Report, actor: &Actor, now: DateTime<Utc>) -> Result<Report, Violation> {
    require_role(actor, &[Role::ResponsableSi], Action::Validate)?;
    check_reviewable(report, Action::Validate)?;
    Ok(Report {
        statut: ReportStatus::Valide,
        date_validation: Some(now),
        ..report.clone()
    })
}

/// Send a report back to its technician with a remark.
pub fn invalidate(report: &Report, actor: &Actor, remark: &str) -> Result<Report, Violation> {
    require_role(actor, &[Role::ResponsableSi], Action::Invalidate)?;
    check_reviewable(report, Action::Invalidate)?;
    if is_blank(remark) {
        return Err(Violation::RemarkRequired);
    }
    Ok(Report {
        statut: ReportStatus::ACorriger,
        remarque_responsable: Some(remark.trim().to_string()),
        date_validation: None,
        ..report.clone()
    })
}

/// Schedule (or reschedule) the resolution of a report.
pub fn plan(
    report: &Report,
    actor: &Actor,
    date: NaiveDate,
    today: NaiveDate,
) -> Result<Report, Violation> {
    require_role(actor, &[Role::ResponsableSi], Action::Plan)?;
    if report.statut.is_terminal() {
        return Err(Violation::AlreadyValidated {
            action: Action::Plan,
        });
    }
    if !report.needs_planning() {
        return Err(Violation::NotPlannable);
    }
    if report.statut.needs_correction() {
        return Err(Violation::InvalidTransition {
            from: report.statut,
            action: Action::Plan,
        });
    }
    if date < today {
        return Err(Violation::PlanningDateInPast { date, today });
    }
    Ok(Report {
        date_planification: Some(date),
        ..report.clone()
    })
}

/// Remove the planning date of a report ("Annuler planif.").
pub fn unplan(report: &Report, actor: &Actor) -> Result<Report, Violation> {
    require_role(actor, &[Role::ResponsableSi], Action::Unplan)?;
    if report.statut.is_terminal() {
        return Err(Violation::AlreadyValidated {
            action: Action::Unplan,
        });
    }
    if !report.is_planned() {
        return Err(Violation::NotPlanned);
    }
    Ok(Report {
        date_planification: None,
        ..report.clone()
    })
}

/// Actions `role` can take on `report` right now.
pub fn available_actions(report: &Report, role: Role) -> Vec<Action> {
    let mut actions = Vec::new();
    match role {
        Role::ResponsableSi => {
            if check_reviewable(report, Action::Validate).is_ok() {
                actions.push(Action::Validate);
                actions.push(Action::Invalidate);
            }
            if !report.statut.is_terminal()
                && !report.statut.needs_correction()
                && report.needs_planning()
            {
                actions.push(Action::Plan);
                if report.is_planned() {
                    actions.push(Action::Unplan);
                }
            }
        }
        Role::Technicien => {
            if matches!(
                report.statut,
                ReportStatus::Soumis | ReportStatus::ACorriger | ReportStatus::Invalide
            ) {
                actions.push(Action::SubmitReport);
            }
        }
        Role::Demandeur | Role::Admin => {}
    }
    actions
}
