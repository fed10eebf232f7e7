//! Client-side lifecycle coordinator.
//!
//! [`Coordinator`] is the session object a front-end page works through. It
//! keeps the last authoritative copy of the incidents and reports it has
//! touched, runs the lifecycle rules locally so that an obviously invalid
//! action never reaches the network, and only records a new state once the
//! backend has answered with it.
//!
//! When the backend rejects a call because the record moved on (conflict),
//! vanished (not found) or could not be reached (transport), the cached copy
//! is discarded and re-fetched before the error is returned, so the caller
//! always decides its next step on fresh state.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};

use crate::backend::Backend;
use crate::client::HttpBackend;
use crate::config::ClientConfig;
use crate::error::{ClientError, Violation};
use crate::lifecycle::{self, LeadTimePolicy};
use crate::model::{
    Action, Actor, Incident, IncidentId, NewIncident, Report, ReportId, ReportSubmission, UserId,
};

pub struct Coordinator<B: Backend> {
    backend: B,
    lead_time: LeadTimePolicy,
    incidents: HashMap<IncidentId, Incident>,
    reports: HashMap<ReportId, Report>,
}

impl Coordinator<HttpBackend> {
    /// Coordinator over the HTTP backend described by `config`.
    pub fn from_config(config: &ClientConfig, actor: Actor) -> Result<Self, ClientError> {
        Ok(Self::new(
            HttpBackend::from_config(config, actor)?,
            config.lead_time,
        ))
    }
}

impl<B: Backend> Coordinator<B> {
    pub fn new(backend: B, lead_time: LeadTimePolicy) -> Self {
        Self {
            backend,
            lead_time,
            incidents: HashMap::new(),
            reports: HashMap::new(),
        }
    }

    pub fn actor(&self) -> &Actor {
        self.backend.actor()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Cached copy of an incident, if loaded.
    pub fn incident(&self, id: IncidentId) -> Option<&Incident> {
        self.incidents.get(&id)
    }

    /// Cached copy of a report, if loaded.
    pub fn report(&self, id: ReportId) -> Option<&Report> {
        self.reports.get(&id)
    }

    /// Cached report of an incident, if loaded.
    pub fn report_of(&self, incident_id: IncidentId) -> Option<&Report> {
        self.reports.values().find(|r| r.incident_id == incident_id)
    }

    /// Actions the current actor can take on a cached report.
    pub fn available_actions(&self, id: ReportId) -> Vec<Action> {
        self.reports
            .get(&id)
            .map(|report| lifecycle::available_actions(report, self.actor().role))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load an incident and its report (if any) from the backend.
    #[instrument(skip(self))]
    pub async fn open(&mut self, id: IncidentId) -> Result<(Incident, Option<Report>), ClientError> {
        let incident = self.backend.get_incident(id).await?;
        let report = self.backend.get_report_by_incident(id).await?;

        self.incidents.insert(id, incident.clone());
        self.reports.retain(|_, r| r.incident_id != id);
        if let Some(report) = &report {
            self.reports.insert(report.id, report.clone());
        }
        Ok((incident, report))
    }

    /// Re-fetch a report, replacing the cached copy.
    pub async fn refresh_report(&mut self, id: ReportId) -> Result<Report, ClientError> {
        self.reports.remove(&id);
        let report = self.backend.get_report(id).await?;
        self.reports.insert(id, report.clone());
        Ok(report)
    }

    async fn ensure_incident(&mut self, id: IncidentId) -> Result<Incident, ClientError> {
        if let Some(incident) = self.incidents.get(&id) {
            return Ok(incident.clone());
        }
        let incident = self.backend.get_incident(id).await?;
        self.incidents.insert(id, incident.clone());
        Ok(incident)
    }

    async fn ensure_report(&mut self, id: ReportId) -> Result<Report, ClientError> {
        if let Some(report) = self.reports.get(&id) {
            return Ok(report.clone());
        }
        self.refresh_report(id).await
    }

    async fn ensure_report_of(
        &mut self,
        incident_id: IncidentId,
    ) -> Result<Option<Report>, ClientError> {
        if let Some(report) = self.report_of(incident_id) {
            return Ok(Some(report.clone()));
        }
        let report = self.backend.get_report_by_incident(incident_id).await?;
        if let Some(report) = &report {
            self.reports.insert(report.id, report.clone());
        }
        Ok(report)
    }

    /// Run a local lifecycle check against the report. A state rule that
    /// fails on a cached copy is re-checked against a fresh one before the
    /// rejection is returned.
    async fn check_report<F>(&mut self, id: ReportId, check: F) -> Result<Report, ClientError>
    where
        F: Fn(&Report) -> Result<Report, Violation>,
    {
        let cached = self.reports.contains_key(&id);
        let current = self.ensure_report(id).await?;
        match check(&current) {
            Ok(_) => Ok(current),
            Err(v) if cached && v.is_state_conflict() => {
                info!(report_id = id, violation = %v, "Cached report rejected, reloading");
                let fresh = self.refresh_report(id).await?;
                check(&fresh)?;
                Ok(fresh)
            }
            Err(v) => Err(v.into()),
        }
    }

    /// Drop everything cached for an incident and load it again.
    async fn reload_incident(
        &mut self,
        id: IncidentId,
    ) -> Result<(Incident, Option<Report>), ClientError> {
        self.incidents.remove(&id);
        self.reports.retain(|_, r| r.incident_id != id);
        self.open(id).await
    }

    /// Record a transition result, re-fetching on a rejection that makes the
    /// cached copy suspect.
    async fn settle(
        &mut self,
        id: ReportId,
        result: Result<Report, ClientError>,
    ) -> Result<Report, ClientError> {
        match result {
            Ok(report) => {
                self.reports.insert(report.id, report.clone());
                Ok(report)
            }
            Err(e) => {
                if e.requires_refresh() {
                    warn!(report_id = id, error = %e, "Transition rejected, reloading report");
                    if let Err(refresh) = self.refresh_report(id).await {
                        warn!(report_id = id, error = %refresh, "Failed to reload report");
                    }
                }
                Err(e)
            }
        }
    }

    async fn settle_incident(
        &mut self,
        id: IncidentId,
        result: Result<Incident, ClientError>,
    ) -> Result<Incident, ClientError> {
        match result {
            Ok(incident) => {
                self.incidents.insert(incident.id, incident.clone());
                Ok(incident)
            }
            Err(e) => {
                if e.requires_refresh() {
                    warn!(incident_id = id, error = %e, "Call rejected, reloading incident");
                    if let Err(refresh) = self.reload_incident(id).await {
                        warn!(incident_id = id, error = %refresh, "Failed to reload incident");
                    }
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    #[instrument(skip(self, incident), fields(priorite = %incident.priorite))]
    pub async fn declare_incident(&mut self, incident: &NewIncident) -> Result<Incident, ClientError> {
        lifecycle::declare_incident(incident, self.actor(), Utc::now(), &self.lead_time)?;

        let created = self.backend.create_incident(incident).await?;
        self.incidents.insert(created.id, created.clone());
        info!(incident_id = created.id, "Incident declared");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn assign_technician(
        &mut self,
        incident_id: IncidentId,
        technician: UserId,
    ) -> Result<Incident, ClientError> {
        let cached = self.incidents.contains_key(&incident_id);
        let incident = self.ensure_incident(incident_id).await?;
        let existing = self.ensure_report_of(incident_id).await?;
        let actor = *self.actor();
        if let Err(v) = lifecycle::assign_technician(&incident, existing.as_ref(), &actor, technician)
        {
            if !(cached && v.is_state_conflict()) {
                return Err(v.into());
            }
            info!(incident_id, violation = %v, "Cached incident rejected, reloading");
            let (incident, existing) = self.reload_incident(incident_id).await?;
            lifecycle::assign_technician(&incident, existing.as_ref(), &actor, technician)?;
        }

        let result = self.backend.assign_technician(incident_id, technician).await;
        self.settle_incident(incident_id, result).await
    }

    /// Submit the report of an incident, or resubmit the existing one.
    #[instrument(skip(self, submission), fields(incident_id = submission.incident_id))]
    pub async fn submit_report(
        &mut self,
        submission: &ReportSubmission,
    ) -> Result<Report, ClientError> {
        let incident_id = submission.incident_id;
        let actor = *self.actor();
        let cached = self.incidents.contains_key(&incident_id);
        let incident = self.ensure_incident(incident_id).await?;
        let mut existing = self.ensure_report_of(incident_id).await?;
        if let Err(v) =
            lifecycle::submit_report(&incident, existing.as_ref(), submission, &actor, Utc::now())
        {
            if !(cached && v.is_state_conflict()) {
                return Err(v.into());
            }
            info!(incident_id, violation = %v, "Cached incident rejected, reloading");
            let (incident, report) = self.reload_incident(incident_id).await?;
            lifecycle::submit_report(&incident, report.as_ref(), submission, &actor, Utc::now())?;
            existing = report;
        }

        match existing {
            Some(report) => {
                let result = self.backend.update_report(report.id, submission).await;
                self.settle(report.id, result).await
            }
            None => match self.backend.create_report(submission).await {
                Ok(report) => {
                    self.reports.insert(report.id, report.clone());
                    info!(report_id = report.id, "Report created");
                    Ok(report)
                }
                Err(e) => {
                    if e.requires_refresh() {
                        // Another submission may have landed first
                        if let Err(refresh) = self.reload_incident(incident_id).await {
                            warn!(incident_id, error = %refresh, "Failed to reload incident");
                        }
                    }
                    Err(e)
                }
            },
        }
    }

    #[instrument(skip(self))]
    pub async fn validate(&mut self, id: ReportId) -> Result<Report, ClientError> {
        let now = Utc::now();
        let actor = *self.actor();
        self.check_report(id, |report| lifecycle::validate(report, &actor, now)).await?;

        let result = self.backend.validate(id).await;
        self.settle(id, result).await
    }

    #[instrument(skip(self, remark))]
    pub async fn invalidate(&mut self, id: ReportId, remark: &str) -> Result<Report, ClientError> {
        let actor = *self.actor();
        self.check_report(id, |report| lifecycle::invalidate(report, &actor, remark)).await?;

        let result = self.backend.invalidate(id, remark).await;
        self.settle(id, result).await
    }

    #[instrument(skip(self))]
    pub async fn plan(&mut self, id: ReportId, date: NaiveDate) -> Result<Report, ClientError> {
        let today = Utc::now().date_naive();
        let actor = *self.actor();
        self.check_report(id, |report| lifecycle::plan(report, &actor, date, today)).await?;

        let result = self.backend.plan(id, Some(date)).await;
        self.settle(id, result).await
    }

    #[instrument(skip(self))]
    pub async fn unplan(&mut self, id: ReportId) -> Result<Report, ClientError> {
        let actor = *self.actor();
        self.check_report(id, |report| lifecycle::unplan(report, &actor)).await?;

        let result = self.backend.plan(id, None).await;
        self.settle(id, result).await
    }
}
