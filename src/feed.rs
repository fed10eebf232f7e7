//! Client-side view state.
//!
//! [`LiveState`] is the explicit session object a front-end holds instead of
//! ambient per-page state: the notification feed plus the latest known
//! version of every report. It is reloaded wholesale on (re)connection and
//! patched incrementally as events arrive.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::{Notification, NotificationId, PushEvent, Report, ReportId};
use crate::scheduling::SchedulingBoard;

/// Notifications ordered newest first, at most one entry per id.
#[derive(Debug, Clone, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the feed with an authoritative list.
    pub fn reset(&mut self, notifications: Vec<Notification>) {
        self.items.clear();
        for notification in notifications {
            self.merge(notification);
        }
    }

    /// Insert a notification at its position by creation time, replacing
    /// any previous copy with the same id. Returns `true` if it was new.
    pub fn merge(&mut self, notification: Notification) -> bool {
        let existed = match self.items.iter().position(|n| n.id == notification.id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        };
        let at = self
            .items
            .iter()
            .position(|n| is_newer(&notification, n))
            .unwrap_or(self.items.len());
        self.items.insert(at, notification);
        !existed
    }

    /// Mark a notification read locally. Returns `false` if it is unknown.
    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.lu = true;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn unread(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter().filter(|n| !n.lu)
    }

    pub fn unread_count(&self) -> usize {
        self.unread().count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn is_newer(a: &Notification, b: &Notification) -> bool {
    (a.date_creation, a.id) > (b.date_creation, b.id)
}

/// Live projection of notifications and reports for one session.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    notifications: NotificationFeed,
    reports: BTreeMap<ReportId, Report>,
    last_reload: Option<DateTime<Utc>>,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale resynchronisation after (re)connecting.
    pub fn reload(&mut self, notifications: Vec<Notification>, reports: Vec<Report>) {
        self.notifications.reset(notifications);
        self.reports = reports.into_iter().map(|r| (r.id, r)).collect();
        self.last_reload = Some(Utc::now());
    }

    /// Patch the projection with a pushed event.
    pub fn apply(&mut self, event: PushEvent) -> bool {
        match event {
            PushEvent::Incident(notification) | PushEvent::IncidentAssign(notification) => {
                self.notifications.merge(notification)
            }
        }
    }

    /// Record the authoritative version of a report returned by a call.
    pub fn upsert_report(&mut self, report: Report) {
        self.reports.insert(report.id, report);
    }

    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        self.notifications.mark_read(id)
    }

    pub fn notifications(&self) -> &NotificationFeed {
        &self.notifications
    }

    pub fn report(&self, id: ReportId) -> Option<&Report> {
        self.reports.get(&id)
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    pub fn last_reload(&self) -> Option<DateTime<Utc>> {
        self.last_reload
    }

    pub fn scheduling_board(&self) -> SchedulingBoard {
        SchedulingBoard::from_reports(self.reports.values().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        InterventionNature, NotificationKind, NotificationPayload, Priority, ReportStatus,
        ResolutionNature, Role,
    };
    use chrono::{Duration, TimeZone};

    fn notification(id: NotificationId, minutes: i64) -> Notification {
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap() + Duration::minutes(minutes);
        Notification {
            id,
            kind: NotificationKind::Incident,
            lu: false,
            destinataire_role: Role::ResponsableSi,
            destinataire: None,
            payload: NotificationPayload {
                priorite: Priority::Normale,
                createur: 2,
                type_equipement: "Poste de travail".to_string(),
                localisation: "Accueil".to_string(),
                date_creation: at,
                incident_id: Some(id),
            },
            date_creation: at,
        }
    }

    fn ids(feed: &NotificationFeed) -> Vec<NotificationId> {
        feed.iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_reset_orders_newest_first() {
        let mut feed = NotificationFeed::new();
        feed.reset(vec![notification(1, 0), notification(3, 20), notification(2, 10)]);
        assert_eq!(ids(&feed), vec![3, 2, 1]);
    }

    #[test]
    fn test_merge_prepends_without_replacing_unread() {
        let mut feed = NotificationFeed::new();
        feed.reset(vec![notification(1, 0), notification(2, 10)]);

        assert!(feed.merge(notification(3, 30)));
        assert_eq!(ids(&feed), vec![3, 2, 1]);
        assert_eq!(feed.unread_count(), 3);
    }

    #[test]
    fn test_merge_late_event_lands_in_order() {
        let mut feed = NotificationFeed::new();
        feed.reset(vec![notification(1, 0), notification(3, 30)]);
        feed.merge(notification(2, 15));
        assert_eq!(ids(&feed), vec![3, 2, 1]);
    }

    #[test]
    fn test_merge_duplicate_is_replaced() {
        let mut feed = NotificationFeed::new();
        feed.reset(vec![notification(1, 0)]);

        let mut read = notification(1, 0);
        read.lu = true;
        assert!(!feed.merge(read));
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.unread_count(), 0);
    }

    #[test]
    fn test_mark_read() {
        let mut feed = NotificationFeed::new();
        feed.reset(vec![notification(1, 0), notification(2, 5)]);
        assert!(feed.mark_read(2));
        assert!(!feed.mark_read(99));
        assert_eq!(feed.unread().map(|n| n.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_live_state_reload_replaces_everything() {
        let mut state = LiveState::new();
        state.apply(PushEvent::Incident(notification(1, 0)));
        assert_eq!(state.notifications().len(), 1);

        state.reload(vec![notification(5, 50), notification(4, 40)], vec![]);
        assert_eq!(ids(state.notifications()), vec![5, 4]);
        assert!(state.last_reload().is_some());

        state.apply(PushEvent::IncidentAssign(notification(6, 60)));
        assert_eq!(ids(state.notifications()), vec![6, 5, 4]);
    }

    #[test]
    fn test_live_state_board_follows_reports() {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
        let report = Report {
            id: 3,
            incident_id: 9,
            technicien: 7,
            diagnostic: "Disque en fin de vie".to_string(),
            nature_intervention: InterventionNature::Interne,
            nature_resolution: ResolutionNature::APlanifier,
            travaux: String::new(),
            date_debut: now,
            date_fin: now + Duration::hours(24),
            duree_minutes: 1440,
            cout: 0.0,
            intervenant_externe: None,
            statut: ReportStatus::Soumis,
            date_planification: None,
            remarque_responsable: None,
            date_validation: None,
            date_soumission: now,
            version: 1,
        };

        let mut state = LiveState::new();
        state.reload(vec![], vec![report.clone()]);
        assert!(state.scheduling_board().contains_to_schedule(3));

        state.upsert_report(Report {
            date_planification: Some(now.date_naive() + Duration::days(2)),
            version: 2,
            ..report
        });
        assert_eq!(state.report(3).map(|r| r.version), Some(2));
        assert!(state.scheduling_board().contains_scheduled(3));
    }
}
