//! Scheduling board: reports whose resolution has to be planned, split
//! into "to schedule" and "scheduled".
//!
//! This is a projection over the lifecycle, not a state machine of its own.
//! A report moves between the two partitions only through `plan`/`unplan`,
//! whose results are fed back with [`SchedulingBoard::apply`].

use serde::{Deserialize, Serialize};

use crate::model::{Report, ReportId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingBoard {
    /// Plannable reports without a planning date, oldest submission first.
    pub to_schedule: Vec<Report>,

    /// Reports with a planning date, earliest date first.
    pub scheduled: Vec<Report>,
}

impl SchedulingBoard {
    pub fn from_reports<I>(reports: I) -> Self
    where
        I: IntoIterator<Item = Report>,
    {
        let mut board = Self::default();
        for report in reports {
            board.insert(report);
        }
        board.sort();
        board
    }

    /// Replace (or add) a report after a transition, moving it to the
    /// partition its planning date now selects.
    pub fn apply(&mut self, report: Report) {
        self.remove(report.id);
        self.insert(report);
        self.sort();
    }

    pub fn remove(&mut self, id: ReportId) {
        self.to_schedule.retain(|r| r.id != id);
        self.scheduled.retain(|r| r.id != id);
    }

    pub fn contains_to_schedule(&self, id: ReportId) -> bool {
        self.to_schedule.iter().any(|r| r.id == id)
    }

    pub fn contains_scheduled(&self, id: ReportId) -> bool {
        self.scheduled.iter().any(|r| r.id == id)
    }

    fn insert(&mut self, report: Report) {
        if !report.needs_planning() {
            return;
        }
        if report.is_planned() {
            self.scheduled.push(report);
        } else if !report.statut.is_terminal() {
            self.to_schedule.push(report);
        }
    }

    fn sort(&mut self) {
        self.to_schedule
            .sort_by_key(|r| (r.date_soumission, r.id));
        self.scheduled
            .sort_by_key(|r| (r.date_planification, r.id));
    }
}
