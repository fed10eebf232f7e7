//! SQLite storage layer for the reference service.
//!
//! The service is the system of record for incidents, reports and
//! notifications. Concurrency between reviewers is settled here rather than
//! in memory:
//!
//! - one report per incident (`UNIQUE(incident_id)`);
//! - report updates are conditional on the `version` the caller read, so a
//!   stale transition affects no row and surfaces as a conflict;
//! - technician assignment only succeeds while no report exists.
//!
//! Timestamps are stored as microseconds since the Unix epoch, dates as
//! `YYYY-MM-DD` text and enums as their wire constants.

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::model::{
    Actor, EquipmentRef, ExternalContact, Incident, IncidentId, Notification, NotificationId,
    NotificationPayload, Report, ReportId, ReportStatus, UserId,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

const REPORT_COLUMNS: &str = r#"
    id, incident_id, technicien, diagnostic, nature_intervention, nature_resolution,
    travaux, date_debut, date_fin, duree_minutes, cout, externe_nom, externe_email,
    externe_telephone, statut, date_planification, remarque_responsable,
    date_validation, date_soumission, version
"#;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:gestparc.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to ":memory:" opens a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                createur INTEGER NOT NULL,
                priorite TEXT NOT NULL,
                equipement_id INTEGER NOT NULL,
                famille TEXT NOT NULL,
                localisation TEXT NOT NULL,
                etat_equipement TEXT NOT NULL,
                description TEXT NOT NULL,
                pieces_jointes TEXT NOT NULL,
                date_creation INTEGER NOT NULL,
                echeance TEXT NOT NULL,
                technicien INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id INTEGER NOT NULL UNIQUE REFERENCES incidents(id),
                technicien INTEGER NOT NULL,
                diagnostic TEXT NOT NULL,
                nature_intervention TEXT NOT NULL,
                nature_resolution TEXT NOT NULL,
                travaux TEXT NOT NULL,
                date_debut INTEGER NOT NULL,
                date_fin INTEGER NOT NULL,
                duree_minutes INTEGER NOT NULL,
                cout REAL NOT NULL,
                externe_nom TEXT,
                externe_email TEXT,
                externe_telephone TEXT,
                statut TEXT NOT NULL,
                date_planification TEXT,
                remarque_responsable TEXT,
                date_validation INTEGER,
                date_soumission INTEGER NOT NULL,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                lu INTEGER NOT NULL DEFAULT 0,
                destinataire_role TEXT NOT NULL,
                destinataire INTEGER,
                priorite TEXT NOT NULL,
                createur INTEGER NOT NULL,
                type_equipement TEXT NOT NULL,
                localisation TEXT NOT NULL,
                incident_date_creation INTEGER NOT NULL,
                incident_id INTEGER,
                date_creation INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for the per-recipient, newest-first listing
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_recipient
            ON notifications(destinataire_role, destinataire, date_creation)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Incidents
    // ------------------------------------------------------------------

    /// Insert a declared incident and return it with its assigned id.
    pub async fn insert_incident(&self, incident: &Incident) -> anyhow::Result<Incident> {
        let pieces_jointes = serde_json::to_string(&incident.pieces_jointes)?;

        let result = sqlx::query(
            r#"
            INSERT INTO incidents (
                createur, priorite, equipement_id, famille, localisation, etat_equipement,
                description, pieces_jointes, date_creation, echeance, technicien
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(incident.createur)
        .bind(incident.priorite.as_str())
        .bind(incident.equipement.id)
        .bind(&incident.equipement.famille)
        .bind(&incident.equipement.localisation)
        .bind(incident.etat_equipement.as_str())
        .bind(&incident.description)
        .bind(pieces_jointes)
        .bind(incident.date_creation.timestamp_micros())
        .bind(incident.echeance.format(DATE_FORMAT).to_string())
        .bind(incident.technicien)
        .execute(&self.pool)
        .await?;

        Ok(Incident {
            id: result.last_insert_rowid(),
            ..incident.clone()
        })
    }

    pub async fn get_incident(&self, id: IncidentId) -> anyhow::Result<Option<Incident>> {
        let row = sqlx::query("SELECT * FROM incidents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(incident_from_row).transpose()
    }

    /// Assign a technician while no report exists for the incident.
    ///
    /// Returns `false` when the incident is missing or work has started.
    pub async fn assign_technician(
        &self,
        id: IncidentId,
        technician: UserId,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE incidents SET technicien = ?
            WHERE id = ?
              AND NOT EXISTS (SELECT 1 FROM reports WHERE reports.incident_id = incidents.id)
            "#,
        )
        .bind(technician)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// Insert the first report of an incident.
    ///
    /// Returns `None` if the incident already has a report.
    pub async fn insert_report(&self, report: &Report) -> anyhow::Result<Option<Report>> {
        let contact = report.intervenant_externe.as_ref();

        let result = sqlx::query(
            r#"
            INSERT INTO reports (
                incident_id, technicien, diagnostic, nature_intervention, nature_resolution,
                travaux, date_debut, date_fin, duree_minutes, cout, externe_nom, externe_email,
                externe_telephone, statut, date_planification, remarque_responsable,
                date_validation, date_soumission, version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(report.incident_id)
        .bind(report.technicien)
        .bind(&report.diagnostic)
        .bind(report.nature_intervention.as_str())
        .bind(report.nature_resolution.as_str())
        .bind(&report.travaux)
        .bind(report.date_debut.timestamp_micros())
        .bind(report.date_fin.timestamp_micros())
        .bind(report.duree_minutes)
        .bind(report.cout)
        .bind(contact.map(|c| c.nom.clone()))
        .bind(contact.map(|c| c.email.clone()))
        .bind(contact.map(|c| c.telephone.clone()))
        .bind(report.statut.as_str())
        .bind(report.date_planification.map(|d| d.format(DATE_FORMAT).to_string()))
        .bind(&report.remarque_responsable)
        .bind(report.date_validation.map(|d| d.timestamp_micros()))
        .bind(report.date_soumission.timestamp_micros())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => self.get_report(done.last_insert_rowid()).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a new version of a report if nobody changed it since `report.version`.
    ///
    /// Returns `None` when the stored version moved on (or the report vanished).
    pub async fn update_report(&self, report: &Report) -> anyhow::Result<Option<Report>> {
        let contact = report.intervenant_externe.as_ref();

        let result = sqlx::query(
            r#"
            UPDATE reports SET
                technicien = ?, diagnostic = ?, nature_intervention = ?, nature_resolution = ?,
                travaux = ?, date_debut = ?, date_fin = ?, duree_minutes = ?, cout = ?,
                externe_nom = ?, externe_email = ?, externe_telephone = ?, statut = ?,
                date_planification = ?, remarque_responsable = ?, date_validation = ?,
                date_soumission = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(report.technicien)
        .bind(&report.diagnostic)
        .bind(report.nature_intervention.as_str())
        .bind(report.nature_resolution.as_str())
        .bind(&report.travaux)
        .bind(report.date_debut.timestamp_micros())
        .bind(report.date_fin.timestamp_micros())
        .bind(report.duree_minutes)
        .bind(report.cout)
        .bind(contact.map(|c| c.nom.clone()))
        .bind(contact.map(|c| c.email.clone()))
        .bind(contact.map(|c| c.telephone.clone()))
        .bind(report.statut.as_str())
        .bind(report.date_planification.map(|d| d.format(DATE_FORMAT).to_string()))
        .bind(&report.remarque_responsable)
        .bind(report.date_validation.map(|d| d.timestamp_micros()))
        .bind(report.date_soumission.timestamp_micros())
        .bind(report.id)
        .bind(report.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_report(report.id).await
    }

    pub async fn get_report(&self, id: ReportId) -> anyhow::Result<Option<Report>> {
        let row = sqlx::query(&format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(report_from_row).transpose()
    }

    pub async fn get_report_by_incident(
        &self,
        incident_id: IncidentId,
    ) -> anyhow::Result<Option<Report>> {
        let row = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE incident_id = ?"
        ))
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(report_from_row).transpose()
    }

    /// List reports, optionally restricted to one status, by id.
    pub async fn list_reports(&self, statut: Option<ReportStatus>) -> anyhow::Result<Vec<Report>> {
        let rows = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE (?1 IS NULL OR statut = ?1) ORDER BY id"
        ))
        .bind(statut.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(report_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> anyhow::Result<Notification> {
        let payload = &notification.payload;

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                kind, lu, destinataire_role, destinataire, priorite, createur,
                type_equipement, localisation, incident_date_creation, incident_id, date_creation
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(notification.kind.as_str())
        .bind(notification.lu)
        .bind(notification.destinataire_role.as_str())
        .bind(notification.destinataire)
        .bind(payload.priorite.as_str())
        .bind(payload.createur)
        .bind(&payload.type_equipement)
        .bind(&payload.localisation)
        .bind(payload.date_creation.timestamp_micros())
        .bind(payload.incident_id)
        .bind(notification.date_creation.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(Notification {
            id: result.last_insert_rowid(),
            ..notification.clone()
        })
    }

    /// Notifications addressed to `actor`, newest first.
    pub async fn list_notifications(
        &self,
        actor: &Actor,
        unread_only: bool,
    ) -> anyhow::Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM notifications
            WHERE destinataire_role = ?
              AND (destinataire IS NULL OR destinataire = ?)
              AND (? = 0 OR lu = 0)
            ORDER BY date_creation DESC, id DESC
            "#,
        )
        .bind(actor.role.as_str())
        .bind(actor.id)
        .bind(unread_only)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(notification_from_row).collect()
    }

    /// Mark a notification addressed to `actor` as read.
    ///
    /// Returns `None` if no such notification is visible to the actor.
    pub async fn mark_notification_read(
        &self,
        id: NotificationId,
        actor: &Actor,
    ) -> anyhow::Result<Option<Notification>> {
        let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(notification) = row.as_ref().map(notification_from_row).transpose()? else {
            return Ok(None);
        };
        if !notification.is_addressed_to(actor) {
            return Ok(None);
        }

        sqlx::query("UPDATE notifications SET lu = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(Some(Notification {
            lu: true,
            ..notification
        }))
    }
}

fn parse_enum<T: DeserializeOwned>(value: String) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(value.clone()))
        .with_context(|| format!("unknown stored value {value:?}"))
}

fn parse_timestamp(micros: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| anyhow!("timestamp out of range: {micros}"))
}

fn parse_date(value: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .with_context(|| format!("invalid stored date {value:?}"))
}

fn incident_from_row(row: &SqliteRow) -> anyhow::Result<Incident> {
    let pieces_jointes: String = row.get("pieces_jointes");
    let echeance: String = row.get("echeance");

    Ok(Incident {
        id: row.get("id"),
        createur: row.get("createur"),
        priorite: parse_enum(row.get("priorite"))?,
        equipement: EquipmentRef {
            id: row.get("equipement_id"),
            famille: row.get("famille"),
            localisation: row.get("localisation"),
        },
        etat_equipement: parse_enum(row.get("etat_equipement"))?,
        description: row.get("description"),
        pieces_jointes: serde_json::from_str(&pieces_jointes)?,
        date_creation: parse_timestamp(row.get("date_creation"))?,
        echeance: parse_date(&echeance)?,
        technicien: row.get("technicien"),
    })
}

fn report_from_row(row: &SqliteRow) -> anyhow::Result<Report> {
    let nom: Option<String> = row.get("externe_nom");
    let email: Option<String> = row.get("externe_email");
    let telephone: Option<String> = row.get("externe_telephone");
    let intervenant_externe = match (nom, email, telephone) {
        (Some(nom), Some(email), Some(telephone)) => Some(ExternalContact {
            nom,
            email,
            telephone,
        }),
        _ => None,
    };

    let date_planification: Option<String> = row.get("date_planification");
    let date_validation: Option<i64> = row.get("date_validation");

    Ok(Report {
        id: row.get("id"),
        incident_id: row.get("incident_id"),
        technicien: row.get("technicien"),
        diagnostic: row.get("diagnostic"),
        nature_intervention: parse_enum(row.get("nature_intervention"))?,
        nature_resolution: parse_enum(row.get("nature_resolution"))?,
        travaux: row.get("travaux"),
        date_debut: parse_timestamp(row.get("date_debut"))?,
        date_fin: parse_timestamp(row.get("date_fin"))?,
        duree_minutes: row.get("duree_minutes"),
        cout: row.get("cout"),
        intervenant_externe,
        statut: parse_enum(row.get("statut"))?,
        date_planification: date_planification.as_deref().map(parse_date).transpose()?,
        remarque_responsable: row.get("remarque_responsable"),
        date_validation: date_validation.map(parse_timestamp).transpose()?,
        date_soumission: parse_timestamp(row.get("date_soumission"))?,
        version: row.get("version"),
    })
}

fn notification_from_row(row: &SqliteRow) -> anyhow::Result<Notification> {
    Ok(Notification {
        id: row.get("id"),
        kind: parse_enum(row.get("kind"))?,
        lu: row.get("lu"),
        destinataire_role: parse_enum(row.get("destinataire_role"))?,
        destinataire: row.get("destinataire"),
        payload: NotificationPayload {
            priorite: parse_enum(row.get("priorite"))?,
            createur: row.get("createur"),
            type_equipement: row.get("type_equipement"),
            localisation: row.get("localisation"),
            date_creation: parse_timestamp(row.get("incident_date_creation"))?,
            incident_id: row.get("incident_id"),
        },
        date_creation: parse_timestamp(row.get("date_creation"))?,
    })
}
