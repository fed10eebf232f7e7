//! End-to-end tests of the client side against a running service.
//!
//! A real listener is bound on a random local port so the HTTP client and
//! the server-sent event channel are exercised as deployed.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use chrono::{DateTime, Duration as Days, Utc};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

use gestparc::api::{AppState, router};
use gestparc::backend::Backend;
use gestparc::client::HttpBackend;
use gestparc::config::ClientConfig;
use gestparc::coordinator::Coordinator;
use gestparc::error::{ClientError, Violation};
use gestparc::feed::LiveState;
use gestparc::lifecycle::LeadTimePolicy;
use gestparc::model::{
    Actor, EquipmentRef, EquipmentState, ExternalContact, InterventionNature, NewIncident,
    Priority, ReportStatus, ReportSubmission, ResolutionNature, Role,
};
use gestparc::storage::Storage;
use gestparc::sync::LiveSync;

const WAIT: Duration = Duration::from_secs(5);

async fn service() -> Router {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    router(AppState::new(storage, LeadTimePolicy::default(), 64))
}

async fn spawn_server() -> String {
    serve(service().await).await
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Service whose event streams all end when `cut` fires.
#[derive(Clone)]
struct Cuttable {
    inner: Router,
    cut: watch::Receiver<()>,
}

async fn cuttable_events(State(proxy): State<Cuttable>, request: Request) -> Response {
    let response = proxy.inner.oneshot(request).await.unwrap();
    let mut cut = proxy.cut;
    cut.borrow_and_update();
    let (parts, body) = response.into_parts();
    let body = body.into_data_stream().take_until(async move {
        let _ = cut.changed().await;
    });
    Response::from_parts(parts, Body::from_stream(body))
}

async fn spawn_cuttable_server(cut: watch::Receiver<()>) -> String {
    let inner = service().await;
    let app = Router::new()
        .route("/events", get(cuttable_events))
        .fallback_service(inner.clone())
        .with_state(Cuttable { inner, cut });
    serve(app).await
}

/// Wait until `ready` holds on a reloaded state; returns the reload time.
async fn wait_for_state(
    state: &Arc<RwLock<LiveState>>,
    ready: impl Fn(&LiveState) -> bool,
) -> DateTime<Utc> {
    timeout(WAIT, async {
        loop {
            {
                let state = state.read().await;
                if let Some(at) = state.last_reload().filter(|_| ready(&*state)) {
                    return at;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

fn coordinator(base_url: &str, id: i64, role: Role) -> Coordinator<HttpBackend> {
    Coordinator::new(
        HttpBackend::new(base_url, Actor::new(id, role)),
        LeadTimePolicy::default(),
    )
}

fn new_incident(priorite: Priority, days: i64) -> NewIncident {
    NewIncident {
        priorite,
        equipement: EquipmentRef {
            id: 31,
            famille: "Serveur".to_string(),
            localisation: "Baie B2".to_string(),
        },
        etat_equipement: EquipmentState::Arret,
        description: "Alimentation redondante en défaut".to_string(),
        pieces_jointes: vec![],
        echeance: Utc::now().date_naive() + Days::days(days),
    }
}

fn planned_submission(incident_id: i64) -> ReportSubmission {
    ReportSubmission {
        incident_id,
        diagnostic: "Bloc d'alimentation HS".to_string(),
        nature_intervention: InterventionNature::SousTraitant,
        nature_resolution: ResolutionNature::APlanifier,
        travaux: String::new(),
        date_debut: Utc::now(),
        date_fin: Some(Utc::now() + Days::hours(1)),
        cout: 250.0,
        intervenant_externe: Some(ExternalContact {
            nom: "Datacenter Services".to_string(),
            email: "support@dcs.example".to_string(),
            telephone: "0499999999".to_string(),
        }),
    }
}

/// Declare, assign and submit a plannable report; returns (incident, report) ids.
async fn planned_report(base_url: &str) -> (i64, i64) {
    let mut requester = coordinator(base_url, 2, Role::Demandeur);
    let incident = requester
        .declare_incident(&new_incident(Priority::Normale, 6))
        .await
        .unwrap();

    let mut manager = coordinator(base_url, 1, Role::ResponsableSi);
    manager.assign_technician(incident.id, 7).await.unwrap();

    let mut technician = coordinator(base_url, 7, Role::Technicien);
    let report = technician
        .submit_report(&planned_submission(incident.id))
        .await
        .unwrap();
    (incident.id, report.id)
}

#[tokio::test]
async fn test_health_probe() {
    let base_url = spawn_server().await;
    let backend = HttpBackend::new(&base_url, Actor::new(1, Role::Admin));

    assert_ok!(backend.health(WAIT).await);
}

#[tokio::test]
async fn test_server_violation_is_decoded() {
    let base_url = spawn_server().await;
    let backend = HttpBackend::new(&base_url, Actor::new(2, Role::Demandeur));

    // Straight to the backend, skipping the local check
    let err = assert_err!(
        backend
            .create_incident(&new_incident(Priority::Urgent, 1))
            .await
    );
    assert!(matches!(
        err,
        ClientError::Validation(Violation::LeadTimeTooShort {
            priorite: Priority::Urgent,
            min_days: 2,
            ..
        })
    ));
    assert!(!err.requires_refresh());
}

#[tokio::test]
async fn test_missing_records() {
    let base_url = spawn_server().await;
    let mut requester = coordinator(&base_url, 2, Role::Demandeur);
    let incident = requester
        .declare_incident(&new_incident(Priority::Basse, 8))
        .await
        .unwrap();

    let backend = HttpBackend::new(&base_url, Actor::new(1, Role::ResponsableSi));
    assert!(
        backend
            .get_report_by_incident(incident.id)
            .await
            .unwrap()
            .is_none()
    );
    let err = assert_err!(backend.get_report_by_incident(999).await);
    assert!(matches!(err, ClientError::NotFound(_)));
}

#[tokio::test]
async fn test_full_lifecycle_through_coordinator() {
    let base_url = spawn_server().await;
    let (incident_id, report_id) = planned_report(&base_url).await;

    let mut manager = coordinator(&base_url, 1, Role::ResponsableSi);
    let (_, report) = manager.open(incident_id).await.unwrap();
    assert_eq!(report.unwrap().id, report_id);

    // Rejected locally until planned
    let err = assert_err!(manager.validate(report_id).await);
    assert_eq!(err.violation(), Some(&Violation::AwaitingPlanning));

    let board = manager.backend().scheduling_board().await.unwrap();
    assert!(board.contains_to_schedule(report_id));

    let date = Utc::now().date_naive() + Days::days(2);
    let planned = manager.plan(report_id, date).await.unwrap();
    assert_eq!(planned.date_planification, Some(date));

    let board = manager.backend().scheduling_board().await.unwrap();
    assert!(board.contains_scheduled(report_id));
    assert!(!board.contains_to_schedule(report_id));

    let validated = manager.validate(report_id).await.unwrap();
    assert_eq!(validated.statut, ReportStatus::Valide);

    let err = assert_err!(manager.unplan(report_id).await);
    assert!(matches!(
        err.violation(),
        Some(Violation::AlreadyValidated { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_reviewer_gets_conflict_and_fresh_state() {
    let base_url = spawn_server().await;
    let (incident_id, report_id) = planned_report(&base_url).await;

    let mut first = coordinator(&base_url, 1, Role::ResponsableSi);
    let mut second = coordinator(&base_url, 3, Role::ResponsableSi);
    first.open(incident_id).await.unwrap();
    second.open(incident_id).await.unwrap();

    let date = Utc::now().date_naive() + Days::days(1);
    first.plan(report_id, date).await.unwrap();
    first.validate(report_id).await.unwrap();

    // The second reviewer still sees an unplanned SOUMIS report
    let stale_date = Utc::now().date_naive() + Days::days(4);
    let err = assert_err!(second.plan(report_id, stale_date).await);
    assert!(matches!(err, ClientError::Conflict { .. }));
    assert!(err.requires_refresh());

    let refreshed = second.report(report_id).unwrap();
    assert_eq!(refreshed.statut, ReportStatus::Valide);
    assert_eq!(refreshed.date_planification, Some(date));
}

#[tokio::test]
async fn test_live_sync_receives_pushed_notifications() {
    let base_url = spawn_server().await;

    // One incident exists before the manager connects
    let mut requester = coordinator(&base_url, 2, Role::Demandeur);
    requester
        .declare_incident(&new_incident(Priority::Normale, 5))
        .await
        .unwrap();

    let config = ClientConfig {
        base_url: base_url.clone(),
        reconnect_delay: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let manager = Actor::new(1, Role::ResponsableSi);
    let mut sync = LiveSync::from_config(&config, manager).unwrap();
    timeout(WAIT, sync.connect()).await.unwrap().unwrap();
    assert!(sync.is_connected());
    {
        let state = sync.state();
        let state = state.read().await;
        assert_eq!(state.notifications().len(), 1);
        assert!(state.last_reload().is_some());
    }

    let incident = requester
        .declare_incident(&new_incident(Priority::Urgent, 3))
        .await
        .unwrap();

    assert!(timeout(WAIT, sync.pump()).await.unwrap().unwrap());
    let newest_id = {
        let state = sync.state();
        let state = state.read().await;
        assert_eq!(state.notifications().len(), 2);
        assert_eq!(state.notifications().unread_count(), 2);
        let newest = state.notifications().iter().next().unwrap();
        assert_eq!(newest.payload.incident_id, Some(incident.id));
        assert_eq!(newest.payload.priorite, Priority::Urgent);
        newest.id
    };

    let read = sync.mark_read(newest_id).await.unwrap();
    assert!(read.lu);
    assert_eq!(sync.state().read().await.notifications().unread_count(), 1);
}

#[tokio::test]
async fn test_transitions_feed_the_live_board() {
    let base_url = spawn_server().await;
    let (_, report_id) = planned_report(&base_url).await;

    let config = ClientConfig {
        base_url: base_url.clone(),
        ..ClientConfig::default()
    };
    let actor = Actor::new(1, Role::ResponsableSi);
    let mut manager = Coordinator::from_config(&config, actor).unwrap();
    let mut sync = LiveSync::from_config(&config, actor).unwrap();
    timeout(WAIT, sync.connect()).await.unwrap().unwrap();
    assert!(
        sync.state()
            .read()
            .await
            .scheduling_board()
            .contains_to_schedule(report_id)
    );

    let date = Utc::now().date_naive() + Days::days(1);
    let planned = manager.plan(report_id, date).await.unwrap();
    sync.record(planned).await;

    let state = sync.state();
    let state = state.read().await;
    assert!(state.scheduling_board().contains_scheduled(report_id));
    assert_eq!(
        state.report(report_id).and_then(|r| r.date_planification),
        Some(date)
    );
}

#[tokio::test]
async fn test_live_sync_only_delivers_own_assignments() {
    let base_url = spawn_server().await;

    let technician = HttpBackend::new(&base_url, Actor::new(7, Role::Technicien));
    let mut sync = LiveSync::new(technician, Duration::from_millis(50));
    timeout(WAIT, sync.connect()).await.unwrap().unwrap();

    let mut requester = coordinator(&base_url, 2, Role::Demandeur);
    let mut manager = coordinator(&base_url, 1, Role::ResponsableSi);
    let other = requester
        .declare_incident(&new_incident(Priority::Basse, 9))
        .await
        .unwrap();
    let mine = requester
        .declare_incident(&new_incident(Priority::Basse, 9))
        .await
        .unwrap();
    manager.assign_technician(other.id, 8).await.unwrap();
    manager.assign_technician(mine.id, 7).await.unwrap();

    // Incident declarations and the other technician's assignment are filtered out
    assert!(timeout(WAIT, sync.pump()).await.unwrap().unwrap());
    let state = sync.state();
    let state = state.read().await;
    assert_eq!(state.notifications().len(), 1);
    let notification = state.notifications().iter().next().unwrap();
    assert_eq!(notification.payload.incident_id, Some(mine.id));
    assert_eq!(notification.destinataire, Some(7));
}

#[tokio::test]
async fn test_failed_reload_leaves_sync_disconnected() {
    // Events are served, but nothing can be reloaded
    let app = Router::new()
        .route("/notifications", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/rapports", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .fallback_service(service().await);
    let base_url = serve(app).await;

    let backend = HttpBackend::new(&base_url, Actor::new(1, Role::ResponsableSi));
    let mut sync = LiveSync::new(backend, Duration::from_millis(50));

    let err = assert_err!(timeout(WAIT, sync.connect()).await.unwrap());
    assert!(matches!(err, ClientError::Transport(_)));
    assert!(!sync.is_connected());
    assert!(sync.state().read().await.last_reload().is_none());
}

#[tokio::test]
async fn test_live_sync_reloads_after_reconnect() {
    let (cut_tx, cut_rx) = watch::channel(());
    let base_url = spawn_cuttable_server(cut_rx).await;

    let mut requester = coordinator(&base_url, 2, Role::Demandeur);
    requester
        .declare_incident(&new_incident(Priority::Normale, 5))
        .await
        .unwrap();

    let backend = HttpBackend::new(&base_url, Actor::new(1, Role::ResponsableSi));
    let sync = LiveSync::new(backend, Duration::from_millis(300));
    let state = sync.state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(sync.run(stop_rx));

    let first = wait_for_state(&state, |s| s.notifications().len() == 1).await;

    // Drop the channel, then declare while the client is away
    cut_tx.send(()).unwrap();
    let missed = requester
        .declare_incident(&new_incident(Priority::Urgent, 3))
        .await
        .unwrap();

    let second = wait_for_state(&state, |s| {
        s.notifications().len() == 2 && s.last_reload() > Some(first)
    })
    .await;
    assert!(second > first);
    {
        let state = state.read().await;
        let newest = state.notifications().iter().next().unwrap();
        assert_eq!(newest.payload.incident_id, Some(missed.id));
    }

    stop_tx.send(true).unwrap();
    let sync = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(sync.is_connected());
}
