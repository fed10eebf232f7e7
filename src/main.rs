//! Gestparc reference service.
//!
//! # API Endpoints
//!
//! - `POST /incidents`, `GET /incidents/:id`, `GET /incidents/:id/rapport`,
//!   `POST /incidents/:id/technicien`
//! - `GET|POST /rapports`, `GET|PATCH /rapports/:id`,
//!   `POST /rapports/:id/valider`, `POST /rapports/:id/invalider`,
//!   `PUT /rapports/:id/planification`
//! - `GET /planification` - Scheduling board
//! - `GET /notifications`, `POST /notifications/:id/lu`
//! - `GET /events` - Server-sent events
//! - `GET /health` - Health check

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gestparc::api::{AppState, router};
use gestparc::config::ServerConfig;
use gestparc::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("gestparc=info".parse()?))
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env()?;

    info!(
        port = config.port,
        db_url = %config.database_url,
        lead_time = ?config.lead_time,
        "Starting Gestparc server"
    );

    // Initialize storage
    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let state = AppState::new(storage, config.lead_time, config.event_buffer);
    let app = router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Gestparc is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
