//! Live subscription to the push channel.
//!
//! [`LiveSync`] keeps a shared [`LiveState`] current. On every (re)connection
//! it subscribes first and then reloads notifications and reports wholesale,
//! so nothing emitted while it was away is missed; afterwards each pushed
//! event is merged incrementally. A `resync` control event from the server
//! triggers another wholesale reload.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::client::{EventStream, HttpBackend, StreamEvent};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::feed::LiveState;
use crate::model::{Actor, Notification, NotificationId, Report};

pub struct LiveSync {
    backend: HttpBackend,
    state: Arc<RwLock<LiveState>>,
    stream: Option<EventStream>,
    reconnect_delay: Duration,
}

impl LiveSync {
    pub fn new(backend: HttpBackend, reconnect_delay: Duration) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(LiveState::new())),
            stream: None,
            reconnect_delay,
        }
    }

    pub fn from_config(config: &ClientConfig, actor: Actor) -> Result<Self, ClientError> {
        Ok(Self::new(
            HttpBackend::from_config(config, actor)?,
            config.reconnect_delay,
        ))
    }

    /// Shared handle to the projection this subscription maintains.
    pub fn state(&self) -> Arc<RwLock<LiveState>> {
        Arc::clone(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the push channel, then reload everything.
    ///
    /// The subscription only counts as connected once the reload succeeded;
    /// on failure the channel is dropped so the next attempt starts over.
    #[instrument(skip(self), fields(actor_id = self.backend.actor().id))]
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.stream = None;
        let stream = self.backend.subscribe().await?;
        self.resync().await?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Replace the projection with authoritative state.
    pub async fn resync(&mut self) -> Result<(), ClientError> {
        let notifications = self.backend.list_notifications(false).await?;
        let reports = self.backend.list_reports(None).await?;

        let mut state = self.state.write().await;
        state.reload(notifications, reports);
        info!(
            notifications = state.notifications().len(),
            unread = state.notifications().unread_count(),
            "Live state reloaded"
        );
        Ok(())
    }

    /// Record a report returned by a successful transition.
    pub async fn record(&self, report: Report) {
        self.state.write().await.upsert_report(report);
    }

    /// Mark a notification read on the server, then locally.
    pub async fn mark_read(&self, id: NotificationId) -> Result<Notification, ClientError> {
        let notification = self.backend.mark_notification_read(id).await?;
        self.state.write().await.mark_read(id);
        Ok(notification)
    }

    /// Wait for and apply the next event.
    ///
    /// Returns `Ok(false)` once the channel is closed; the next call to
    /// [`LiveSync::connect`] reopens it.
    pub async fn pump(&mut self) -> Result<bool, ClientError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };

        let next = stream.next().await;
        match next {
            Ok(Some(StreamEvent::Push(event))) => {
                let name = event.name();
                let id = event.notification().id;
                let added = self.state.write().await.apply(event);
                debug!(event = name, notification_id = id, added, "Event applied");
                Ok(true)
            }
            Ok(Some(StreamEvent::Resync)) => {
                info!("Server requested resync");
                if let Err(e) = self.resync().await {
                    // Reconnecting reloads again
                    self.stream = None;
                    return Err(e);
                }
                Ok(true)
            }
            Ok(None) => {
                self.stream = None;
                Ok(false)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Keep the projection live until `shutdown` turns true (or its sender
    /// is dropped), reconnecting after `reconnect_delay` whenever the
    /// channel drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.is_connected() {
                if let Err(e) = self.connect().await {
                    warn!(error = %e, delay = ?self.reconnect_delay, "Live channel unavailable, retrying");
                    if wait_or_shutdown(self.reconnect_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            // Err(true): the shutdown sender is gone
            let outcome = tokio::select! {
                result = self.pump() => Ok(result),
                changed = shutdown.changed() => Err(changed.is_err()),
            };

            let failed = match outcome {
                Err(true) => break,
                Err(false) | Ok(Ok(true)) => false,
                Ok(Ok(false)) => {
                    info!("Live channel closed by server");
                    true
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Live channel failed");
                    true
                }
            };
            if failed && wait_or_shutdown(self.reconnect_delay, &mut shutdown).await {
                break;
            }
        }

        info!("Live sync stopped");
        self
    }
}

/// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sender_gone = tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    sender_gone || *shutdown.borrow()
}
