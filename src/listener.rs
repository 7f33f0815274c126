//! Notification Listener.
//!
//! Owns one dedicated connection (outside the pool) subscribed to the
//! prefix-scoped channel. A malformed event is logged and discarded, never
//! crashes the listener. On reconnection the listener performs a resync:
//! the safe default named in the design notes is to invalidate every local
//! entry, since during the outage it may have missed events for any of
//! them — re-reading everything instead would also be correct but isn't
//! necessary for the facade's read path to stay correct.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::BackoffConfig;
use crate::local_store::LocalStore;
use crate::metrics::FacadeCounters;
use crate::model::{Event, EventOp};

/// Background task driving the listener. Dropping this handle (or calling
/// [`ListenerHandle::shutdown`]) stops the task; `close()` on the facade
/// awaits that stop.
pub struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    /// Signal the listener task to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the listener task. Returns immediately; the task runs until
/// [`ListenerHandle::shutdown`] is called.
pub fn spawn(
    pool: PgPool,
    channel: String,
    local_store: Arc<LocalStore>,
    counters: Arc<FacadeCounters>,
    backoff: BackoffConfig,
) -> ListenerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(pool, channel, local_store, counters, backoff, shutdown_rx));
    ListenerHandle { shutdown_tx, task }
}

async fn run(
    pool: PgPool,
    channel: String,
    local_store: Arc<LocalStore>,
    counters: Arc<FacadeCounters>,
    backoff: BackoffConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = backoff.initial;
    let mut first_attempt = true;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(err) => {
                warn!(%err, "notification listener failed to connect, retrying");
                if wait_or_shutdown(delay, &mut shutdown_rx).await {
                    return;
                }
                delay = (delay * 2).min(backoff.max);
                continue;
            }
        };

        if let Err(err) = listener.listen(&channel).await {
            warn!(%err, channel = %channel, "failed to subscribe to notification channel");
            if wait_or_shutdown(delay, &mut shutdown_rx).await {
                return;
            }
            delay = (delay * 2).min(backoff.max);
            continue;
        }

        if !first_attempt {
            info!(channel = %channel, "notification listener reconnected, resyncing local tier");
            local_store.clear();
            counters.record_listener_reconnect();
        }
        first_attempt = false;
        delay = backoff.initial;
        info!(channel = %channel, "notification listener subscribed");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                received = listener.try_recv() => {
                    match received {
                        Ok(Some(notification)) => {
                            handle_payload(notification.payload(), &local_store, &counters);
                        }
                        Ok(None) => {
                            // Connection closed cleanly; reconnect.
                            break;
                        }
                        Err(err) => {
                            warn!(%err, "notification listener connection lost");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}

fn handle_payload(payload: &str, local_store: &LocalStore, counters: &FacadeCounters) {
    match serde_json::from_str::<Event>(payload) {
        Ok(event) => {
            counters.record_event_received();
            debug!(op = ?event.op, version = event.version, "notification event received");
            apply_event(&event, local_store);
        }
        Err(err) => {
            counters.record_event_discarded();
            error!(%err, payload, "discarding malformed notification event");
        }
    }
}

fn apply_event(event: &Event, local_store: &LocalStore) {
    match event.op {
        EventOp::Upsert | EventOp::Delete => {
            // Either a newer version exists or the key was deleted: in
            // both cases the simplest correct action is to evict the local
            // copy so the next read refetches from the backend. The
            // listener never installs values directly, avoiding any
            // ordering hazard between event arrival and a concurrent
            // facade read.
            local_store.invalidate(&event.key);
        }
    }
}
