//! Best-effort wakeups for ring pollers.
//!
//! Membership changes publish a NOTIFY on [`NOTIFY_CHANNEL`] carrying the
//! ring name. A [`NotificationBus`] holds one LISTEN connection per process
//! and fans events out to in-process subscribers of that ring.
//!
//! Events carry no data and may be lost (for example across a listener
//! reconnect). Nothing may depend on receiving one; pollers still poll.

use dashmap::DashMap;
use sqlx::postgres::PgListener;
use sqlx::{PgExecutor, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::Error;

pub const NOTIFY_CHANNEL: &str = "ring_membership";

/// Per-ring buffer; a slow receiver only needs to know that something happened.
const EVENT_CAPACITY: usize = 16;

/// Publish a wakeup for `ring`.
///
/// Inside a transaction the notification is delivered only if the
/// transaction commits.
pub async fn publish<'e, E>(executor: E, ring: &str) -> Result<(), Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(ring)
        .execute(executor)
        .await?;
    Ok(())
}

type Senders = Arc<DashMap<String, broadcast::Sender<()>>>;

/// Process-local fan-out of ring notifications.
pub struct NotificationBus {
    pool: PgPool,
    senders: Senders,
    cancel_token: CancellationToken,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl NotificationBus {
    /// Start listening. LISTEN is active when this returns.
    ///
    /// The listener needs a session-level connection, so `pool` must not go
    /// through a transaction-mode pooler.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener connection cannot be established.
    pub async fn start(pool: PgPool) -> Result<Self, Error> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let senders: Senders = Arc::new(DashMap::new());
        let cancel_token = CancellationToken::new();
        let task_handle =
            Self::spawn_listener_task(listener, senders.clone(), cancel_token.clone());

        tracing::debug!(channel = NOTIFY_CHANNEL, "Notification bus started");
        Ok(Self {
            pool,
            senders,
            cancel_token,
            task_handle: Some(task_handle),
        })
    }

    fn spawn_listener_task(
        mut listener: PgListener,
        senders: Senders,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Notification bus shutting down");
                        break;
                    }

                    received = listener.recv() => {
                        match received {
                            Ok(notification) => {
                                consecutive_failures = 0;
                                dispatch(&senders, notification.payload());
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                                tracing::warn!(
                                    failures = consecutive_failures,
                                    backoff_ms,
                                    "Notification listener failed: {}, backing off",
                                    e
                                );
                                // Notifications sent while disconnected are lost
                                wake_all(&senders);
                                tokio::select! {
                                    _ = cancel_token.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Publish a wakeup for `ring` to every process listening.
    pub async fn publish(&self, ring: &str) -> Result<(), Error> {
        publish(&self.pool, ring).await
    }

    /// Subscribe to wakeups for `ring`.
    pub fn subscribe(&self, ring: &str) -> RingEvents {
        let rx = self
            .senders
            .entry(ring.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .subscribe();
        RingEvents { rx }
    }

    /// Stop the listener task. Open [`RingEvents`] streams end.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
        self.senders.clear();
        tracing::debug!("Notification bus stopped");
    }
}

impl Drop for NotificationBus {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn dispatch(senders: &DashMap<String, broadcast::Sender<()>>, ring: &str) {
    if let Some(tx) = senders.get(ring) {
        if tx.send(()).is_ok() {
            tracing::trace!(ring, "Ring wakeup dispatched");
            return;
        }
    }
    // No receivers left for this ring
    senders.remove_if(ring, |_, tx| tx.receiver_count() == 0);
}

fn wake_all(senders: &DashMap<String, broadcast::Sender<()>>) {
    for entry in senders.iter() {
        let _ = entry.value().send(());
    }
}

/// Wakeups for one ring.
pub struct RingEvents {
    rx: broadcast::Receiver<()>,
}

impl RingEvents {
    /// Wait for the next wakeup. Returns `None` once the bus is shut down.
    ///
    /// Wakeups missed by a slow receiver collapse into one.
    pub async fn recv(&mut self) -> Option<()> {
        match self.rx.recv().await {
            Ok(()) => Some(()),
            Err(RecvError::Lagged(skipped)) => {
                tracing::trace!(skipped, "Ring wakeups coalesced");
                Some(())
            }
            Err(RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::get_test_pool;
    use serial_test::serial;

    #[test]
    fn test_dispatch_drops_senders_without_receivers() {
        let senders = DashMap::new();
        let (tx, rx) = broadcast::channel::<()>(EVENT_CAPACITY);
        senders.insert("diamond".to_string(), tx);

        dispatch(&senders, "diamond");
        assert!(senders.contains_key("diamond"));

        drop(rx);
        dispatch(&senders, "diamond");
        assert!(!senders.contains_key("diamond"));

        // Unknown rings are ignored
        dispatch(&senders, "unknown");
    }

    #[tokio::test]
    async fn test_lagged_receiver_sees_one_event() {
        let (tx, rx) = broadcast::channel::<()>(2);
        let mut events = RingEvents { rx };
        for _ in 0..5 {
            tx.send(()).unwrap();
        }
        assert_eq!(events.recv().await, Some(()));
        drop(tx);
        // Drain what is left after the lag, then the stream ends
        while events.recv().await.is_some() {}
    }

    #[tokio::test]
    #[serial]
    async fn test_publish_reaches_subscriber_of_same_ring() {
        let pool = get_test_pool().await;
        let bus = NotificationBus::start(pool).await.unwrap();

        let mut diamond = bus.subscribe("diamond");
        let mut other = bus.subscribe("other");

        bus.publish("diamond").await.unwrap();

        tokio::time::timeout(Duration::from_millis(500), diamond.recv())
            .await
            .expect("timeout waiting for notification")
            .expect("bus closed");

        assert!(
            tokio::time::timeout(Duration::from_millis(100), other.recv())
                .await
                .is_err(),
            "Other ring must not be woken"
        );

        bus.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_shutdown_closes_streams() {
        let pool = get_test_pool().await;
        let bus = NotificationBus::start(pool).await.unwrap();
        let mut events = bus.subscribe("diamond");

        bus.shutdown().await;

        let next = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("stream should end promptly");
        assert_eq!(next, None);
    }
}
