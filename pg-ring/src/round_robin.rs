//! Blocking round-robin iteration on top of [`RingStore::advance`].
//!
//! `advance` never waits: an empty or throttled ring returns immediately.
//! [`RoundRobin`] is the polling loop a dispatcher would otherwise write by
//! hand. It retries on a fixed interval and, when given [`RingEvents`],
//! retries early on membership changes.

use rand::Rng;
use std::time::Duration;

use crate::{Advance, Error, Outcome, RingEvents, RingStore};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A dispatcher's view of one subscriber.
pub struct RoundRobin {
    store: RingStore,
    ring: String,
    subscriber: String,
    min_interval: Duration,
    poll_interval: Duration,
    events: Option<RingEvents>,
}

impl RoundRobin {
    pub fn new(store: RingStore, ring: &str, subscriber: &str, min_interval: Duration) -> Self {
        Self {
            store,
            ring: ring.to_string(),
            subscriber: subscriber.to_string(),
            min_interval,
            poll_interval: DEFAULT_POLL_INTERVAL,
            events: None,
        }
    }

    /// Retry delay when the ring is empty or throttled.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Wake up early when the ring's membership changes.
    pub fn with_events(mut self, events: RingEvents) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ring(&self) -> &str {
        &self.ring
    }

    /// Advance to the next member, waiting until one is available.
    ///
    /// A missing subscriber is re-created. A missing ring is waited out like
    /// an empty one, since only operators create rings.
    ///
    /// # Errors
    ///
    /// Store failures are returned as-is. If the store handle carries a
    /// cancellation token, firing it ends the wait with [`Error::Cancelled`].
    pub async fn next(&mut self) -> Result<String, Error> {
        loop {
            let advance = self
                .store
                .advance(&self.ring, &self.subscriber, 0, self.min_interval)
                .await?;

            match &advance {
                Advance::Advanced(member) => return Ok(member.clone()),
                Advance::NotFound => {
                    let created = self
                        .store
                        .create_subscriber(&self.ring, &self.subscriber)
                        .await?;
                    if created == Outcome::Created {
                        tracing::info!(
                            ring = %self.ring,
                            subscriber = %self.subscriber,
                            "Re-created missing subscriber"
                        );
                        continue;
                    }
                }
                Advance::Empty | Advance::Throttled { .. } => {}
            }

            tracing::trace!(ring = %self.ring, ?advance, "Waiting for next member");
            self.wait().await?;
        }
    }

    async fn wait(&mut self) -> Result<(), Error> {
        // Jitter keeps dispatchers on the same ring from polling in lockstep
        let max_jitter_ms = self.poll_interval.as_millis() as u64 / 10;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
        let delay = self.poll_interval + Duration::from_millis(jitter_ms);

        let token = self.store.cancellation_token().cloned();
        let events = self.events.as_mut();

        let cancelled = async move {
            match token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let woken = async move {
            match events {
                Some(events) => {
                    if events.recv().await.is_none() {
                        // Bus is gone; fall back to plain polling
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancelled => Err(Error::Cancelled),
            _ = woken => Ok(()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cleanup, get_test_pool};
    use crate::{MemberRegistry, NotificationBus};
    use serial_test::serial;
    use tokio_util::sync::CancellationToken;

    const NS: &str = "default";
    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    #[serial]
    async fn test_next_walks_ring_in_order() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let store = RingStore::new(pool.clone());
        let members = MemberRegistry::new(pool);

        store.create_ring("ring").await.unwrap();
        for name in ["a", "b", "c"] {
            members.upsert(NS, name, TTL).await.unwrap();
            store.add_member(NS, "ring", name).await.unwrap();
        }
        store.create_subscriber("ring", "sub").await.unwrap();

        let mut rr = RoundRobin::new(store, "ring", "sub", Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10));

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(rr.next().await.unwrap());
        }
        assert_eq!(order, vec!["b", "c", "a", "b"]);
    }

    #[tokio::test]
    #[serial]
    async fn test_next_recreates_missing_subscriber() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let store = RingStore::new(pool.clone());
        let members = MemberRegistry::new(pool);

        store.create_ring("ring").await.unwrap();
        members.upsert(NS, "a", TTL).await.unwrap();
        store.add_member(NS, "ring", "a").await.unwrap();

        let mut rr = RoundRobin::new(store.clone(), "ring", "sub", Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10));

        assert_eq!(rr.next().await.unwrap(), "a");
        assert!(store.subscriber("ring", "sub").await.unwrap().is_some());
    }

    #[tokio::test]
    #[serial]
    async fn test_next_wakes_on_membership_change() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let store = RingStore::new(pool.clone());
        let members = MemberRegistry::new(pool.clone());
        let bus = NotificationBus::start(pool).await.unwrap();

        store.create_ring("ring").await.unwrap();
        store.create_subscriber("ring", "sub").await.unwrap();

        // Poll interval far beyond the test timeout: only the event can wake it
        let mut rr = RoundRobin::new(store.clone(), "ring", "sub", Duration::ZERO)
            .with_poll_interval(Duration::from_secs(30))
            .with_events(bus.subscribe("ring"));

        let waiter = tokio::spawn(async move { rr.next().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        members.upsert(NS, "mulder", TTL).await.unwrap();
        store.add_member(NS, "ring", "mulder").await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("round robin should wake on notification")
            .unwrap()
            .unwrap();
        assert_eq!(next, "mulder");

        bus.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_next_is_cancellable() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let store = RingStore::new(pool);
        store.create_ring("ring").await.unwrap();
        store.create_subscriber("ring", "sub").await.unwrap();

        let token = CancellationToken::new();
        let mut rr = RoundRobin::new(
            store.with_cancellation(token.clone()),
            "ring",
            "sub",
            Duration::ZERO,
        )
        .with_poll_interval(Duration::from_secs(30));

        let waiter = tokio::spawn(async move { rr.next().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("cancel should end the wait")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
