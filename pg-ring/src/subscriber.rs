use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::ring::{live_members, live_members_snapshot};
use crate::{maintenance, Error, Outcome, RingStore};

/// Result of [`RingStore::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The pointer moved to this member.
    Advanced(String),
    /// The subscriber advanced less than `min_interval` ago; nothing changed.
    /// `current` is the live member the pointer designates, if any.
    Throttled { current: Option<String> },
    /// The ring has no live members; nothing changed.
    Empty,
    /// The ring or the subscriber does not exist.
    NotFound,
}

impl Advance {
    pub fn member(&self) -> Option<&str> {
        match self {
            Self::Advanced(name) => Some(name),
            _ => None,
        }
    }
}

/// Raw subscriber row, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberState {
    pub name: String,
    /// Member the pointer references, whether or not it is still live.
    pub pointer: Option<String>,
    /// Time of the last successful advance.
    pub last_updated: Option<DateTime<Utc>>,
}

impl RingStore {
    /// Create a subscriber on `ring` if it does not exist yet.
    ///
    /// A new subscriber points at the smallest live member, or nowhere when
    /// the ring is empty. An existing subscriber keeps its pointer.
    pub async fn create_subscriber(
        &self,
        ring: &str,
        subscriber: &str,
    ) -> Result<Outcome, Error> {
        self.run("create_subscriber", async {
            let mut tx = self.pool.begin().await?;

            let ring_id: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM rings WHERE name = $1 FOR SHARE")
                    .bind(ring)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((ring_id,)) = ring_id else {
                return Ok(Outcome::NotFound);
            };

            let live = live_members(&mut *tx, ring_id).await?;
            let pointer = live.first().map(|m| m.membership_id);

            let result = sqlx::query(
                "INSERT INTO ring_subscribers (ring_id, name, pointer) VALUES ($1, $2, $3) \
                 ON CONFLICT (ring_id, name) DO NOTHING",
            )
            .bind(ring_id)
            .bind(subscriber)
            .bind(pointer)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(Outcome::AlreadyExisted);
            }
            tx.commit().await?;

            tracing::info!(
                ring,
                subscriber,
                pointer = live.first().map(|m| m.name.as_str()),
                "Created subscriber"
            );
            Ok(Outcome::Created)
        })
        .await
    }

    /// Delete a subscriber. Returns `true` if it existed.
    pub async fn delete_subscriber(&self, ring: &str, subscriber: &str) -> Result<bool, Error> {
        self.run("delete_subscriber", async {
            let result = sqlx::query(
                "DELETE FROM ring_subscribers s USING rings r \
                 WHERE s.ring_id = r.id AND r.name = $1 AND s.name = $2",
            )
            .bind(ring)
            .bind(subscriber)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Move the subscriber `skip + 1` positions forward in cyclic name order.
    ///
    /// `skip` is reduced modulo the number of live members, so any value
    /// lands inside the ring. A pointer at a removed or expired member counts
    /// as no position, and the walk starts before the smallest live name.
    /// Members of different namespaces sharing a name each hold a position,
    /// ordered by namespace.
    ///
    /// The move happens only if the last successful advance is more than
    /// `min_interval` old. The subscriber row is locked for the whole
    /// read-compute-write, so concurrent callers on one subscriber see at
    /// most one success per interval, while other subscribers are unaffected.
    pub async fn advance(
        &self,
        ring: &str,
        subscriber: &str,
        skip: u64,
        min_interval: Duration,
    ) -> Result<Advance, Error> {
        self.run("advance", async {
            let mut tx = self.pool.begin().await?;

            let row: Option<(i64, i64, Option<i64>, bool)> = sqlx::query_as(
                "SELECT s.id, s.ring_id, s.pointer, \
                 (s.last_updated IS NULL OR s.last_updated + make_interval(secs => $3) < NOW()) \
                 FROM ring_subscribers s JOIN rings r ON r.id = s.ring_id \
                 WHERE r.name = $1 AND s.name = $2 \
                 FOR UPDATE OF s",
            )
            .bind(ring)
            .bind(subscriber)
            .bind(min_interval.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await?;

            let Some((subscriber_id, ring_id, pointer, due)) = row else {
                return Ok(Advance::NotFound);
            };

            let live = live_members(&mut *tx, ring_id).await?;
            if live.is_empty() {
                tracing::trace!(ring, subscriber, "Advance: ring has no live members");
                return Ok(Advance::Empty);
            }

            let current = live.resolve(pointer);
            let current_name = current.map(|m| m.name.as_str());
            if !due {
                tracing::trace!(ring, subscriber, current = current_name, "Advance throttled");
                return Ok(Advance::Throttled {
                    current: current_name.map(str::to_string),
                });
            }

            let Some(target) = live.advance(current, skip) else {
                return Ok(Advance::Empty);
            };

            sqlx::query(
                "UPDATE ring_subscribers SET pointer = $1, last_updated = NOW() WHERE id = $2",
            )
            .bind(target.membership_id)
            .bind(subscriber_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::debug!(
                ring,
                subscriber,
                from = current_name,
                to = %target.name,
                skip,
                "Advanced subscriber"
            );
            Ok(Advance::Advanced(target.name.clone()))
        })
        .await
    }

    /// Up to `limit` live members starting at the subscriber's position,
    /// in cyclic name order, without moving the subscriber.
    ///
    /// A pointer at a removed or expired member counts as no position, and
    /// the list starts at the smallest live name. Never returns a member
    /// twice. Missing rings and subscribers yield an empty list.
    ///
    /// Before reading, expired members of the configured internal namespaces
    /// are purged (see [`maintenance`]).
    pub async fn peek(
        &self,
        ring: &str,
        subscriber: &str,
        limit: usize,
    ) -> Result<Vec<String>, Error> {
        if limit == 0 {
            return Err(Error::invalid_argument("peek limit must be greater than zero"));
        }

        self.run("peek", async {
            maintenance::purge_expired_internal(&self.pool, &self.config.internal_namespaces)
                .await?;

            let mut tx = self.pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .execute(&mut *tx)
                .await?;

            let row: Option<(i64, Option<i64>)> = sqlx::query_as(
                "SELECT s.ring_id, s.pointer \
                 FROM ring_subscribers s JOIN rings r ON r.id = s.ring_id \
                 WHERE r.name = $1 AND s.name = $2",
            )
            .bind(ring)
            .bind(subscriber)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((ring_id, pointer)) = row else {
                return Ok(Vec::new());
            };

            let live = live_members_snapshot(&mut *tx, ring_id).await?;
            tx.commit().await?;

            let position = live.resolve(pointer);

            Ok(live
                .window(position, limit)
                .into_iter()
                .map(|m| m.name.clone())
                .collect())
        })
        .await
    }

    /// Read a subscriber row as stored.
    pub async fn subscriber(
        &self,
        ring: &str,
        subscriber: &str,
    ) -> Result<Option<SubscriberState>, Error> {
        self.run("subscriber", async {
            let row: Option<(String, Option<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
                "SELECT s.name, e.name, s.last_updated \
                 FROM ring_subscribers s \
                 JOIN rings r ON r.id = s.ring_id \
                 LEFT JOIN ring_members m ON m.id = s.pointer \
                 LEFT JOIN ring_entities e ON e.id = m.entity_id \
                 WHERE r.name = $1 AND s.name = $2",
            )
            .bind(ring)
            .bind(subscriber)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|(name, pointer, last_updated)| SubscriberState {
                name,
                pointer,
                last_updated,
            }))
        })
        .await
    }
}
