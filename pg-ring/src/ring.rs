use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cursor::{LiveMember, LiveSet};
use crate::{maintenance, notify, Error, RingConfig};

/// Result of a create-if-absent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    AlreadyExisted,
    /// The ring or member the operation refers to does not exist (or is not live).
    NotFound,
}

/// Ring and subscriber operations against PostgreSQL.
///
/// Each operation is one transaction. Nothing is cached between calls:
/// every call reads the current store state, since any process may change
/// it at any time.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct RingStore {
    pub(crate) pool: PgPool,
    pub(crate) config: Arc<RingConfig>,
    cancel_token: Option<CancellationToken>,
}

impl RingStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, RingConfig::default())
    }

    pub fn with_config(pool: PgPool, config: RingConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            cancel_token: None,
        }
    }

    /// A handle whose operations abort with [`Error::Cancelled`] once `token` fires.
    ///
    /// An aborted operation drops its transaction and the store rolls it
    /// back. If the token fires while the commit itself is in flight, the
    /// change may already be durable even though the caller sees
    /// [`Error::Cancelled`]; callers must treat a cancelled mutation as
    /// "maybe applied". The same holds for [`Error::DeadlineExceeded`].
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config.clone(),
            cancel_token: Some(token),
        }
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancel_token.as_ref()
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one operation under the handle's cancellation token and deadline.
    ///
    /// Aborting drops `fut`, and with it any open transaction. A commit
    /// already sent is not recalled.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let bounded = async {
            match self.config.operation_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            operation,
                            timeout_ms = limit.as_millis() as u64,
                            "Ring operation timed out"
                        );
                        Err(Error::DeadlineExceeded)
                    }
                },
                None => fut.await,
            }
        };

        match &self.cancel_token {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(operation, "Ring operation cancelled");
                    Err(Error::Cancelled)
                }
                result = bounded => result,
            },
            None => bounded.await,
        }
    }

    /// Create a ring if no ring with `name` exists.
    ///
    /// Returns `true` if a ring was inserted.
    pub async fn create_ring(&self, name: &str) -> Result<bool, Error> {
        self.run("create_ring", async {
            let result =
                sqlx::query("INSERT INTO rings (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
                    .bind(name)
                    .execute(&self.pool)
                    .await?;
            let created = result.rows_affected() > 0;
            if created {
                tracing::info!(ring = name, "Created ring");
            }
            Ok(created)
        })
        .await
    }

    /// Delete a ring with all of its memberships and subscribers.
    ///
    /// Returns `true` if the ring existed.
    pub async fn delete_ring(&self, name: &str) -> Result<bool, Error> {
        self.run("delete_ring", async {
            let mut tx = self.pool.begin().await?;
            let ring_id: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM rings WHERE name = $1 FOR UPDATE")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((ring_id,)) = ring_id else {
                return Ok(false);
            };

            lock_ring_subscribers(&mut *tx, &[ring_id]).await?;
            let result = sqlx::query("DELETE FROM rings WHERE id = $1")
                .bind(ring_id)
                .execute(&mut *tx)
                .await?;
            let deleted = result.rows_affected() > 0;
            if deleted {
                notify::publish(&mut *tx, name).await?;
            }
            tx.commit().await?;

            if deleted {
                tracing::info!(ring = name, "Deleted ring");
            }
            Ok(deleted)
        })
        .await
    }

    /// Names of all rings, ascending.
    pub async fn list_rings(&self) -> Result<Vec<String>, Error> {
        self.run("list_rings", async {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT name FROM rings ORDER BY name COLLATE \"C\"")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(name,)| name).collect())
        })
        .await
    }

    /// Add the live member `namespace/member` to `ring`.
    ///
    /// Reports [`Outcome::NotFound`] without mutating anything when the ring
    /// does not exist or the member does not exist or has expired.
    pub async fn add_member(
        &self,
        namespace: &str,
        ring: &str,
        member: &str,
    ) -> Result<Outcome, Error> {
        self.run("add_member", async {
            let mut tx = self.pool.begin().await?;

            // Share locks keep the ring and member rows alive until the insert commits
            let ring_id: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM rings WHERE name = $1 FOR SHARE")
                    .bind(ring)
                    .fetch_optional(&mut *tx)
                    .await?;
            let entity_id: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM ring_entities \
                 WHERE namespace = $1 AND name = $2 AND expires_at > NOW() \
                 FOR SHARE",
            )
            .bind(namespace)
            .bind(member)
            .fetch_optional(&mut *tx)
            .await?;

            let (Some((ring_id,)), Some((entity_id,))) = (ring_id, entity_id) else {
                tracing::debug!(namespace, ring, member, "Ring or member not found");
                return Ok(Outcome::NotFound);
            };

            let result = sqlx::query(
                "INSERT INTO ring_members (ring_id, entity_id) VALUES ($1, $2) \
                 ON CONFLICT (ring_id, entity_id) DO NOTHING",
            )
            .bind(ring_id)
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(Outcome::AlreadyExisted);
            }

            notify::publish(&mut *tx, ring).await?;
            tx.commit().await?;

            tracing::info!(namespace, ring, member, "Added ring member");
            Ok(Outcome::Created)
        })
        .await
    }

    /// Remove the membership of `namespace/member` in `ring`.
    ///
    /// The member row itself is untouched. Subscribers pointing at the member
    /// have their pointer cleared by the store. Returns `true` if a membership
    /// was removed.
    pub async fn remove_member(
        &self,
        namespace: &str,
        ring: &str,
        member: &str,
    ) -> Result<bool, Error> {
        self.run("remove_member", async {
            let mut tx = self.pool.begin().await?;
            let ring_id: Option<(i64,)> = sqlx::query_as("SELECT id FROM rings WHERE name = $1")
                .bind(ring)
                .fetch_optional(&mut *tx)
                .await?;
            let Some((ring_id,)) = ring_id else {
                return Ok(false);
            };

            lock_ring_subscribers(&mut *tx, &[ring_id]).await?;
            let result = sqlx::query(
                "DELETE FROM ring_members m USING ring_entities e \
                 WHERE m.entity_id = e.id \
                 AND m.ring_id = $1 AND e.namespace = $2 AND e.name = $3",
            )
            .bind(ring_id)
            .bind(namespace)
            .bind(member)
            .execute(&mut *tx)
            .await?;

            let removed = result.rows_affected() > 0;
            if removed {
                notify::publish(&mut *tx, ring).await?;
            }
            tx.commit().await?;

            if removed {
                tracing::info!(namespace, ring, member, "Removed ring member");
            }
            Ok(removed)
        })
        .await
    }

    /// Number of live members in `ring`; 0 if the ring does not exist.
    pub async fn ring_length(&self, ring: &str) -> Result<u64, Error> {
        self.run("ring_length", async {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM ring_members m \
                 JOIN rings r ON r.id = m.ring_id \
                 JOIN ring_entities e ON e.id = m.entity_id \
                 WHERE r.name = $1 AND e.expires_at > NOW()",
            )
            .bind(ring)
            .fetch_one(&self.pool)
            .await?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Delete expired members of the configured internal namespaces.
    ///
    /// See [`maintenance`].
    pub async fn purge_expired_internal(&self) -> Result<u64, Error> {
        self.run("purge_expired_internal", async {
            maintenance::purge_expired_internal(&self.pool, &self.config.internal_namespaces).await
        })
        .await
    }
}

/// Lock the subscriber rows of `ring_ids`, in id order.
///
/// Deleting a membership clears subscriber pointers through
/// `ON DELETE SET NULL`, which locks those subscribers after the membership.
/// Advance locks its subscriber before the memberships. Any statement that
/// deletes memberships takes these locks first so both sides acquire
/// subscribers before memberships.
///
/// Lock order across operations: ring row, member row, subscribers,
/// memberships.
pub(crate) async fn lock_ring_subscribers(
    conn: &mut PgConnection,
    ring_ids: &[i64],
) -> Result<(), Error> {
    if ring_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("SELECT id FROM ring_subscribers WHERE ring_id = ANY($1) ORDER BY id FOR UPDATE")
        .bind(ring_ids)
        .fetch_all(conn)
        .await?;
    Ok(())
}

const LIVE_MEMBERS_SQL: &str = "SELECT e.name, e.namespace, m.id FROM ring_members m \
     JOIN ring_entities e ON e.id = m.entity_id \
     WHERE m.ring_id = $1 AND e.expires_at > NOW() \
     ORDER BY e.name COLLATE \"C\", e.namespace COLLATE \"C\"";

/// Live members of a ring, read inside the caller's transaction.
///
/// `FOR KEY SHARE` keeps the memberships from being deleted before the
/// caller commits a pointer to one of them.
pub(crate) async fn live_members(conn: &mut PgConnection, ring_id: i64) -> Result<LiveSet, Error> {
    fetch_live(conn, ring_id, &format!("{LIVE_MEMBERS_SQL} FOR KEY SHARE OF m")).await
}

/// Live members of a ring without row locks, for read-only transactions.
pub(crate) async fn live_members_snapshot(
    conn: &mut PgConnection,
    ring_id: i64,
) -> Result<LiveSet, Error> {
    fetch_live(conn, ring_id, LIVE_MEMBERS_SQL).await
}

async fn fetch_live(conn: &mut PgConnection, ring_id: i64, sql: &str) -> Result<LiveSet, Error> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(sql)
        .bind(ring_id)
        .fetch_all(conn)
        .await?;

    Ok(LiveSet::new(
        rows.into_iter()
            .map(|(name, namespace, membership_id)| LiveMember {
                name,
                namespace,
                membership_id,
            })
            .collect(),
    ))
}
