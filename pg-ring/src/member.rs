use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::time::Duration;

use crate::ring::lock_ring_subscribers;
use crate::Error;

/// A namespaced identity with an expiry, as stored by the member registry.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Member {
    pub id: i64,
    pub namespace: String,
    pub name: String,
    pub expires_at: DateTime<Utc>,
}

impl Member {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Member rows consumed by rings.
///
/// Members are owned by the entity registry; rings only associate with them
/// and filter on `expires_at`. Expiring a member never deletes its row.
#[derive(Clone)]
pub struct MemberRegistry {
    pool: PgPool,
}

impl MemberRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a member, or renew it if `(namespace, name)` already exists.
    ///
    /// The member is live until `now + ttl`.
    pub async fn upsert(
        &self,
        namespace: &str,
        name: &str,
        ttl: Duration,
    ) -> Result<Member, Error> {
        validate_identity(namespace, name)?;

        let member: Member = sqlx::query_as(
            "INSERT INTO ring_entities (namespace, name, expires_at) \
             VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
             ON CONFLICT (namespace, name) DO UPDATE SET expires_at = EXCLUDED.expires_at \
             RETURNING id, namespace, name, expires_at",
        )
        .bind(namespace)
        .bind(name)
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            namespace,
            member = name,
            expires_at = %member.expires_at,
            "Upserted member"
        );
        Ok(member)
    }

    /// Extend the expiry of an existing member to `now + ttl`.
    ///
    /// Returns `false` if the member does not exist.
    pub async fn renew(&self, namespace: &str, name: &str, ttl: Duration) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE ring_entities SET expires_at = NOW() + make_interval(secs => $3) \
             WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a member as expired without deleting it.
    pub async fn expire(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE ring_entities SET expires_at = NOW() \
             WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a member row. Its ring memberships go with it, and subscriber
    /// pointers at those memberships are cleared.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        // The row lock keeps the member from joining another ring meanwhile
        let entity_id: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM ring_entities WHERE namespace = $1 AND name = $2 FOR UPDATE",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((entity_id,)) = entity_id else {
            return Ok(false);
        };

        let ring_ids: Vec<i64> =
            sqlx::query_scalar("SELECT ring_id FROM ring_members WHERE entity_id = $1")
                .bind(entity_id)
                .fetch_all(&mut *tx)
                .await?;
        lock_ring_subscribers(&mut *tx, &ring_ids).await?;

        sqlx::query("DELETE FROM ring_entities WHERE id = $1")
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(namespace, member = name, rings = ring_ids.len(), "Deleted member");
        Ok(true)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Option<Member>, Error> {
        let member = sqlx::query_as(
            "SELECT id, namespace, name, expires_at FROM ring_entities \
             WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(member)
    }

    /// Whether the member exists and has not expired, judged by the store clock.
    pub async fn is_live(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let (live,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM ring_entities \
             WHERE namespace = $1 AND name = $2 AND expires_at > NOW())",
        )
        .bind(namespace)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(live)
    }
}

fn validate_identity(namespace: &str, name: &str) -> Result<(), Error> {
    if namespace.is_empty() {
        return Err(Error::invalid_argument("member namespace must not be empty"));
    }
    if name.is_empty() {
        return Err(Error::invalid_argument("member name must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cleanup, get_test_pool};
    use serial_test::serial;

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("default", "agent").is_ok());
        assert!(matches!(
            validate_identity("", "agent"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_identity("default", ""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_upsert_creates_live_member() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let registry = MemberRegistry::new(pool);

        let member = registry
            .upsert("default", "mulder", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(member.namespace, "default");
        assert_eq!(member.name, "mulder");
        assert!(member.is_live_at(Utc::now()));
        assert!(registry.is_live("default", "mulder").await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_upsert_renews_existing_member() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let registry = MemberRegistry::new(pool);

        let first = registry
            .upsert("default", "scully", Duration::from_secs(1))
            .await
            .unwrap();
        let second = registry
            .upsert("default", "scully", Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(first.id, second.id, "Upsert must keep the same row");
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    #[serial]
    async fn test_expire_keeps_row() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let registry = MemberRegistry::new(pool);

        registry
            .upsert("default", "skinner", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(registry.expire("default", "skinner").await.unwrap());

        assert!(!registry.is_live("default", "skinner").await.unwrap());
        assert!(
            registry.get("default", "skinner").await.unwrap().is_some(),
            "Expired member row should remain"
        );

        assert!(registry
            .renew("default", "skinner", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(registry.is_live("default", "skinner").await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_namespaces_are_independent() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let registry = MemberRegistry::new(pool);

        registry
            .upsert("ns-a", "agent", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(registry.is_live("ns-a", "agent").await.unwrap());
        assert!(!registry.is_live("ns-b", "agent").await.unwrap());
        assert!(!registry.delete("ns-b", "agent").await.unwrap());
        assert!(registry.delete("ns-a", "agent").await.unwrap());
        assert!(registry.get("ns-a", "agent").await.unwrap().is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_renew_missing_member() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let registry = MemberRegistry::new(pool);

        assert!(!registry
            .renew("default", "nobody", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!registry.expire("default", "nobody").await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_delete_clears_pointers_in_every_ring() {
        let pool = get_test_pool().await;
        cleanup(&pool).await;
        let registry = MemberRegistry::new(pool.clone());
        let store = crate::RingStore::new(pool);

        for ring in ["a", "b"] {
            store.create_ring(ring).await.unwrap();
        }
        for name in ["mulder", "scully"] {
            registry
                .upsert("default", name, Duration::from_secs(60))
                .await
                .unwrap();
            store.add_member("default", "a", name).await.unwrap();
            store.add_member("default", "b", name).await.unwrap();
        }
        store.create_subscriber("a", "sub").await.unwrap();
        store.create_subscriber("b", "sub").await.unwrap();

        assert!(registry.delete("default", "mulder").await.unwrap());

        for ring in ["a", "b"] {
            let state = store.subscriber(ring, "sub").await.unwrap().unwrap();
            assert_eq!(state.pointer, None, "ring {ring}");
            assert_eq!(store.ring_length(ring).await.unwrap(), 1);
        }
        assert!(!registry.delete("default", "mulder").await.unwrap());
    }
}
