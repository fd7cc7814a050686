//! Purge of expired members in internal namespaces.
//!
//! Internal namespaces hold the backend's own short-lived identities. Their
//! expired rows are deleted outright; members of any other namespace are
//! only ever filtered out by expiry, never deleted here.
//!
//! [`RingStore::peek`](crate::RingStore::peek) runs this step before reading
//! when internal namespaces are configured. It can also be run on its own
//! through [`RingStore::purge_expired_internal`](crate::RingStore::purge_expired_internal).

use sqlx::PgPool;

use crate::ring::lock_ring_subscribers;
use crate::Error;

/// Delete expired members whose namespace is in `namespaces`.
///
/// Returns the number of deleted members. Their memberships are removed by
/// cascade, which clears any subscriber pointer that referenced them.
///
/// Rows already locked by a concurrent purge are skipped; that purge
/// deletes them.
pub async fn purge_expired_internal(pool: &PgPool, namespaces: &[String]) -> Result<u64, Error> {
    if namespaces.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let expired: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM ring_entities \
         WHERE namespace = ANY($1) AND expires_at <= NOW() \
         ORDER BY id FOR UPDATE SKIP LOCKED",
    )
    .bind(namespaces)
    .fetch_all(&mut *tx)
    .await?;

    if expired.is_empty() {
        return Ok(0);
    }

    let ring_ids: Vec<i64> =
        sqlx::query_scalar("SELECT DISTINCT ring_id FROM ring_members WHERE entity_id = ANY($1)")
            .bind(&expired)
            .fetch_all(&mut *tx)
            .await?;
    lock_ring_subscribers(&mut *tx, &ring_ids).await?;

    let result = sqlx::query("DELETE FROM ring_entities WHERE id = ANY($1)")
        .bind(&expired)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let count = result.rows_affected();
    tracing::info!(count, ?namespaces, "Purged expired internal members");
    Ok(count)
}
