//! PostgreSQL-backed round-robin rings.
//!
//! This crate provides:
//! - Rings: named, cyclically ordered sets of TTL-bounded members
//! - Subscribers: independent cursors over a ring with throttled advance
//! - Peek: non-mutating lookahead from a subscriber's position
//! - A best-effort notification bus (LISTEN/NOTIFY) to wake pollers early
//!
//! All coordination state lives in PostgreSQL. Every operation is a single
//! transaction, and mutual exclusion between processes comes from row locks,
//! so any number of backend processes can share a ring.
//!
//! # Example
//!
//! ```rust,ignore
//! use pg_ring::{Advance, MemberRegistry, RingStore};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     // Ensure schema exists (safe to call multiple times)
//!     pg_ring::setup(&pool).await?;
//!
//!     let members = MemberRegistry::new(pool.clone());
//!     members.upsert("default", "agent-1", Duration::from_secs(60)).await?;
//!
//!     let store = RingStore::new(pool);
//!     store.create_ring("keepalives").await?;
//!     store.add_member("default", "keepalives", "agent-1").await?;
//!     store.create_subscriber("keepalives", "dispatcher").await?;
//!
//!     match store
//!         .advance("keepalives", "dispatcher", 0, Duration::from_secs(5))
//!         .await?
//!     {
//!         Advance::Advanced(member) => println!("next: {member}"),
//!         other => println!("try again later: {other:?}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Liveness
//!
//! Members expire by timestamp. Expired members are skipped by every read
//! and are never counted, but their rows stay in place until the member
//! registry deletes them. The one exception is the purge of expired members
//! in internal namespaces, see [`maintenance`].

mod config;
mod cursor;
mod error;
pub mod maintenance;
mod member;
mod notify;
mod ring;
mod round_robin;
mod subscriber;

#[cfg(test)]
mod test_support;

pub use config::{RingConfig, DEFAULT_DATABASE_URL, DEFAULT_INTERNAL_NAMESPACES};
pub use cursor::{LiveMember, LiveSet};
pub use error::Error;
pub use member::{Member, MemberRegistry};
pub use notify::{publish, NotificationBus, RingEvents, NOTIFY_CHANNEL};
pub use ring::{Outcome, RingStore};
pub use round_robin::RoundRobin;
pub use subscriber::{Advance, SubscriberState};

use sqlx::PgPool;

/// SQL schema required by pg-ring, in creation order.
pub const SCHEMA_SQL: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS rings (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
)"#,
    r#"
CREATE TABLE IF NOT EXISTS ring_entities (
    id BIGSERIAL PRIMARY KEY,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    UNIQUE (namespace, name)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS ring_members (
    id BIGSERIAL PRIMARY KEY,
    ring_id BIGINT NOT NULL REFERENCES rings (id) ON DELETE CASCADE,
    entity_id BIGINT NOT NULL REFERENCES ring_entities (id) ON DELETE CASCADE,
    UNIQUE (ring_id, entity_id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS ring_subscribers (
    id BIGSERIAL PRIMARY KEY,
    ring_id BIGINT NOT NULL REFERENCES rings (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    pointer BIGINT REFERENCES ring_members (id) ON DELETE SET NULL,
    last_updated TIMESTAMPTZ,
    UNIQUE (ring_id, name)
)"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_ring_entities_expires_at
ON ring_entities (expires_at)"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_ring_members_entity
ON ring_members (entity_id)"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_ring_subscribers_pointer
ON ring_subscribers (pointer)"#,
];

/// Create the required tables and indexes if they don't exist.
///
/// Safe to call multiple times (uses IF NOT EXISTS).
///
/// # Example
///
/// ```rust,ignore
/// pg_ring::setup(&pool).await?;
/// let store = RingStore::new(pool);
/// ```
pub async fn setup(pool: &PgPool) -> Result<(), Error> {
    for statement in SCHEMA_SQL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
