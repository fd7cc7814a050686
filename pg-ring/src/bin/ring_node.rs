//! Ring node for multiprocess testing.
//!
//! Joins a ring as a member (renewing its TTL in the background), shares a
//! subscriber with every other node and accepts commands on stdin. Each
//! command produces one JSON line on stdout. Logs go to stderr.
//!
//! Environment:
//! - `DATABASE_URL`, `RING_*` (see `RingConfig::from_env`)
//! - `RING_NAME` (default `nodes`)
//! - `RING_SUBSCRIBER` (default `dispatcher`)
//! - `RING_NAMESPACE` (default `_internal`)
//! - `RING_MEMBER_TTL_SECS` (default 30)
//!
//! Commands: `advance [skip] [min_interval_ms]`, `peek [limit]`, `length`,
//! `status`, `quit`.
//!
//! Run: cargo run -p pg-ring --bin ring_node

use pg_ring::{Advance, Error, MemberRegistry, RingConfig, RingStore};
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_RING: &str = "nodes";
const DEFAULT_SUBSCRIBER: &str = "dispatcher";
const DEFAULT_NAMESPACE: &str = "_internal";
const DEFAULT_TTL_SECS: u64 = 30;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RingConfig::from_env()?;
    let ring = env_or("RING_NAME", DEFAULT_RING);
    let subscriber = env_or("RING_SUBSCRIBER", DEFAULT_SUBSCRIBER);
    let namespace = env_or("RING_NAMESPACE", DEFAULT_NAMESPACE);
    let ttl = Duration::from_secs(
        std::env::var("RING_MEMBER_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECS),
    );

    let pool = config.connect()?;
    pg_ring::setup(&pool).await?;

    let store = RingStore::with_config(pool.clone(), config);
    let members = MemberRegistry::new(pool);

    let node_id = Uuid::new_v4().to_string();
    let short_id = node_id[..8].to_string();

    // Join: member row, ring membership, shared subscriber
    store.create_ring(&ring).await?;
    members.upsert(&namespace, &short_id, ttl).await?;
    store.add_member(&namespace, &ring, &short_id).await?;
    store.create_subscriber(&ring, &subscriber).await?;

    let shutdown = CancellationToken::new();
    let renew_task = spawn_renewal(
        members.clone(),
        namespace.clone(),
        short_id.clone(),
        ttl,
        shutdown.clone(),
    );

    emit(json!({
        "event": "ready",
        "id": short_id,
        "ring": ring,
        "length": store.ring_length(&ring).await?,
    }));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "advance" => {
                let skip: u64 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                let min_interval_ms: u64 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
                match store
                    .advance(&ring, &subscriber, skip, Duration::from_millis(min_interval_ms))
                    .await
                {
                    Ok(outcome) => emit(advance_status(&short_id, &outcome)),
                    Err(e) => emit(error_status(&short_id, &e)),
                }
            }
            "peek" => {
                let limit: usize = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
                match store.peek(&ring, &subscriber, limit).await {
                    Ok(names) => emit(json!({"event": "peek", "id": short_id, "members": names})),
                    Err(e) => emit(error_status(&short_id, &e)),
                }
            }
            "length" => match store.ring_length(&ring).await {
                Ok(length) => emit(json!({"event": "length", "id": short_id, "length": length})),
                Err(e) => emit(error_status(&short_id, &e)),
            },
            "status" => match store.subscriber(&ring, &subscriber).await {
                Ok(state) => emit(json!({
                    "event": "status",
                    "id": short_id,
                    "ring": ring,
                    "subscriber": state,
                    "member": members.get(&namespace, &short_id).await.ok().flatten(),
                })),
                Err(e) => emit(error_status(&short_id, &e)),
            },
            "quit" | "exit" => {
                break;
            }
            _ => {
                emit(json!({"error": "unknown_command", "command": parts[0]}));
            }
        }
    }

    // Leave: stop renewing and drop our member row (memberships cascade)
    shutdown.cancel();
    let _ = renew_task.await;
    if let Err(e) = members.delete(&namespace, &short_id).await {
        tracing::warn!(id = %short_id, "Failed to delete member on shutdown: {}", e);
    }

    emit(json!({"event": "shutdown", "id": short_id}));
    Ok(())
}

fn spawn_renewal(
    members: MemberRegistry,
    namespace: String,
    name: String,
    ttl: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval((ttl / 3).max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = members.renew(&namespace, &name, ttl).await {
                        tracing::error!(member = %name, "Member renewal failed: {}", e);
                    }
                }
            }
        }
    })
}

fn advance_status(id: &str, outcome: &Advance) -> serde_json::Value {
    match outcome {
        Advance::Advanced(member) => {
            json!({"event": "advance", "id": id, "result": "advanced", "member": member})
        }
        Advance::Throttled { current } => {
            json!({"event": "advance", "id": id, "result": "throttled", "member": current})
        }
        Advance::Empty => json!({"event": "advance", "id": id, "result": "empty"}),
        Advance::NotFound => json!({"event": "advance", "id": id, "result": "not_found"}),
    }
}

fn error_status(id: &str, error: &Error) -> serde_json::Value {
    json!({"event": "error", "id": id, "error": error.to_string()})
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn emit(value: serde_json::Value) {
    println!("{value}");
    let _ = io::stdout().flush();
}
