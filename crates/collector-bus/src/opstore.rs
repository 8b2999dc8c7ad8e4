//! Operational-store client (C7): two logical connections — `To` (command
//! pipe) and `From` (subscription pipe) — to the same Redis-like endpoint.
//!
//! Grounded on `OpServerProxy.h`'s constructor surface
//! (`redis_uve_ip/port/password`, `UVEUpdate`, `GetSeq`, `DeleteUVEs`) and
//! `OpServerProxy.cc`'s `To`/`From` state machine (AUTH/PING handshake,
//! `SUBSCRIBE analytics` on `From`, reconnect posted back to the event loop
//! rather than run synchronously inside a callback).

use collector_core::error::{CollectorError, Result};
use collector_core::model::GeneratorId;
use collector_store::connstate::{ConnectionState, PeerKind, PeerRole, Status};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// `analytics` pub/sub payload, forwarded verbatim to a matching Generator's
/// outbound session once `destination` resolves to one.
#[derive(Debug, Deserialize)]
pub struct AnalyticsNotification {
    #[serde(rename = "type")]
    pub kind: String,
    /// Colon-separated quadruple with `*` wildcards, matched against a
    /// `GeneratorId`'s four components in order.
    pub destination: String,
    pub message: String,
}

impl AnalyticsNotification {
    pub fn matches(&self, id: &GeneratorId) -> bool {
        let parts: Vec<&str> = self.destination.split(':').collect();
        if parts.len() != 4 {
            return false;
        }
        let fields = [&id.source, &id.node_type, &id.module, &id.instance_id];
        parts
            .iter()
            .zip(fields.iter())
            .all(|(pat, val)| *pat == "*" || pat == val.as_str())
    }
}

pub struct OpStoreConfig {
    pub endpoint: String,
    pub password: Option<String>,
}

/// Counts of transient `UVEUpdate`/`UVEDelete` failures observed while the
/// `To` connection was down — spec.md §4.5's `update_no_conn` counter.
#[derive(Default)]
pub struct OpStoreCounters {
    pub update_no_conn: AtomicU64,
}

pub struct OpStoreClient {
    config: OpStoreConfig,
    to: Mutex<Option<ConnectionManager>>,
    conn_state: Arc<ConnectionState>,
    counters: OpStoreCounters,
}

impl OpStoreClient {
    pub fn new(config: OpStoreConfig, conn_state: Arc<ConnectionState>) -> Self {
        Self {
            config,
            to: Mutex::new(None),
            conn_state,
            counters: OpStoreCounters::default(),
        }
    }

    pub fn update_no_conn_count(&self) -> u64 {
        self.counters.update_no_conn.load(Ordering::Relaxed)
    }

    /// Drives the `To` connection through `INIT -> AUTH/PING -> UP`. An
    /// `ERROR` reply to AUTH/PING is the fatal-driver-invariant class (§7):
    /// surfaced as `CollectorError::Fatal`, not a process abort.
    pub async fn connect_to(&self) -> Result<()> {
        self.conn_state.update(
            PeerKind::OperationalStore,
            PeerRole::To,
            &self.config.endpoint,
            Status::Init,
            "connecting",
        );
        let client = redis::Client::open(format!("redis://{}", self.config.endpoint))
            .map_err(|e| CollectorError::Configuration(format!("bad redis endpoint: {e}")))?;
        let mut manager = client.get_connection_manager().await.map_err(|e| {
            warn!(error = %e, "operational store To connect failed");
            CollectorError::Transient("operational store connect failed")
        })?;

        if let Some(password) = &self.config.password {
            let reply: redis::RedisResult<String> =
                redis::cmd("AUTH").arg(password).query_async(&mut manager).await;
            if let Err(e) = reply {
                return Err(CollectorError::Fatal(format!("AUTH rejected: {e}")));
            }
        } else {
            let reply: redis::RedisResult<String> =
                redis::cmd("PING").query_async(&mut manager).await;
            if let Err(e) = reply {
                return Err(CollectorError::Fatal(format!("PING failed: {e}")));
            }
        }

        *self.to.lock().await = Some(manager);
        self.conn_state.update(
            PeerKind::OperationalStore,
            PeerRole::To,
            &self.config.endpoint,
            Status::Up,
            "ready",
        );
        info!(endpoint = %self.config.endpoint, "operational store To connection up");
        Ok(())
    }

    pub async fn mark_to_down(&self, reason: &str) {
        *self.to.lock().await = None;
        self.conn_state.update(
            PeerKind::OperationalStore,
            PeerRole::To,
            &self.config.endpoint,
            Status::Down,
            reason,
        );
        warn!(reason, "operational store To connection down");
    }

    pub async fn is_to_up(&self) -> bool {
        self.to.lock().await.is_some()
    }

    /// `part = partition_base(part_type) + djb_hash(uve_key) mod count`, used
    /// as a key suffix so reads/writes for the same UVE land on the same
    /// logical shard.
    pub fn partition_for(uve_key: &str, base: u32, count: u32) -> u32 {
        if count == 0 {
            return base;
        }
        base + (collector_store::schema::djb_hash(uve_key) % count as u64) as u32
    }

    /// Asynchronous UVE attribute update against the operational store.
    /// Returns `Ok(false)` (not an error) when the `To` connection is down —
    /// the caller treats that as a transient failure to retry later.
    pub async fn uve_update(&self, uve_key: &str, attr: &str, payload: &str) -> Result<bool> {
        let mut guard = self.to.lock().await;
        let Some(manager) = guard.as_mut() else {
            self.counters.update_no_conn.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        let field_key = format!("NGENERATOR:{uve_key}");
        let result: redis::RedisResult<()> = manager.hset(&field_key, attr, payload).await;
        if let Err(e) = result {
            drop(guard);
            self.mark_to_down(&e.to_string()).await;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn uve_delete_attr(&self, uve_key: &str, attr: &str) -> Result<bool> {
        let mut guard = self.to.lock().await;
        let Some(manager) = guard.as_mut() else {
            self.counters.update_no_conn.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        let field_key = format!("NGENERATOR:{uve_key}");
        let result: redis::RedisResult<()> = manager.hdel(&field_key, attr).await;
        if let Err(e) = result {
            drop(guard);
            self.mark_to_down(&e.to_string()).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Scripted read of `{struct_type -> seq}` for a Generator, returned to
    /// the session manager for the control-channel handshake reply.
    pub async fn get_seq(&self, id: &GeneratorId) -> Result<BTreeMap<String, i32>> {
        let mut guard = self.to.lock().await;
        let Some(manager) = guard.as_mut() else {
            return Err(CollectorError::Transient("operational store down"));
        };
        let seq_key = format!("SEQ:{}", id.display_name());
        manager.hgetall(&seq_key).await.map_err(|e| {
            warn!(error = %e, "GetSeq failed");
            CollectorError::Transient("GetSeq failed")
        })
    }

    /// Destructive reset of every UVE row attributed to `id`. §9's Open
    /// Question on `DeleteUVEs` failure: returns an error instead of
    /// aborting the process — the caller (registry) logs and continues.
    pub async fn delete_uves(&self, id: &GeneratorId) -> Result<()> {
        let mut guard = self.to.lock().await;
        let Some(manager) = guard.as_mut() else {
            return Err(CollectorError::Transient("operational store down"));
        };
        let pattern = format!("NGENERATOR:*{}*", id.display_name());
        let keys: Vec<String> = manager.keys(&pattern).await.map_err(|e| {
            warn!(error = %e, "DeleteUVEs scan failed");
            CollectorError::Fatal(format!("DeleteUVEs scan failed: {e}"))
        })?;
        if keys.is_empty() {
            return Ok(());
        }
        let _: () = manager.del(keys).await.map_err(|e| {
            warn!(error = %e, "DeleteUVEs failed");
            CollectorError::Fatal(format!("DeleteUVEs failed: {e}"))
        })?;
        Ok(())
    }

    /// Flushes every existing UVE row — the destructive reset the original
    /// performs whenever `To` (re)reaches UP, since the operational store's
    /// pre-restart state cannot be trusted to still be consistent with
    /// currently-connected Generators.
    pub async fn flush_all_uves(&self) -> Result<()> {
        let mut guard = self.to.lock().await;
        let Some(manager) = guard.as_mut() else {
            return Err(CollectorError::Transient("operational store down"));
        };
        let keys: Vec<String> = manager.keys("NGENERATOR:*").await.map_err(|e| {
            warn!(error = %e, "flush scan failed");
            CollectorError::Transient("flush scan failed")
        })?;
        if !keys.is_empty() {
            let _: () = manager.del(keys).await.map_err(|e| {
                warn!(error = %e, "flush failed");
                CollectorError::Transient("flush failed")
            })?;
        }
        Ok(())
    }

    /// `From` connection: subscribes to `analytics` and runs `on_notify` for
    /// every decoded message until the subscription errors out, at which
    /// point it reports DOWN and returns so the caller can reconnect.
    pub async fn run_subscription(
        &self,
        mut on_notify: impl FnMut(AnalyticsNotification) + Send,
    ) -> Result<()> {
        self.conn_state.update(
            PeerKind::OperationalStore,
            PeerRole::From,
            &self.config.endpoint,
            Status::Init,
            "subscribing",
        );
        let client = redis::Client::open(format!("redis://{}", self.config.endpoint))
            .map_err(|e| CollectorError::Configuration(format!("bad redis endpoint: {e}")))?;
        let conn = client.get_async_connection().await.map_err(|e| {
            warn!(error = %e, "From connect failed");
            CollectorError::Transient("From connect failed")
        })?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe("analytics").await.map_err(|e| {
            warn!(error = %e, "SUBSCRIBE failed");
            CollectorError::Transient("SUBSCRIBE failed")
        })?;
        self.conn_state.update(
            PeerKind::OperationalStore,
            PeerRole::From,
            &self.config.endpoint,
            Status::Up,
            "subscribed",
        );

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let raw: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "analytics payload not a string");
                    continue;
                }
            };
            let decoded = match base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                raw.as_bytes(),
            ) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "analytics payload not base64");
                    continue;
                }
            };
            match serde_json::from_slice::<AnalyticsNotification>(&decoded) {
                Ok(notif) => on_notify(notif),
                Err(e) => warn!(error = %e, "analytics payload not valid JSON"),
            }
        }
        self.conn_state.update(
            PeerKind::OperationalStore,
            PeerRole::From,
            &self.config.endpoint,
            Status::Down,
            "subscription stream ended",
        );
        Err(CollectorError::Transient("analytics subscription ended"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_wildcard_matches_any_component() {
        let id = GeneratorId::new("H1", "M", "N", "I");
        let notif = AnalyticsNotification {
            kind: "uve".into(),
            destination: "H1:*:M:I".into(),
            message: "hi".into(),
        };
        assert!(notif.matches(&id));
    }

    #[test]
    fn destination_mismatch_on_one_component_fails() {
        let id = GeneratorId::new("H1", "M", "N", "I");
        let notif = AnalyticsNotification {
            kind: "uve".into(),
            destination: "H2:*:M:I".into(),
            message: "hi".into(),
        };
        assert!(!notif.matches(&id));
    }

    #[test]
    fn partition_for_below_total_stays_in_range() {
        let part = OpStoreClient::partition_for("ObjectVNTable:vn02", 0, 16);
        assert!(part < 16);
    }
}
