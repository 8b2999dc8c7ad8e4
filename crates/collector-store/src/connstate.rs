//! Connection state & metrics (C12).
//!
//! A process-singleton-shaped map, but injected as an `Arc` rather than a
//! real `static` (§9's "process-wide mutable singletons" redesign note):
//! every component that needs to report state is handed a clone of the
//! `Arc<ConnectionState>` at construction time.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Init,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PeerKind {
    Cassandra,
    OperationalStore,
    PubSub,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PeerRole {
    To,
    From,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerState {
    pub status: Status,
    pub message: String,
    pub timestamp_us: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    peers: Mutex<BTreeMap<(PeerKind, PeerRole, String), PeerState>>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, kind: PeerKind, role: PeerRole, endpoint: &str, status: Status, message: impl Into<String>) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(
            (kind, role, endpoint.to_string()),
            PeerState {
                status,
                message: message.into(),
                timestamp_us: now_us(),
            },
        );
    }

    pub fn snapshot(&self) -> BTreeMap<(PeerKind, PeerRole, String), PeerState> {
        self.peers.lock().unwrap().clone()
    }
}

/// Implemented by components whose state the metrics endpoint wants to
/// describe without needing a concrete downcast.
#[async_trait]
pub trait Monitored: Send + Sync {
    async fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_snapshot_reflects_latest_status() {
        let cs = ConnectionState::new();
        cs.update(PeerKind::Cassandra, PeerRole::To, "10.0.0.1:9042", Status::Init, "connecting");
        cs.update(PeerKind::Cassandra, PeerRole::To, "10.0.0.1:9042", Status::Up, "ready");
        let snap = cs.snapshot();
        let entry = snap
            .get(&(PeerKind::Cassandra, PeerRole::To, "10.0.0.1:9042".to_string()))
            .unwrap();
        assert_eq!(entry.status, Status::Up);
        assert_eq!(entry.message, "ready");
    }
}
