//! Generator registry (C3): a mutex-protected `GeneratorId -> Generator` map
//! plus the control-plane operations a session's state machine drives.
//!
//! Grounded on `generator.cc`/`collector.h`'s `Collector::GeneratorIdVal`
//! lookup + `Collector::ReceiveCtrl` reattach/mismatch handling. The wire
//! session itself is out of scope (spec.md §1), so it is represented here by
//! the `Session` trait: whatever owns the real socket implements `send_ctrl`
//! and `close` and is handed to the registry as a trait object.

use async_trait::async_trait;
use collector_bus::opstore::OpStoreClient;
use collector_core::error::{CollectorError, Result};
use collector_core::model::{GeneratorId, SessionMessage};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Everything the registry needs from a live session, without knowing how
/// bytes actually move. A real implementation wraps a TCP/XMPP-ish socket.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opaque session identity, used only to detect "is this the same
    /// session instance" on reattach (spec.md §4.3's mismatch check).
    fn session_id(&self) -> u64;

    /// Sends a control-channel reply (e.g. the seq-number handshake map).
    async fn send_ctrl(&self, seq_map: &BTreeMap<String, i32>);

    /// Forwards an `analytics` pub/sub notification verbatim.
    async fn send_notification(&self, message: &str);

    /// Tears the session down (used on mismatch or disconnect cleanup).
    async fn close(&self);
}

/// Control-channel fields carried by the generator's initial handshake
/// message (spec.md §4.3: empty `instance_id`/`node_type` is an error).
#[derive(Debug, Clone)]
pub struct CtrlFields {
    pub source: String,
    pub node_type: String,
    pub module: String,
    pub instance_id: String,
}

pub struct Generator {
    pub id: GeneratorId,
    session: Option<Arc<dyn Session>>,
    pub connected: bool,
    pub connect_count: u64,
    pub store_tx: mpsc::Sender<SessionMessage>,
}

impl Generator {
    fn new(id: GeneratorId, session: Arc<dyn Session>, store_tx: mpsc::Sender<SessionMessage>) -> Self {
        Self {
            id,
            session: Some(session),
            connected: true,
            connect_count: 1,
            store_tx,
        }
    }
}

/// `GeneratorId -> Generator` registry, driven by a session's state machine.
/// Holds an `Arc<OpStoreClient>` purely to run the seq-number handshake
/// (spec.md §4.5) — it never owns the connection's lifecycle.
pub struct GeneratorRegistry {
    generators: Mutex<HashMap<GeneratorId, Generator>>,
    opstore: Arc<OpStoreClient>,
}

impl GeneratorRegistry {
    pub fn new(opstore: Arc<OpStoreClient>) -> Self {
        Self {
            generators: Mutex::new(HashMap::new()),
            opstore,
        }
    }

    /// Handles a generator's control handshake. Returns the queue the
    /// caller should push `SessionMessage`s into for this generator, or an
    /// error if the handshake was rejected.
    ///
    /// - unknown id -> insert, returns a fresh queue.
    /// - known, no current session -> reattach, bump `connect_count`.
    /// - known, different live session -> mismatch: close both, reject.
    pub async fn on_ctrl_message(
        &self,
        session: Arc<dyn Session>,
        fields: CtrlFields,
        store_tx: mpsc::Sender<SessionMessage>,
    ) -> Result<mpsc::Sender<SessionMessage>> {
        if fields.instance_id.is_empty() || fields.node_type.is_empty() {
            warn!(?fields, "ctrl message missing instance_id or node_type");
            return Err(CollectorError::Protocol(
                "empty instance_id or node_type in ctrl message".into(),
            ));
        }
        let id = GeneratorId {
            source: fields.source,
            node_type: fields.node_type,
            module: fields.module,
            instance_id: fields.instance_id,
        };

        let mut generators = self.generators.lock().await;
        let queue = match generators.get_mut(&id) {
            None => {
                let gen = Generator::new(id.clone(), session.clone(), store_tx);
                let queue = gen.store_tx.clone();
                generators.insert(id.clone(), gen);
                info!(generator = %id.display_name(), "new generator");
                queue
            }
            Some(existing) if existing.session.is_none() => {
                existing.session = Some(session.clone());
                existing.connected = true;
                existing.connect_count += 1;
                existing.store_tx = store_tx.clone();
                info!(generator = %id.display_name(), "generator reattached");
                store_tx
            }
            Some(existing) => {
                if existing
                    .session
                    .as_ref()
                    .map(|s| s.session_id() != session.session_id())
                    .unwrap_or(false)
                {
                    warn!(generator = %id.display_name(), "session mismatch, closing both");
                    if let Some(old) = &existing.session {
                        old.close().await;
                    }
                    session.close().await;
                    return Err(CollectorError::Protocol(format!(
                        "session mismatch for generator {}",
                        id.display_name()
                    )));
                }
                store_tx
            }
        };
        drop(generators);

        let seq_map = self.opstore.get_seq(&id).await.unwrap_or_default();
        session.send_ctrl(&seq_map).await;
        Ok(queue)
    }

    /// Marks the owning generator disconnected. The caller is responsible
    /// for C6 UVE teardown once this returns (kept out of the registry to
    /// avoid a cyclic dependency back onto the UVE publisher, per §9's
    /// "no cyclic back-edges through the registry" note).
    pub async fn on_disconnect(&self, id: &GeneratorId) -> bool {
        let mut generators = self.generators.lock().await;
        match generators.get_mut(id) {
            Some(gen) => {
                gen.session = None;
                gen.connected = false;
                true
            }
            None => false,
        }
    }

    /// Fans a resource-up/down event out to every live session, pausing or
    /// resuming upstream flow.
    pub async fn broadcast_redis_status(&self, up: bool) {
        let generators = self.generators.lock().await;
        for gen in generators.values() {
            if let Some(session) = &gen.session {
                let msg = if up { "redis-up" } else { "redis-down" };
                session.send_notification(msg).await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.generators.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    struct FakeSession {
        id: u64,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn session_id(&self) -> u64 {
            self.id
        }
        async fn send_ctrl(&self, _seq_map: &BTreeMap<String, i32>) {}
        async fn send_notification(&self, _message: &str) {}
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn fields() -> CtrlFields {
        CtrlFields {
            source: "host-a".into(),
            node_type: "Control".into(),
            module: "bgp".into(),
            instance_id: "0".into(),
        }
    }

    fn opstore() -> Arc<OpStoreClient> {
        Arc::new(OpStoreClient::new(
            collector_bus::opstore::OpStoreConfig {
                endpoint: "localhost:6379".into(),
                password: None,
            },
            Arc::new(collector_store::ConnectionState::new()),
        ))
    }

    #[tokio::test]
    async fn empty_instance_id_is_rejected() {
        let registry = GeneratorRegistry::new(opstore());
        let session = Arc::new(FakeSession {
            id: 1,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let (tx, _rx) = mpsc::channel(4);
        let mut f = fields();
        f.instance_id = String::new();
        let result = registry.on_ctrl_message(session, f, tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_generator_registers_and_reattach_bumps_count() {
        let registry = GeneratorRegistry::new(opstore());
        let session = Arc::new(FakeSession {
            id: 1,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let (tx, _rx) = mpsc::channel(4);
        registry
            .on_ctrl_message(session, fields(), tx.clone())
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);

        let id = GeneratorId {
            source: "host-a".into(),
            node_type: "Control".into(),
            module: "bgp".into(),
            instance_id: "0".into(),
        };
        registry.on_disconnect(&id).await;

        let session2 = Arc::new(FakeSession {
            id: 2,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        registry
            .on_ctrl_message(session2, fields(), tx)
            .await
            .unwrap();
        let generators = registry.generators.lock().await;
        assert_eq!(generators.get(&id).unwrap().connect_count, 2);
    }

    #[tokio::test]
    async fn differing_live_session_is_a_mismatch() {
        let registry = GeneratorRegistry::new(opstore());
        let session1 = Arc::new(FakeSession {
            id: 1,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let (tx, _rx) = mpsc::channel(4);
        registry
            .on_ctrl_message(session1, fields(), tx.clone())
            .await
            .unwrap();

        let session2 = Arc::new(FakeSession {
            id: 2,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let result = registry.on_ctrl_message(session2.clone(), fields(), tx).await;
        assert!(result.is_err());
        assert!(session2.closed.load(Ordering::SeqCst));
    }
}
