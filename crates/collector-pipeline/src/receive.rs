//! Session receive path (C4): drives one `SessionMessage` pulled off a
//! Generator's queue through the classifier (C5), the store writer (C2), the
//! UVE publisher (C6), and the stat walker (C11), per spec.md §4.4's five
//! steps. Also owns UVE teardown on Generator disconnect, since the registry
//! (C3) deliberately stays ignorant of the UVE publisher to avoid a cyclic
//! dependency.
//!
//! Grounded on `collector.cc`'s `ProcessSandeshMsg` dispatch, which this
//! mirrors step-for-step.

use collector_core::model::{GeneratorId, SandeshType, SessionMessage};
use collector_store::writer::StoreWriter;
use tracing::warn;

use crate::classify::{self, UveAttrUpdate};
use crate::registry::GeneratorRegistry;
use crate::stat_walker::extract_uve_tagged_stats;
use crate::uve::{UvePublisher, UveUpdateArgs};
use collector_bus::opstore::OpStoreClient;
use std::sync::Arc;

/// Everything the receive path needs to dispatch a message: the store
/// writer, the UVE publisher, and (for disconnect-time teardown) the
/// registry and operational-store client directly.
pub struct ReceivePath {
    writer: Arc<StoreWriter>,
    uve: Arc<UvePublisher>,
    opstore: Arc<OpStoreClient>,
    registry: Arc<GeneratorRegistry>,
    collector_endpoint: String,
}

impl ReceivePath {
    pub fn new(
        writer: Arc<StoreWriter>,
        uve: Arc<UvePublisher>,
        opstore: Arc<OpStoreClient>,
        registry: Arc<GeneratorRegistry>,
        collector_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            writer,
            uve,
            opstore,
            registry,
            collector_endpoint: collector_endpoint.into(),
        }
    }

    /// Dispatches one message for `generator`. `queue_is_red` reflects the
    /// Generator's own watermarked queue (C1), consulted only by the `Flow`
    /// drop rule.
    pub async fn dispatch(&self, generator: &GeneratorId, msg: &SessionMessage, queue_is_red: bool) {
        let header = &msg.header;
        let effective_drop_level = self.writer.effective_drop_level();
        if classify::should_drop(
            header.sandesh_type,
            header.severity,
            effective_drop_level,
            queue_is_red,
        ) {
            return;
        }

        let object_names = classify::collect_object_names(&msg.body);
        for name in &object_names {
            let Some((table, bare_key)) = name.split_once(':') else {
                continue;
            };
            if let Err(e) = self
                .writer
                .object_table_insert(table, bare_key, header.timestamp, &msg.unm, &header.source, &header.module)
                .await
            {
                warn!(error = %e, table, "object table insert failed");
            }
        }

        let mut message_type = header.category.clone();
        if header.sandesh_type == SandeshType::Uve {
            if let Some(extraction) = classify::extract_uve(&msg.body) {
                message_type = extraction.struct_type.clone();
                let deleted = extraction.deleted;
                for attr in &extraction.attrs {
                    self.process_uve_attr(generator, &extraction.struct_type, &extraction.uve_key, attr)
                        .await;
                }
                if deleted {
                    self.uve
                        .uve_delete(
                            &extraction.struct_type,
                            generator,
                            &extraction.uve_key,
                            &self.collector_endpoint,
                        )
                        .await;
                }
            }
        }

        match header.sandesh_type {
            SandeshType::Flow => {
                for record in classify::extract_flow_records(&msg.body, header.timestamp) {
                    if let Err(e) = self.writer.flow_table_insert(&record).await {
                        warn!(error = %e, flow_uuid = record.flow_uuid, "flow table insert failed");
                    }
                }
            }
            SandeshType::Session => {
                for record in classify::extract_session_records(&msg.body) {
                    if let Err(e) = self
                        .writer
                        .session_table_insert(header.timestamp, &record.vrouter, &record.session_uuid, &record.value)
                        .await
                    {
                        warn!(error = %e, session_uuid = record.session_uuid, "session table insert failed");
                    }
                }
            }
            SandeshType::System | SandeshType::Syslog => {
                for (field, value) in classify::log_stat_field_names(
                    header.sandesh_type,
                    &message_type,
                    &header.module,
                    &header.source,
                    Some(&header.category),
                ) {
                    if let Err(e) = self.writer.field_names_insert(header.timestamp, field, &value).await {
                        warn!(error = %e, field, "log-stats field names insert failed");
                    }
                }
            }
            _ => {}
        }

        if let Err(e) = self
            .writer
            .message_table_insert(
                header.severity,
                &message_type,
                header.timestamp,
                &msg.unm,
                &object_names,
                &msg.body.to_wire_string(),
            )
            .await
        {
            warn!(error = %e, "message table insert failed");
        }
    }

    /// Step 3's per-attribute fan-out: `UVEUpdate` always runs; when the
    /// attribute carries `tags=`, its list-of-structs children are also run
    /// through the stat walker (C11) and written to the stat tables.
    async fn process_uve_attr(&self, generator: &GeneratorId, struct_type: &str, uve_key: &str, attr: &UveAttrUpdate) {
        let args = UveUpdateArgs {
            struct_type,
            attr_name: &attr.attr_name,
            generator,
            uve_key,
            payload: &attr.payload,
            aggtype: attr.aggtype.as_deref(),
            collector_endpoint: &self.collector_endpoint,
        };
        self.uve.uve_update(args).await;

        if let Some(tags) = &attr.tags {
            for stat in extract_uve_tagged_stats(&attr.attr_name, tags, &attr.node) {
                if let Err(e) = self
                    .writer
                    .stat_table_insert(0, &stat.stat_name, &stat.stat_attr, &stat.attribs)
                    .await
                {
                    warn!(error = %e, stat_name = stat.stat_name, "stat table insert failed");
                }
            }
        }
    }

    /// Marks `id` disconnected in the registry and, if it was actually live,
    /// tears down its UVEs. `DeleteUVEs` failure is logged, not escalated —
    /// the disconnect itself still completes (§9's resolved Open Question).
    pub async fn on_generator_disconnect(&self, id: &GeneratorId) {
        if !self.registry.on_disconnect(id).await {
            return;
        }
        if let Err(e) = self.opstore.delete_uves(id).await {
            warn!(error = %e, generator = %id.display_name(), "UVE teardown on disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collector_bus::opstore::OpStoreConfig;
    use collector_bus::producer::{BusProducer, BusProducerConfig};
    use collector_core::config::CollectorConfig;
    use collector_core::model::{Hints, MessageNode, Severity};
    use collector_store::writer::FakeStore;
    use collector_store::ConnectionState;

    fn test_config() -> CollectorConfig {
        CollectorConfig {
            partitions: 16,
            aggconf: Default::default(),
            brokers: "localhost:9092".into(),
            kafka_prefix: "analytics".into(),
            redis_uve_endpoint: "localhost:6379".into(),
            redis_password: None,
            cassandra_endpoints: vec!["localhost:9042".into()],
            cassandra_user: None,
            cassandra_password: None,
            ttl_map: Default::default(),
            disable_all_writes: false,
            disable_statistics_writes: false,
            disable_messages_writes: false,
            disk_usage_watermark: collector_core::config::WatermarkThresholds { high: 85, low: 70 },
            pending_compaction_watermark: collector_core::config::WatermarkThresholds { high: 400, low: 200 },
            structured_syslog_port: None,
            sflow_port: None,
            ipfix_port: None,
            row_time_bits: 16,
            cache_epoch_bits: 6,
            aggregator_commit_period_secs: 60,
            aggregator_staleness_secs: 60,
            kafka_activity_check_ms: 30_000,
            msg_table_max_objects_per_msg: 6,
        }
    }

    fn test_receive_path() -> (ReceivePath, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::new());
        let writer = Arc::new(StoreWriter::new(store.clone(), test_config()));
        let conn_state = Arc::new(ConnectionState::new());
        let opstore = Arc::new(OpStoreClient::new(
            OpStoreConfig {
                endpoint: "localhost:6379".into(),
                password: None,
            },
            conn_state.clone(),
        ));
        let producer_config = BusProducerConfig {
            brokers: "localhost:9092".into(),
            kafka_prefix: "analytics".into(),
            partitions: 16,
            aggconf: Default::default(),
        };
        let producer = Arc::new(BusProducer::new(producer_config, conn_state).unwrap());
        let uve = Arc::new(UvePublisher::new(opstore.clone(), producer, 0, 16));
        let registry = Arc::new(GeneratorRegistry::new(opstore.clone()));
        (
            ReceivePath::new(writer, uve, opstore, registry, "collector-1"),
            store,
        )
    }

    fn header(sandesh_type: SandeshType, severity: Severity) -> collector_core::model::SessionHeader {
        collector_core::model::SessionHeader {
            source: "host-a".into(),
            module: "bgp".into(),
            instance_id: "0".into(),
            node_type: "Control".into(),
            category: "default".into(),
            severity,
            sandesh_type,
            timestamp: 1,
            sequence_num: 1,
            pid: None,
            ip_address: None,
            hints: Hints::default(),
        }
    }

    #[tokio::test]
    async fn dropped_message_writes_nothing() {
        let (path, store) = test_receive_path();
        let generator = GeneratorId::new("host-a", "bgp", "Control", "0");
        let msg = SessionMessage {
            header: header(SandeshType::Flow, Severity::Debug),
            body: MessageNode::new("msg"),
            unm: "u1".into(),
        };
        path.dispatch(&generator, &msg, true).await;
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn object_annotated_message_writes_object_table_and_message_table() {
        let (path, store) = test_receive_path();
        let generator = GeneratorId::new("host-a", "bgp", "Control", "0");
        let body = MessageNode::new("msg").with_child(
            MessageNode::new("name")
                .with_attr("key", "ObjectVNTable")
                .with_text("vn02"),
        );
        let msg = SessionMessage {
            header: header(SandeshType::Object, Severity::Debug),
            body,
            unm: "u1".into(),
        };
        path.dispatch(&generator, &msg, false).await;
        assert_eq!(
            store.rows_in(collector_store::schema::tables::OBJECT_TABLE).len(),
            1
        );
        assert_eq!(
            store.rows_in(collector_store::schema::tables::COLLECTOR_GLOBAL_TABLE).len(),
            1
        );
    }

    #[tokio::test]
    async fn flow_message_writes_flow_table_rows() {
        let (path, store) = test_receive_path();
        let generator = GeneratorId::new("host-a", "bgp", "Control", "0");
        let element = MessageNode::new("flow")
            .with_child(MessageNode::new("flow_uuid").with_text("f1"))
            .with_child(MessageNode::new("vrouter").with_text("vr-a"));
        let flowdata = MessageNode::new("flowdata").with_child(element);
        let body = MessageNode::new("msg").with_child(flowdata);
        let msg = SessionMessage {
            header: header(SandeshType::Flow, Severity::Debug),
            body,
            unm: "u1".into(),
        };
        path.dispatch(&generator, &msg, false).await;
        assert_eq!(
            store.rows_in(collector_store::schema::tables::FLOW_TABLE).len(),
            1
        );
    }

    #[tokio::test]
    async fn disconnect_of_unknown_generator_skips_uve_teardown() {
        let (path, _store) = test_receive_path();
        let generator = GeneratorId::new("host-a", "bgp", "Control", "0");
        path.on_generator_disconnect(&generator).await;
    }
}
