//! Store writer (C2): accepts `StoreRow` inserts against a wide-column
//! store reduced to the `ColumnStore` trait (spec.md §1 treats the CQL
//! driver as "column-family CRUD with per-request consistency"), honours
//! the three kill-switches, computes the effective drop severity, and
//! maintains the FieldNames secondary index.

use async_trait::async_trait;
use collector_core::config::CollectorConfig;
use collector_core::error::{CollectorError, Result};
use collector_core::model::{AttribMap, Severity, Var};
use rand::Rng;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::connstate::ConnectionState;
use crate::schema::{cache_epoch, djb_hash, row_time_split, tables, FieldNameCache, TtlClass};

/// An abstract row: column family, row key components, column name
/// components, value, and TTL. `ColumnStore` implementations turn this into
/// whatever the underlying driver's write API expects.
#[derive(Debug, Clone)]
pub struct StoreRow {
    pub column_family: &'static str,
    pub row_key: Vec<String>,
    pub column_name: Vec<String>,
    pub value: String,
    pub ttl_seconds: u32,
}

/// Consistency level passed through to the driver; kept abstract since the
/// concrete enum belongs to whichever CQL crate implements `ColumnStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    One,
    Quorum,
}

/// The CQL-family driver reduced to an interface, per spec.md §1.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    async fn create_tables(&self) -> Result<()>;
    async fn use_column_family(&self, table: &str) -> Result<()>;
    async fn insert_row(&self, row: StoreRow, consistency: Consistency) -> Result<()>;
    async fn get_row(&self, table: &str, row_key: &[String]) -> Result<Option<Vec<u8>>>;
}

/// An in-memory `ColumnStore` used by tests and as a development fallback.
#[derive(Default)]
pub struct FakeStore {
    rows: Mutex<Vec<StoreRow>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<StoreRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn rows_in(&self, table: &str) -> Vec<StoreRow> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.column_family == table)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ColumnStore for FakeStore {
    async fn create_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn use_column_family(&self, _table: &str) -> Result<()> {
        Ok(())
    }

    async fn insert_row(&self, row: StoreRow, _consistency: Consistency) -> Result<()> {
        self.rows.lock().unwrap().push(row);
        Ok(())
    }

    async fn get_row(&self, table: &str, row_key: &[String]) -> Result<Option<Vec<u8>>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|r| r.column_family == table && r.row_key == row_key)
            .map(|r| r.value.clone().into_bytes()))
    }
}

/// Tracks how many dropped messages were counted, by severity, for tests
/// and the metrics endpoint (C12 reads a snapshot of this).
#[derive(Debug, Default, Clone)]
pub struct DropStats {
    pub dropped: Vec<(Severity, u64)>,
}

pub struct StoreWriter {
    store: Arc<dyn ColumnStore>,
    config: CollectorConfig,
    field_cache: Mutex<FieldNameCache>,
    dropped_msg_stats: Mutex<std::collections::BTreeMap<String, u64>>,
    queue_drop_level: Mutex<Severity>,
    disk_usage_drop_level: Mutex<Severity>,
    pending_compaction_drop_level: Mutex<Severity>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn ColumnStore>, config: CollectorConfig) -> Self {
        Self {
            store,
            config,
            field_cache: Mutex::new(FieldNameCache::new()),
            dropped_msg_stats: Mutex::new(Default::default()),
            queue_drop_level: Mutex::new(Severity::Debug),
            disk_usage_drop_level: Mutex::new(Severity::Debug),
            pending_compaction_drop_level: Mutex::new(Severity::Debug),
        }
    }

    pub fn set_queue_drop_level(&self, sev: Severity) {
        *self.queue_drop_level.lock().unwrap() = sev;
    }

    /// Drives `disk_usage_drop_level` from a raw percentage against the
    /// configured high/low watermarks.
    pub fn process_disk_usage_percentage(&self, pct: u32) {
        let wm = &self.config.disk_usage_watermark;
        let mut level = self.disk_usage_drop_level.lock().unwrap();
        if pct >= wm.high {
            *level = Severity::Warn;
        } else if pct < wm.low {
            *level = Severity::Debug;
        }
    }

    pub fn process_pending_compaction_tasks(&self, count: u32) {
        let wm = &self.config.pending_compaction_watermark;
        let mut level = self.pending_compaction_drop_level.lock().unwrap();
        if count >= wm.high {
            *level = Severity::Warn;
        } else if count < wm.low {
            *level = Severity::Debug;
        }
    }

    /// The worst of the three watermark-driven levels. `Critical` < `Error`
    /// < `Warn` under `Severity::Ord`, so the most aggressive drop level is
    /// the *minimum* of the three, not the maximum.
    pub fn effective_drop_level(&self) -> Severity {
        let queue = *self.queue_drop_level.lock().unwrap();
        let disk = *self.disk_usage_drop_level.lock().unwrap();
        let compaction = *self.pending_compaction_drop_level.lock().unwrap();
        queue.min(disk).min(compaction)
    }

    fn should_drop(&self, severity: Severity) -> bool {
        severity >= self.effective_drop_level()
    }

    fn count_drop(&self, key: &str) {
        *self
            .dropped_msg_stats
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    pub fn dropped_msg_stats(&self) -> std::collections::BTreeMap<String, u64> {
        self.dropped_msg_stats.lock().unwrap().clone()
    }

    fn ttl_for(&self, class: TtlClass) -> u32 {
        match class {
            TtlClass::Flow => self.config.ttl_map.flow_data,
            TtlClass::Stats => self.config.ttl_map.stats_data,
            TtlClass::ConfigAudit => self.config.ttl_map.config_audit,
            TtlClass::Global => self.config.ttl_map.global,
        }
    }

    pub async fn init(&self, first_time: bool) -> Result<()> {
        if first_time {
            self.create_tables().await
        } else {
            for table in tables::ALL {
                self.store.use_column_family(table).await?;
            }
            Ok(())
        }
    }

    /// Idempotently creates every declared table. On first bring-up also
    /// writes the `SystemObjectTable` row used by subsequent bring-ups to
    /// detect "already initialised".
    pub async fn create_tables(&self) -> Result<()> {
        for table in tables::ALL {
            self.store.use_column_family(table).await.map_err(|e| {
                CollectorError::Fatal(format!("CreateTables failed for {table}: {e}"))
            })?;
        }
        let already_initialised = self
            .store
            .get_row(tables::SYSTEM_OBJECT_TABLE, &["bringup".to_string()])
            .await?
            .is_some();
        if !already_initialised {
            let row = StoreRow {
                column_family: tables::SYSTEM_OBJECT_TABLE,
                row_key: vec!["bringup".to_string()],
                column_name: vec!["creation_time_utc".to_string()],
                value: format!("{:?}", std::time::SystemTime::now()),
                ttl_seconds: 0,
            };
            self.store.insert_row(row, Consistency::Quorum).await?;
        }
        Ok(())
    }

    pub async fn insert_row(&self, row: StoreRow, consistency: Consistency) -> Result<()> {
        if self.config.disable_all_writes {
            return Err(CollectorError::Transient("store writes disabled"));
        }
        self.store.insert_row(row, consistency).await
    }

    /// `MessageTableInsert` — row key `(T2, random_partition_byte)`, column
    /// `(T1, uuid)` plus up to `msg_table_max_objects_per_msg` object-name
    /// secondary attributes, each prefixed `"T2:"`.
    pub async fn message_table_insert(
        &self,
        severity: Severity,
        message_type: &str,
        timestamp_us: u64,
        uuid: &str,
        object_names: &[String],
        body: &str,
    ) -> Result<()> {
        if self.config.disable_all_writes || self.config.disable_messages_writes {
            return Err(CollectorError::Transient("message writes disabled"));
        }
        if self.should_drop(severity) {
            self.count_drop(message_type);
            return Ok(());
        }
        let (t2, t1) = row_time_split(timestamp_us, self.config.row_time_bits);
        let partition_byte: u8 = rand::thread_rng().gen();
        let max = self.config.msg_table_max_objects_per_msg;
        if object_names.len() > max {
            self.count_drop("object_names_truncated");
        }
        let mut column_name = vec![t1.to_string(), uuid.to_string()];
        for name in object_names.iter().take(max) {
            column_name.push(format!("T2:{name}"));
        }
        let ttl = if message_type == "config-audit" {
            self.ttl_for(TtlClass::ConfigAudit)
        } else {
            self.ttl_for(TtlClass::Global)
        };
        let row = StoreRow {
            column_family: tables::COLLECTOR_GLOBAL_TABLE,
            row_key: vec![t2.to_string(), partition_byte.to_string()],
            column_name,
            value: body.to_string(),
            ttl_seconds: ttl,
        };
        self.insert_row(row, Consistency::One).await
    }

    /// `ObjectTableInsert` — row `(T2, table)`, column `T1 -> bare_key`.
    /// Also writes FieldNames rows for object id, type, module, and source
    /// (spec.md §8 scenario 1: exactly four rows per object insert).
    pub async fn object_table_insert(
        &self,
        table: &str,
        bare_key: &str,
        timestamp_us: u64,
        uuid: &str,
        source: &str,
        module: &str,
    ) -> Result<()> {
        if self.config.disable_all_writes {
            return Err(CollectorError::Transient("store writes disabled"));
        }
        let (t2, t1) = row_time_split(timestamp_us, self.config.row_time_bits);
        let row = StoreRow {
            column_family: tables::OBJECT_TABLE,
            row_key: vec![t2.to_string(), table.to_string()],
            column_name: vec![t1.to_string()],
            value: format!("{bare_key}|{uuid}"),
            ttl_seconds: self.ttl_for(TtlClass::Global),
        };
        self.insert_row(row, Consistency::One).await?;

        for (field, value) in [
            ("ObjectId", bare_key),
            ("Messagetype", table),
            ("ModuleId", module),
            ("Source", source),
        ] {
            self.field_names_insert(timestamp_us, field, value).await?;
        }
        Ok(())
    }

    /// Writes a FieldNames row unless `(cache_epoch, field_signature)` was
    /// already recorded this epoch.
    pub async fn field_names_insert(
        &self,
        timestamp_us: u64,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let (t2, _) = row_time_split(timestamp_us, self.config.row_time_bits);
        let epoch = cache_epoch(t2, self.config.cache_epoch_bits);
        let signature = format!("{field}:{value}");
        let is_new = self
            .field_cache
            .lock()
            .unwrap()
            .record_if_new(epoch, &signature);
        if !is_new {
            return Ok(());
        }
        let row = StoreRow {
            column_family: tables::FIELD_NAMES_TABLE,
            row_key: vec![epoch.to_string()],
            column_name: vec![field.to_string(), value.to_string()],
            value: String::new(),
            ttl_seconds: self.ttl_for(TtlClass::Global),
        };
        self.insert_row(row, Consistency::One).await
    }

    /// `StatTableInsert` (used by the C11 stat walker injector). A fully
    /// empty attribute map is a no-op (spec.md §8 idempotence law).
    pub async fn stat_table_insert(
        &self,
        timestamp_us: u64,
        stat_name: &str,
        stat_attr: &str,
        attribs: &AttribMap,
    ) -> Result<()> {
        if self.config.disable_all_writes || self.config.disable_statistics_writes {
            return Err(CollectorError::Transient("statistics writes disabled"));
        }
        if attribs.is_empty() {
            return Ok(());
        }
        let (t2, t1) = row_time_split(timestamp_us, self.config.row_time_bits);
        for (tag, value) in attribs {
            let table = match value {
                Var::Str(_) => tables::STATS_TABLE_BY_STR_TAG,
                Var::U64(_) => tables::STATS_TABLE_BY_U64_TAG,
                Var::Dbl(_) => tables::STATS_TABLE_BY_DBL_TAG,
                Var::Invalid => {
                    debug!(stat_name, stat_attr, tag, "unsupported stat value variant");
                    self.count_drop(&format!("{stat_name}.{stat_attr}"));
                    continue;
                }
            };
            let row = StoreRow {
                column_family: table,
                row_key: vec![t2.to_string(), stat_name.to_string(), tag.clone()],
                column_name: vec![t1.to_string(), stat_attr.to_string()],
                value: value.to_string(),
                ttl_seconds: self.ttl_for(TtlClass::Stats),
            };
            self.insert_row(row, Consistency::One).await?;
        }
        Ok(())
    }

    /// `UnderlayFlowSampleInsert` used by the UDP ingest path (C10), keyed
    /// by a hash of the bare key rather than a random byte.
    pub async fn flow_sample_insert(
        &self,
        timestamp_us: u64,
        bare_key: &str,
        attribs: &AttribMap,
    ) -> Result<()> {
        if self.config.disable_all_writes {
            return Err(CollectorError::Transient("store writes disabled"));
        }
        let (t2, t1) = row_time_split(timestamp_us, self.config.row_time_bits);
        let partition = djb_hash(bare_key) % 256;
        let value = attribs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let row = StoreRow {
            column_family: tables::FLOW_TABLE,
            row_key: vec![t2.to_string(), partition.to_string()],
            column_name: vec![t1.to_string(), bare_key.to_string()],
            value,
            ttl_seconds: self.ttl_for(TtlClass::Flow),
        };
        self.insert_row(row, Consistency::One).await
    }

    /// `FlowTableInsert` — the session-level flow record plus its five index
    /// rows (spec.md §4.2/§6), each keyed so the query engine can look a flow
    /// up by any of the indexed dimensions without scanning the main table.
    pub async fn flow_table_insert(&self, record: &FlowRecord) -> Result<()> {
        if self.config.disable_all_writes {
            return Err(CollectorError::Transient("store writes disabled"));
        }
        let (t2, t1) = row_time_split(record.timestamp_us, self.config.row_time_bits);
        let ttl = self.ttl_for(TtlClass::Flow);

        let main = StoreRow {
            column_family: tables::FLOW_TABLE,
            row_key: vec![t2.to_string(), record.vrouter.clone()],
            column_name: vec![t1.to_string(), record.flow_uuid.clone()],
            value: record.value.clone(),
            ttl_seconds: ttl,
        };
        self.insert_row(main, Consistency::One).await?;

        let index_rows: [(&'static str, String); 5] = [
            (
                tables::FLOW_TABLE_SVN_SIP,
                format!("{}:{}", record.source_vn, record.source_ip),
            ),
            (
                tables::FLOW_TABLE_DVN_DIP,
                format!("{}:{}", record.dest_vn, record.dest_ip),
            ),
            (
                tables::FLOW_TABLE_PROT_SP,
                format!("{}:{}", record.protocol, record.source_port),
            ),
            (
                tables::FLOW_TABLE_PROT_DP,
                format!("{}:{}", record.protocol, record.dest_port),
            ),
            (tables::FLOW_TABLE_VROUTER, record.vrouter.clone()),
        ];
        for (table, index_key) in index_rows {
            let row = StoreRow {
                column_family: table,
                row_key: vec![t2.to_string(), index_key],
                column_name: vec![t1.to_string(), record.flow_uuid.clone()],
                value: String::new(),
                ttl_seconds: ttl,
            };
            self.insert_row(row, Consistency::One).await?;
        }
        Ok(())
    }

    /// `SessionTableInsert` — one row per session record, row key `(T2,
    /// vrouter)` mirroring the flow table's vrouter partitioning since
    /// sessions and flows share the same underlying 5-tuple.
    pub async fn session_table_insert(
        &self,
        timestamp_us: u64,
        vrouter: &str,
        session_uuid: &str,
        value: &str,
    ) -> Result<()> {
        if self.config.disable_all_writes {
            return Err(CollectorError::Transient("store writes disabled"));
        }
        let (t2, t1) = row_time_split(timestamp_us, self.config.row_time_bits);
        let row = StoreRow {
            column_family: tables::SESSION_TABLE,
            row_key: vec![t2.to_string(), vrouter.to_string()],
            column_name: vec![t1.to_string(), session_uuid.to_string()],
            value: value.to_string(),
            ttl_seconds: self.ttl_for(TtlClass::Flow),
        };
        self.insert_row(row, Consistency::One).await
    }
}

/// `FlowTableInsert`'s schematised record shape (spec.md §4.2/§6): the
/// session-level flow plus the five dimensions it gets indexed by.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub timestamp_us: u64,
    pub flow_uuid: String,
    pub vrouter: String,
    pub source_vn: String,
    pub source_ip: String,
    pub dest_vn: String,
    pub dest_ip: String,
    pub protocol: String,
    pub source_port: u16,
    pub dest_port: u16,
    pub value: String,
}

#[async_trait::async_trait]
impl crate::connstate::Monitored for StoreWriter {
    async fn describe(&self) -> String {
        format!("store writer, drop_level={:?}", self.effective_drop_level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collector_core::config::WatermarkThresholds;

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
            disk_usage_watermark: WatermarkThresholds { high: 85, low: 70 },
            pending_compaction_watermark: WatermarkThresholds { high: 400, low: 200 },
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

    #[tokio::test]
    async fn object_table_insert_writes_row_and_four_field_names() {
        let store = Arc::new(FakeStore::new());
        let writer = StoreWriter::new(store.clone(), test_config());
        writer
            .object_table_insert("ObjectVNTable", "vn02", 0x2_0000_0000, "uuid-1", "H1", "M")
            .await
            .unwrap();
        assert_eq!(store.rows_in(tables::OBJECT_TABLE).len(), 1);
        assert_eq!(store.rows_in(tables::FIELD_NAMES_TABLE).len(), 4);
    }

    #[tokio::test]
    async fn drop_escalation_drops_info_keeps_error() {
        let store = Arc::new(FakeStore::new());
        let writer = StoreWriter::new(store, test_config());
        writer.process_disk_usage_percentage(86);
        assert_eq!(writer.effective_drop_level(), Severity::Warn);

        writer
            .message_table_insert(Severity::Info, "log", 1, "u1", &[], "info body")
            .await
            .unwrap();
        writer
            .message_table_insert(Severity::Error, "log", 2, "u2", &[], "error body")
            .await
            .unwrap();

        let dropped = writer.dropped_msg_stats();
        assert_eq!(*dropped.get("log").unwrap(), 1);
    }

    #[tokio::test]
    async fn stat_table_insert_of_empty_map_is_noop() {
        let store = Arc::new(FakeStore::new());
        let writer = StoreWriter::new(store, test_config());
        writer
            .stat_table_insert(1, "Foo", "bar", &Default::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn object_names_beyond_max_are_truncated_and_counted() {
        let store = Arc::new(FakeStore::new());
        let writer = StoreWriter::new(store, test_config());
        let names: Vec<String> = (0..10).map(|i| format!("obj{i}")).collect();
        writer
            .message_table_insert(Severity::Debug, "log", 1, "u1", &names, "body")
            .await
            .unwrap();
        let dropped = writer.dropped_msg_stats();
        assert_eq!(*dropped.get("object_names_truncated").unwrap(), 1);
    }

    #[tokio::test]
    async fn flow_table_insert_writes_main_row_and_five_index_rows() {
        let store = Arc::new(FakeStore::new());
        let writer = StoreWriter::new(store.clone(), test_config());
        let record = FlowRecord {
            timestamp_us: 1,
            flow_uuid: "flow-1".into(),
            vrouter: "vrouter-a".into(),
            source_vn: "vn-a".into(),
            source_ip: "10.0.0.1".into(),
            dest_vn: "vn-b".into(),
            dest_ip: "10.0.0.2".into(),
            protocol: "tcp".into(),
            source_port: 1234,
            dest_port: 80,
            value: "flow-body".into(),
        };
        writer.flow_table_insert(&record).await.unwrap();
        assert_eq!(store.rows_in(tables::FLOW_TABLE).len(), 1);
        assert_eq!(store.rows_in(tables::FLOW_TABLE_SVN_SIP).len(), 1);
        assert_eq!(store.rows_in(tables::FLOW_TABLE_DVN_DIP).len(), 1);
        assert_eq!(store.rows_in(tables::FLOW_TABLE_PROT_SP).len(), 1);
        assert_eq!(store.rows_in(tables::FLOW_TABLE_PROT_DP).len(), 1);
        assert_eq!(store.rows_in(tables::FLOW_TABLE_VROUTER).len(), 1);
    }

    #[tokio::test]
    async fn session_table_insert_writes_one_row() {
        let store = Arc::new(FakeStore::new());
        let writer = StoreWriter::new(store.clone(), test_config());
        writer
            .session_table_insert(1, "vrouter-a", "session-1", "session-body")
            .await
            .unwrap();
        assert_eq!(store.rows_in(tables::SESSION_TABLE).len(), 1);
    }
}
