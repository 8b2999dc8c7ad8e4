//! Process configuration, loadable from YAML with CLI overrides applied by
//! the `collector-cli` binary. One field group per row of the configuration
//! table in SPEC_FULL.md §6.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_partitions() -> u32 {
    16
}

fn default_row_time_bits() -> u32 {
    16
}

fn default_cache_epoch_bits() -> u32 {
    6
}

fn default_kafka_prefix() -> String {
    "analytics".to_string()
}

fn default_commit_period_secs() -> u64 {
    3600
}

fn default_staleness_secs() -> u64 {
    60
}

fn default_activity_check_ms() -> u64 {
    30_000
}

/// Per-class TTL, in seconds. Mirrors `SYSTEM_OBJECT_TABLE`'s configured TTL
/// columns (`SYSTEM_OBJECT_FLOW_DATA_TTL` etc.) from the original schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlMap {
    #[serde(default = "default_ttl_flow")]
    pub flow_data: u32,
    #[serde(default = "default_ttl_stats")]
    pub stats_data: u32,
    #[serde(default = "default_ttl_config_audit")]
    pub config_audit: u32,
    #[serde(default = "default_ttl_global")]
    pub global: u32,
}

fn default_ttl_flow() -> u32 {
    2 * 24 * 3600
}
fn default_ttl_stats() -> u32 {
    3 * 24 * 3600
}
fn default_ttl_config_audit() -> u32 {
    31 * 24 * 3600
}
fn default_ttl_global() -> u32 {
    48 * 3600
}

impl Default for TtlMap {
    fn default() -> Self {
        Self {
            flow_data: default_ttl_flow(),
            stats_data: default_ttl_stats(),
            config_audit: default_ttl_config_audit(),
            global: default_ttl_global(),
        }
    }
}

/// Rising/falling disk-usage or pending-compaction watermark, expressed as a
/// percentage (disk usage) or a task count (pending compaction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkThresholds {
    pub high: u32,
    pub low: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Number of raw UVE partitions / topics.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Mapping attribute-stream (`"<struct_type>-<attr>"`) to the list of
    /// proxy aggregation types configured for it (e.g. `sum`, `ewma`).
    #[serde(default)]
    pub aggconf: BTreeMap<String, Vec<String>>,

    /// Pub/sub bootstrap endpoint, e.g. `"localhost:9092"`.
    pub brokers: String,

    /// Prefix for raw (`<prefix>-uve-<N>`) and aggregation
    /// (`<prefix>-agg-<stream>`) topic names.
    #[serde(default = "default_kafka_prefix")]
    pub kafka_prefix: String,

    /// Operational KV store address, `host:port`.
    pub redis_uve_endpoint: String,

    /// Optional AUTH secret for the operational store.
    #[serde(default)]
    pub redis_password: Option<String>,

    /// Wide-column store endpoints.
    pub cassandra_endpoints: Vec<String>,
    #[serde(default)]
    pub cassandra_user: Option<String>,
    #[serde(default)]
    pub cassandra_password: Option<String>,

    #[serde(default)]
    pub ttl_map: TtlMap,

    #[serde(default)]
    pub disable_all_writes: bool,
    #[serde(default)]
    pub disable_statistics_writes: bool,
    #[serde(default)]
    pub disable_messages_writes: bool,

    pub disk_usage_watermark: WatermarkThresholds,
    pub pending_compaction_watermark: WatermarkThresholds,

    /// UDP ports for the auxiliary ingest paths.
    #[serde(default)]
    pub structured_syslog_port: Option<u16>,
    #[serde(default)]
    pub sflow_port: Option<u16>,
    #[serde(default)]
    pub ipfix_port: Option<u16>,

    /// `k` in the T2/T1 row-time split (`T2 = T >> k`). Configurable rather
    /// than a hardcoded constant — see DESIGN.md's note on `viz_constants.h`.
    #[serde(default = "default_row_time_bits")]
    pub row_time_bits: u32,

    /// `c` in the FieldName cache epoch (`cache_epoch = T2 >> c`).
    #[serde(default = "default_cache_epoch_bits")]
    pub cache_epoch_bits: u32,

    /// Aggregator commit period, in seconds (production default is one
    /// hour; tests configure a much shorter period, per spec.md §8 scenario 4).
    #[serde(default = "default_commit_period_secs")]
    pub aggregator_commit_period_secs: u64,

    /// Age past which an aggregation sample is considered stale and dropped
    /// instead of proxied (spec.md §4.7 step 3).
    #[serde(default = "default_staleness_secs")]
    pub aggregator_staleness_secs: u64,

    /// Pub/sub connectivity watchdog tick period, in milliseconds.
    #[serde(default = "default_activity_check_ms")]
    pub kafka_activity_check_ms: u64,

    /// Maximum object names written per message-table row; anything beyond
    /// this is counted and dropped (spec.md §8 boundary behaviour).
    #[serde(default = "default_max_objects_per_msg")]
    pub msg_table_max_objects_per_msg: usize,
}

fn default_max_objects_per_msg() -> usize {
    6
}

impl CollectorConfig {
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_in_defaults() {
        let yaml = r#"
brokers: "localhost:9092"
redis_uve_endpoint: "localhost:6379"
cassandra_endpoints: ["localhost:9042"]
disk_usage_watermark: { high: 85, low: 70 }
pending_compaction_watermark: { high: 400, low: 200 }
"#;
        let cfg = CollectorConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.partitions, 16);
        assert_eq!(cfg.kafka_prefix, "analytics");
        assert_eq!(cfg.ttl_map.global, default_ttl_global());
        assert_eq!(cfg.msg_table_max_objects_per_msg, 6);
    }
}
