//! Pub/sub producer (C8): per-UVE partitioned publish to raw UVE topics, plus
//! an optional content-hash-partitioned publish to aggregation topics.
//!
//! Grounded on `kafka_processor.h`/`.cc` (`KafkaPub` two overloads, the
//! `kafka_tick`/`kActivityCheckPeriod_ms_` connectivity watchdog, `aggconf_`,
//! and `disableKafka`/metadata-refetch recovery path). Built over
//! `rdkafka::producer::FutureProducer`, the crate the teacher already
//! depends on.

use collector_core::error::{CollectorError, Result};
use collector_store::connstate::{ConnectionState, PeerKind, PeerRole, Status};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct BusProducerConfig {
    pub brokers: String,
    pub kafka_prefix: String,
    pub partitions: u32,
    /// `"<struct_type>-<attr>"` -> aggregation stream name.
    pub aggconf: BTreeMap<String, Vec<String>>,
}

impl BusProducerConfig {
    pub fn raw_uve_topic(&self, partition: u32) -> String {
        format!("{}-uve-{partition}", self.kafka_prefix)
    }

    pub fn agg_topic(&self, stream: &str) -> String {
        format!("{}-agg-{stream}", self.kafka_prefix)
    }

    /// Whether `"<struct_type>-<attr>"` matches a configured aggregation
    /// stream, per spec.md §4.5's "Aggregation topic (optional...)" clause.
    pub fn aggregation_streams_for(&self, struct_type: &str, attr: &str) -> Vec<&str> {
        self.aggconf
            .get(&format!("{struct_type}-{attr}"))
            .map(|streams| streams.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Connectivity watchdog state: a delivery-callback counter bumped from the
/// producer context, inspected once per tick (spec.md §4.5).
#[derive(Default)]
struct DeliveryCounter {
    count: AtomicU64,
    disabled: AtomicBool,
}

pub struct BusProducer {
    config: BusProducerConfig,
    producer: FutureProducer,
    conn_state: Arc<ConnectionState>,
    delivery: Arc<DeliveryCounter>,
}

impl BusProducer {
    pub fn new(config: BusProducerConfig, conn_state: Arc<ConnectionState>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| CollectorError::Configuration(format!("kafka producer create failed: {e}")))?;
        Ok(Self {
            config,
            producer,
            conn_state,
            delivery: Arc::new(DeliveryCounter::default()),
        })
    }

    fn disabled(&self) -> bool {
        self.delivery.disabled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BusProducerConfig {
        &self.config
    }

    /// Raw UVE topic publish. `key = "<uve_key>|<struct_type>|<generator>|<collector_endpoint>"`.
    /// On deletion, `payload` is empty (tombstone); on update, a JSON object
    /// built by the caller — only `UVEAlarms` carries the full attribute map
    /// (§9 Open Question, preserved as-is).
    pub async fn publish_uve(
        &self,
        part_base: u32,
        part_count: u32,
        uve_key: &str,
        struct_type: &str,
        generator: &str,
        collector_endpoint: &str,
        payload: &str,
    ) -> Result<()> {
        if self.disabled() {
            info!("kafka ignoring KafkaPub (raw uve)");
            return Ok(());
        }
        let partition =
            crate::opstore::OpStoreClient::partition_for(uve_key, part_base, part_count);
        let topic = self.config.raw_uve_topic(partition);
        let key = format!("{uve_key}|{struct_type}|{generator}|{collector_endpoint}");
        let record = FutureRecord::to(&topic).key(&key).payload(payload);
        match self.producer.send(record, Timeout::After(Duration::from_secs(5))).await {
            Ok(_) => {
                self.delivery.count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic, error = %e, "raw uve publish failed");
                Err(CollectorError::Transient("raw uve publish failed"))
            }
        }
    }

    /// Aggregation topic publish; partition derived from a hash of the key
    /// (§4.5's "content hash-derived partition").
    pub async fn publish_aggregation(&self, stream: &str, skey: &str, value: &str) -> Result<()> {
        if self.disabled() {
            info!("kafka ignoring Agg KafkaPub");
            return Ok(());
        }
        let topic = self.config.agg_topic(stream);
        let partition = (collector_store::schema::djb_hash(skey)
            % self.config.partitions.max(1) as u64) as i32;
        let record = FutureRecord::to(&topic)
            .key(skey)
            .payload(value)
            .partition(partition);
        match self.producer.send(record, Timeout::After(Duration::from_secs(5))).await {
            Ok(_) => {
                self.delivery.count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic, error = %e, "aggregation publish failed");
                Err(CollectorError::Transient("aggregation publish failed"))
            }
        }
    }

    /// Fires every ~1s (spec.md §4.5). Within the first ~30s of startup, and
    /// whenever `disabled` is set, checks whether any delivery callback has
    /// fired since the last tick; if so, clears `disabled` and instructs the
    /// caller (via the returned bool) to re-trigger `OnRedisUp` once the
    /// operational store is also UP.
    pub async fn tick(&self, startup_window: bool, opstore_up: bool) -> bool {
        let delivered = self.delivery.count.swap(0, Ordering::Relaxed);
        let should_check = startup_window || self.disabled();
        if !should_check {
            return false;
        }
        if delivered == 0 {
            self.delivery.disabled.store(true, Ordering::Relaxed);
            self.conn_state.update(
                PeerKind::PubSub,
                PeerRole::To,
                &self.config.brokers,
                Status::Down,
                "no kafka callbacks",
            );
            error!("no kafka callbacks observed this tick");
            return false;
        }
        self.conn_state.update(
            PeerKind::PubSub,
            PeerRole::To,
            &self.config.brokers,
            Status::Up,
            "delivering",
        );
        if self.disabled() {
            match self
                .producer
                .client()
                .fetch_metadata(None, Duration::from_secs(5))
            {
                Ok(_) => {
                    info!("kafka metadata detected, clearing disabled flag");
                    self.delivery.disabled.store(false, Ordering::Relaxed);
                    return opstore_up;
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch kafka metadata");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_streams_for_matches_configured_attribute() {
        let mut aggconf = BTreeMap::new();
        aggconf.insert(
            "UveVirtualNetworkAgent-in_tpkts".to_string(),
            vec!["AggProxySum".to_string()],
        );
        let config = BusProducerConfig {
            brokers: "localhost:9092".into(),
            kafka_prefix: "analytics".into(),
            partitions: 16,
            aggconf,
        };
        assert_eq!(
            config.aggregation_streams_for("UveVirtualNetworkAgent", "in_tpkts"),
            vec!["AggProxySum"]
        );
        assert!(config.aggregation_streams_for("Other", "x").is_empty());
    }

    #[test]
    fn topic_names_follow_prefix_convention() {
        let config = BusProducerConfig {
            brokers: "localhost:9092".into(),
            kafka_prefix: "analytics".into(),
            partitions: 16,
            aggconf: Default::default(),
        };
        assert_eq!(config.raw_uve_topic(3), "analytics-uve-3");
        assert_eq!(config.agg_topic("AggProxySum"), "analytics-agg-AggProxySum");
    }
}
