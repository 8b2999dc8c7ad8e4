//! Pub/sub consumer + aggregator (C9): consumes the `agg` consumer-group's
//! aggregation topics, merges samples by key with epoch-based commit
//! semantics, and emits proxy-UVE trace records.
//!
//! Grounded on `uve_aggregator.h`/`.cc` (epoch commit math, per-partition
//! "last message of this epoch" retention, the 60s staleness cutoff) and, for
//! the Rust consumer-loop idiom, the `siem_unified_pipeline` example's
//! `ConsumerContext` `pre_rebalance`/`post_rebalance` + `StreamConsumer`
//! pattern. `rde-io`'s `source_kafka.rs` supplied the "spawn a task that
//! loops `stream.next()`" shape reused here.

use collector_core::error::{CollectorError, Result};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// One proxy aggregation type the consumer fans a sample out to, per
/// `conf_` in `uve_aggregator.h` (`AggProxySum`, `AggProxySumAnomalyEWM01`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Sum,
    EwmaAnomaly,
}

/// Emitted by the aggregator for each fresh, non-stale sample and configured
/// proxy type — the "proxy snapshot" spec.md §1 says the aggregation
/// consumer republishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyUveSample {
    pub proxy_kind: ProxyKind,
    pub topic: String,
    pub table: String,
    pub key: String,
    pub raw: u64,
    pub partition: i32,
}

struct PartitionState {
    stored_offset: i64,
    epoch: u64,
    last_of_epoch: Option<(i32, i64)>,
}

impl Default for PartitionState {
    fn default() -> Self {
        Self {
            stored_offset: -1,
            epoch: 0,
            last_of_epoch: None,
        }
    }
}

/// Per-aggregation-topic state: offsets, epoch, and retained last-message.
/// `Clear` (rebalance revoke/reassign) resets everything for one partition,
/// including the caller-supplied proxy-UVE zeroing hook.
pub struct TopicAggregatorState {
    pub topic: String,
    pub proxy_kinds: Vec<ProxyKind>,
    partitions: Mutex<BTreeMap<i32, PartitionState>>,
}

impl TopicAggregatorState {
    pub fn new(topic: impl Into<String>, proxy_kinds: Vec<ProxyKind>) -> Self {
        Self {
            topic: topic.into(),
            proxy_kinds,
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn clear(&self, partition: i32) {
        self.partitions.lock().await.remove(&partition);
    }

    /// Processes one raw sample. `mono_now_us` and `clock_now_us` are passed
    /// in rather than read from the clock directly, matching
    /// `UVEAggregator::Update`'s optional `ts` override used by tests.
    ///
    /// Returns the commit that must be issued (the previous epoch's retained
    /// message, if the epoch just rolled over) plus the proxy samples to
    /// emit, or `None` if the message was stale-by-offset and ignored.
    pub async fn update(
        &self,
        partition: i32,
        offset: i64,
        table: &str,
        key: &str,
        raw: u64,
        sample_ts_us: u64,
        mono_now_us: u64,
        clock_now_us: u64,
        commit_period_us: u64,
        staleness_us: u64,
    ) -> Option<(Option<(i32, i64)>, Vec<ProxyUveSample>)> {
        let mut partitions = self.partitions.lock().await;
        let state = partitions.entry(partition).or_default();

        if state.stored_offset >= 0 && offset <= state.stored_offset {
            info!(
                topic = %self.topic,
                partition,
                by = state.stored_offset - offset,
                "stale message by offset, ignoring"
            );
            return None;
        }
        state.stored_offset = offset;

        let new_epoch = mono_now_us / commit_period_us;
        let mut to_commit = None;
        if new_epoch != state.epoch {
            to_commit = state.last_of_epoch.take();
            state.epoch = new_epoch;
        }
        // Retain this message as the candidate "last of epoch" on every
        // accepted message, not just on rollover — otherwise a rollover has
        // nothing to commit for the epoch that just ended.
        state.last_of_epoch = Some((partition, offset));

        let age = clock_now_us.saturating_sub(sample_ts_us);
        if age > staleness_us {
            info!(
                topic = %self.topic,
                partition,
                age_secs = age / 1_000_000,
                "stale message by age, not proxied"
            );
            return Some((to_commit, Vec::new()));
        }

        let samples = self
            .proxy_kinds
            .iter()
            .map(|kind| ProxyUveSample {
                proxy_kind: *kind,
                topic: self.topic.clone(),
                table: table.to_string(),
                key: key.to_string(),
                raw,
                partition,
            })
            .collect();
        Some((to_commit, samples))
    }
}

struct RebalanceContext {
    states: Arc<BTreeMap<String, Arc<TopicAggregatorState>>>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        info!(?rebalance, "pre-rebalance");
        if let Rebalance::Revoke(partitions) = rebalance {
            let states = self.states.clone();
            let elements: Vec<(String, i32)> = partitions
                .elements()
                .iter()
                .map(|p| (p.topic().to_string(), p.partition()))
                .collect();
            tokio::spawn(async move {
                for (topic, partition) in elements {
                    if let Some(state) = states.get(&topic) {
                        state.clear(partition).await;
                    }
                }
            });
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        info!(?rebalance, "post-rebalance");
    }
}

type AggConsumer = StreamConsumer<RebalanceContext>;

pub struct AggregatorConsumer {
    consumer: AggConsumer,
    states: Arc<BTreeMap<String, Arc<TopicAggregatorState>>>,
}

impl AggregatorConsumer {
    pub fn new(
        brokers: &str,
        topics: Vec<Arc<TopicAggregatorState>>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for state in topics {
            map.insert(state.topic.clone(), state);
        }
        let states = Arc::new(map);
        let context = RebalanceContext {
            states: states.clone(),
        };
        let consumer: AggConsumer = ClientConfig::new()
            .set("group.id", "agg")
            .set("bootstrap.servers", brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create_with_context(context)
            .map_err(|e| {
                CollectorError::Configuration(format!("kafka consumer create failed: {e}"))
            })?;
        let topic_names: Vec<&str> = states.keys().map(String::as_str).collect();
        consumer
            .subscribe(&topic_names)
            .map_err(|e| CollectorError::Configuration(format!("subscribe failed: {e}")))?;
        Ok(Self { consumer, states })
    }

    /// Runs the `consume(timeout=1s)` loop (spec.md §4.7) until `stop_rx`
    /// fires; yields one `(samples, commit-needed)` batch per message.
    pub async fn run(
        &self,
        commit_period_us: u64,
        staleness_us: u64,
        mono_now: impl Fn() -> u64,
        clock_now: impl Fn() -> u64,
        mut on_samples: impl FnMut(Vec<ProxyUveSample>),
        mut stop_rx: tokio::sync::mpsc::Receiver<()>,
    ) -> Result<()> {
        loop {
            if stop_rx.try_recv().is_ok() {
                return Ok(());
            }
            let recv = timeout(Duration::from_secs(1), self.consumer.recv()).await;
            let msg = match recv {
                Ok(Ok(m)) => m,
                Ok(Err(e)) => {
                    error!(error = %e, "kafka consumer error");
                    continue;
                }
                Err(_) => continue, // 1s poll timeout, nothing to do
            };
            let Some(state) = self.states.get(msg.topic()) else {
                continue;
            };
            let Some(payload) = msg.payload() else {
                continue;
            };
            let parsed = parse_sample(payload, msg.key());
            let Some((raw, ts_us, table, key)) = parsed else {
                continue;
            };
            if let Some((to_commit, samples)) = state
                .update(
                    msg.partition(),
                    msg.offset(),
                    &table,
                    &key,
                    raw,
                    ts_us,
                    mono_now(),
                    clock_now(),
                    commit_period_us,
                    staleness_us,
                )
                .await
            {
                if let Some((partition, offset)) = to_commit {
                    let mut tpl = TopicPartitionList::new();
                    let _ = tpl.add_partition_offset(
                        msg.topic(),
                        partition,
                        Offset::Offset(offset + 1),
                    );
                    if let Err(e) = self.consumer.commit(&tpl, CommitMode::Sync) {
                        error!(error = %e, "aggregator offset commit failed");
                    }
                }
                if !samples.is_empty() {
                    on_samples(samples);
                }
            }
        }
    }
}

/// Parses the XML-ish `<Type timestamp="...">123</Type>` body into
/// `(raw_value, timestamp_us)`; `table`/`key` come from the Kafka record key
/// and are extracted separately by `parse_sample`.
fn parse_body(payload: &str) -> Option<(u64, u64)> {
    let ts_start = payload.find("timestamp=\"")? + "timestamp=\"".len();
    let ts_end = payload[ts_start..].find('"')? + ts_start;
    let ts: u64 = payload[ts_start..ts_end].parse().ok()?;
    let gt = payload.find('>')? + 1;
    let lt = payload[gt..].find('<')? + gt;
    let raw: u64 = payload[gt..lt].trim().parse().ok()?;
    Some((raw, ts))
}

/// Splits the Kafka record key `"<table>:<key>"` (per `uve_aggregator.cc`'s
/// `UVEAggregator::Update`) and combines it with the parsed body.
fn parse_sample(payload: &[u8], record_key: Option<&[u8]>) -> Option<(u64, u64, String, String)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (raw, ts) = parse_body(text)?;
    let (table, key) = match record_key.and_then(|k| std::str::from_utf8(k).ok()) {
        Some(k) => match k.split_once(':') {
            Some((table, key)) => (table.to_string(), key.to_string()),
            None => (k.to_string(), String::new()),
        },
        None => (String::new(), String::new()),
    };
    Some((raw, ts, table, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn epoch_commit_follows_scenario_four() {
        rt().block_on(async {
            let state = TopicAggregatorState::new("analytics-agg-sum", vec![ProxyKind::Sum]);
            let commit_period = 60_000_000u64; // 60s, matches spec.md §8 scenario 4

            let r0 = state
                .update(0, 1, "T", "k", 10, 0, 0, 0, commit_period, 60_000_000)
                .await
                .unwrap();
            assert!(r0.0.is_none());

            let r30 = state
                .update(0, 2, "T", "k", 20, 30_000_000, 30_000_000, 30_000_000, commit_period, 60_000_000)
                .await
                .unwrap();
            assert!(r30.0.is_none());

            // Out-of-order, smaller offset: ignored.
            let late = state
                .update(0, 1, "T", "k", 99, 29_000_000, 29_000_000, 29_000_000, commit_period, 60_000_000)
                .await;
            assert!(late.is_none());

            let r61 = state
                .update(0, 3, "T", "k", 30, 61_000_000, 61_000_000, 61_000_000, commit_period, 60_000_000)
                .await
                .unwrap();
            // The 30s message (partition 0, offset 2) should now commit.
            assert_eq!(r61.0, Some((0, 2)));
        });
    }

    #[test]
    fn stale_by_age_is_ignored_but_offset_still_advances() {
        rt().block_on(async {
            let state = TopicAggregatorState::new("analytics-agg-sum", vec![ProxyKind::Sum]);
            let result = state
                .update(0, 1, "T", "k", 10, 0, 1_000_000_000, 1_000_000_000, 60_000_000, 60_000_000)
                .await
                .unwrap();
            assert!(result.1.is_empty());
        });
    }

    #[test]
    fn parse_body_extracts_value_and_timestamp() {
        let body = r#"<AggProxySum timestamp="123456">42</AggProxySum>"#;
        let (raw, ts) = parse_body(body).unwrap();
        assert_eq!(raw, 42);
        assert_eq!(ts, 123456);
    }
}
