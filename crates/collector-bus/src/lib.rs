//! # collector-bus
//!
//! The message-bus side of the collector: the operational key/value store
//! client (C7, `opstore`), the pub/sub producer publishing raw UVE and
//! aggregation records (C8, `producer`), and the aggregation consumer that
//! merges samples per commit epoch and republishes proxy UVEs (C9,
//! `aggregator`).

pub mod aggregator;
pub mod opstore;
pub mod producer;

pub use aggregator::{AggregatorConsumer, ProxyKind, ProxyUveSample, TopicAggregatorState};
pub use opstore::{AnalyticsNotification, OpStoreClient, OpStoreConfig};
pub use producer::{BusProducer, BusProducerConfig};
