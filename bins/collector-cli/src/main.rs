//! Process wiring for the telemetry collector: loads configuration, brings
//! up the store writer, operational-store client, pub/sub producer, UVE
//! publisher, generator registry, session receive path, aggregation
//! consumer, and the UDP ingest listeners, then serves an introspection
//! endpoint until interrupted.
//!
//! Grounded on `bins/rde-cli/src/main.rs`'s `clap`/`CancellationToken`/
//! `tokio::select!` process-wiring pattern.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use collector_bus::opstore::{OpStoreClient, OpStoreConfig};
use collector_bus::producer::{BusProducer, BusProducerConfig};
use collector_bus::{AggregatorConsumer, ProxyKind, ProxyUveSample, TopicAggregatorState};
use collector_core::model::{AttribMap, Var};
use collector_core::CollectorConfig;
use collector_pipeline::uve::UvePublisher;
use collector_pipeline::{GeneratorRegistry, ReceivePath};
use collector_store::connstate::{ConnectionState, PeerKind, PeerRole, Status};
use collector_store::scylla_store::ScyllaStore;
use collector_store::{ColumnStore, StoreWriter};
use collector_udp::{IpfixCollector, SFlowCollector, StructuredSyslogListener};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "collector-cli")]
#[command(about = "Telemetry collector core: session receive path, store writer, and UVE fan-out")]
struct Args {
    /// YAML configuration file (see `CollectorConfig`).
    #[arg(short, long)]
    config: PathBuf,

    /// Wide-column keyspace to create/use.
    #[arg(long, default_value = "collector")]
    keyspace: String,

    /// Run `CREATE TABLE` DDL on startup. Set once on a fresh cluster.
    #[arg(long, default_value_t = false)]
    bring_up: bool,

    /// This collector's own endpoint, stamped onto published UVEs.
    #[arg(long, default_value = "localhost:8089")]
    collector_endpoint: String,

    /// Address the introspection HTTP endpoint listens on.
    #[arg(long, default_value = "127.0.0.1:8089")]
    status_addr: SocketAddr,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Maps an aggregation stream name to the proxy kind it represents. Unknown
/// stream names fall back to `Sum`, matching `uve_aggregator.h`'s default
/// `conf_` entry when a stream has no anomaly suffix.
fn proxy_kind_for_stream(stream: &str) -> ProxyKind {
    if stream.contains("Anomaly") || stream.contains("EWM") {
        ProxyKind::EwmaAnomaly
    } else {
        ProxyKind::Sum
    }
}

#[derive(Serialize)]
struct PeerStateView {
    kind: PeerKind,
    role: PeerRole,
    endpoint: String,
    status: Status,
    message: String,
    timestamp_us: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    peers: Vec<PeerStateView>,
    dropped_messages: BTreeMap<String, u64>,
}

struct AppState {
    conn_state: Arc<ConnectionState>,
    writer: Arc<StoreWriter>,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let peers = state
        .conn_state
        .snapshot()
        .into_iter()
        .map(|((kind, role, endpoint), peer)| PeerStateView {
            kind,
            role,
            endpoint,
            status: peer.status,
            message: peer.message,
            timestamp_us: peer.timestamp_us,
        })
        .collect();
    Json(StatusResponse {
        peers,
        dropped_messages: state.writer.dropped_msg_stats(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = {
        let contents = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        CollectorConfig::from_yaml(&contents)?
    };

    let conn_state = Arc::new(ConnectionState::new());

    conn_state.update(
        PeerKind::Cassandra,
        PeerRole::To,
        &config.cassandra_endpoints.join(","),
        Status::Init,
        "connecting",
    );
    let store = ScyllaStore::connect(
        &config.cassandra_endpoints,
        config.cassandra_user.as_deref(),
        config.cassandra_password.as_deref(),
        &args.keyspace,
    )
    .await
    .context("scylla connect failed")?;
    conn_state.update(
        PeerKind::Cassandra,
        PeerRole::To,
        &config.cassandra_endpoints.join(","),
        Status::Up,
        "ready",
    );
    let store: Arc<dyn ColumnStore> = Arc::new(store);
    let writer = Arc::new(StoreWriter::new(store, config.clone()));
    writer.init(args.bring_up).await.context("store init failed")?;

    let opstore = Arc::new(OpStoreClient::new(
        OpStoreConfig {
            endpoint: config.redis_uve_endpoint.clone(),
            password: config.redis_password.clone(),
        },
        conn_state.clone(),
    ));
    if let Err(e) = opstore.connect_to().await {
        warn!(error = %e, "operational store connect failed at startup, will retry on demand");
    }

    let producer_config = BusProducerConfig {
        brokers: config.brokers.clone(),
        kafka_prefix: config.kafka_prefix.clone(),
        partitions: config.partitions,
        aggconf: config.aggconf.clone(),
    };
    let producer = Arc::new(BusProducer::new(producer_config, conn_state.clone())?);
    let uve = Arc::new(UvePublisher::new(opstore.clone(), producer.clone(), 0, config.partitions));
    let registry = Arc::new(GeneratorRegistry::new(opstore.clone()));
    let receive = Arc::new(ReceivePath::new(
        writer.clone(),
        uve.clone(),
        opstore.clone(),
        registry.clone(),
        args.collector_endpoint.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut handles: Vec<tokio::task::JoinHandle<anyhow::Result<()>>> = Vec::new();

    if let Some(port) = config.sflow_port {
        let collector = Arc::new(SFlowCollector::new(writer.clone()));
        info!(port, "sflow listener starting");
        handles.push(tokio::spawn(async move { collector.run(port, now_us).await }));
    }
    if let Some(port) = config.ipfix_port {
        let collector = Arc::new(IpfixCollector::new(writer.clone()));
        info!(port, "ipfix listener starting");
        handles.push(tokio::spawn(async move { collector.run(port, now_us).await }));
    }
    if let Some(port) = config.structured_syslog_port {
        let listener = Arc::new(StructuredSyslogListener::new(receive.clone()));
        info!(port, "structured syslog listener starting");
        handles.push(tokio::spawn(async move { listener.run(port, now_us).await }));
    }

    // Aggregation consumer: one `TopicAggregatorState` per distinct
    // configured stream name.
    let mut stream_names: Vec<String> = config
        .aggconf
        .values()
        .flatten()
        .cloned()
        .collect();
    stream_names.sort();
    stream_names.dedup();
    let (agg_stop_tx, agg_stop_rx) = mpsc::channel(1);
    if !stream_names.is_empty() {
        let topics: Vec<Arc<TopicAggregatorState>> = stream_names
            .iter()
            .map(|stream| {
                Arc::new(TopicAggregatorState::new(
                    producer.config().agg_topic(stream),
                    vec![proxy_kind_for_stream(stream)],
                ))
            })
            .collect();
        let aggregator = AggregatorConsumer::new(&config.brokers, topics)
            .context("aggregation consumer create failed")?;
        let agg_writer = writer.clone();
        let commit_period_us = config.aggregator_commit_period_secs * 1_000_000;
        let staleness_us = config.aggregator_staleness_secs * 1_000_000;
        handles.push(tokio::spawn(async move {
            aggregator
                .run(
                    commit_period_us,
                    staleness_us,
                    now_us,
                    now_us,
                    |samples: Vec<ProxyUveSample>| {
                        for sample in samples {
                            let agg_writer = agg_writer.clone();
                            let mut attribs = AttribMap::new();
                            attribs.insert("key".into(), Var::Str(sample.key.clone()));
                            attribs.insert("raw".into(), Var::U64(sample.raw));
                            attribs.insert("partition".into(), Var::U64(sample.partition as u64));
                            tokio::spawn(async move {
                                if let Err(e) = agg_writer
                                    .stat_table_insert(now_us(), &sample.table, &format!("{:?}", sample.proxy_kind), &attribs)
                                    .await
                                {
                                    warn!(error = %e, table = sample.table, "proxy UVE stat insert failed");
                                }
                            });
                        }
                    },
                    agg_stop_rx,
                )
                .await
                .map_err(anyhow::Error::from)
        }));
    }

    let app_state = Arc::new(AppState {
        conn_state: conn_state.clone(),
        writer: writer.clone(),
    });
    let app = Router::new()
        .route("/status", get(status_handler))
        .with_state(app_state);
    let listener = tokio::net::TcpListener::bind(args.status_addr)
        .await
        .with_context(|| format!("binding status endpoint on {}", args.status_addr))?;
    info!(addr = %args.status_addr, "status endpoint listening");
    let http_cancel = cancel.child_token();
    handles.push(tokio::spawn(async move {
        let serve = axum::serve(listener, app);
        tokio::select! {
            result = serve => result.map_err(anyhow::Error::from),
            _ = http_cancel.cancelled() => Ok(()),
        }
    }));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            cancel.cancel();
            let _ = agg_stop_tx.send(()).await;
        }
        _ = async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        } => {}
    }

    Ok(())
}
