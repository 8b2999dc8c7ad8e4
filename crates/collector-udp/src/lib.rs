//! # collector-udp
//!
//! UDP ingest (C10): sFlow and IPFIX underlay flow-sample decoding, both
//! feeding `StoreWriter::flow_sample_insert` directly, plus a structured
//! syslog listener that rides the ordinary session receive path (C4) as a
//! `Syslog`-typed `SessionMessage`.

pub mod flow;
pub mod ipfix;
pub mod sflow;
pub mod syslog;
pub mod udp_server;

pub use ipfix::IpfixCollector;
pub use sflow::SFlowCollector;
pub use syslog::StructuredSyslogListener;
