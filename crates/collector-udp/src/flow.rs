//! Shared flow-sample shape and store write, common to the sFlow and IPFIX
//! listeners. Grounded on `uflow_types.h`'s `UFlowSample` (`sip`, `dip`,
//! `sport`, `dport`, `protocol`, `pifindex`) — both collectors build one of
//! these per decoded flow record and hand it to the same insert path.

use collector_core::model::{AttribMap, Var};
use collector_store::writer::StoreWriter;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowSample {
    pub sip: String,
    pub dip: String,
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    pub pifindex: u32,
    pub vlan: Option<u32>,
}

impl FlowSample {
    fn bare_key(&self, agent: &str) -> String {
        format!(
            "{agent}:{}:{}:{}:{}:{}",
            self.sip, self.dip, self.protocol, self.sport, self.dport
        )
    }

    fn attribs(&self) -> AttribMap {
        let mut attrs = AttribMap::new();
        attrs.insert("sip".into(), Var::Str(self.sip.clone()));
        attrs.insert("dip".into(), Var::Str(self.dip.clone()));
        attrs.insert("sport".into(), Var::U64(self.sport as u64));
        attrs.insert("dport".into(), Var::U64(self.dport as u64));
        attrs.insert("protocol".into(), Var::U64(self.protocol as u64));
        attrs.insert("pifindex".into(), Var::U64(self.pifindex as u64));
        if let Some(vlan) = self.vlan {
            attrs.insert("vlan".into(), Var::U64(vlan as u64));
        }
        attrs
    }
}

/// `UnderlayFlowSampleInsert`: one `flow_sample_insert` per decoded sample,
/// keyed off the reporting agent (the sFlow/IPFIX exporter's source IP).
pub async fn insert_flow_samples(writer: &Arc<StoreWriter>, agent: &str, timestamp_us: u64, samples: &[FlowSample]) {
    for sample in samples {
        let bare_key = sample.bare_key(agent);
        let attribs = sample.attribs();
        if let Err(e) = writer.flow_sample_insert(timestamp_us, &bare_key, &attribs).await {
            warn!(error = %e, agent, bare_key, "underlay flow sample insert failed");
        }
    }
}
