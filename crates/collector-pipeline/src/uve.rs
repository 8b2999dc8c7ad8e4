//! UVE publisher (C6): fans a `UVEUpdate`/`UVEDelete` call out to the
//! operational key/value store (C7) and the pub/sub producer (C8), per
//! spec.md §4.5's "two parallel fan-outs".
//!
//! Grounded on `OpServerProxy.h`'s `UVEUpdate`/`UVEDelete` surface and
//! `kafka_processor.cc`'s `KafkaPub` partition/key construction. The
//! `UVEAlarms` asymmetric-payload rule and the "double-publish on UVE and
//! Aggregate topics is not suppressed" behavior are the §9 Open Questions
//! resolved in DESIGN.md — both preserved here exactly as decided there.

use collector_bus::opstore::OpStoreClient;
use collector_bus::producer::BusProducer;
use collector_core::model::GeneratorId;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Everything a single `UVEUpdate` call needs, mirroring
/// `OpServerProxy::UVEUpdate`'s argument list from `OpServerProxy.h`.
pub struct UveUpdateArgs<'a> {
    pub struct_type: &'a str,
    pub attr_name: &'a str,
    pub generator: &'a GeneratorId,
    pub uve_key: &'a str,
    pub payload: &'a str,
    pub aggtype: Option<&'a str>,
    pub collector_endpoint: &'a str,
}

pub struct UvePublisher {
    opstore: Arc<OpStoreClient>,
    producer: Arc<BusProducer>,
    part_base: u32,
    part_count: u32,
}

impl UvePublisher {
    pub fn new(
        opstore: Arc<OpStoreClient>,
        producer: Arc<BusProducer>,
        part_base: u32,
        part_count: u32,
    ) -> Self {
        Self {
            opstore,
            producer,
            part_base,
            part_count,
        }
    }

    /// Builds the raw UVE topic's JSON payload. Only `UVEAlarms` carries the
    /// full attribute map; every other struct type gets `{}` — the
    /// operational-store write above is authoritative for those (§9 Open
    /// Question #1, preserved).
    fn raw_topic_payload(struct_type: &str, attr_name: &str, payload: &str) -> String {
        if struct_type == "UVEAlarms" {
            json!({ attr_name: payload }).to_string()
        } else {
            "{}".to_string()
        }
    }

    /// `UVEUpdate`: writes the attribute to the operational store, then
    /// publishes to the raw UVE topic and, if this `(struct_type, attr)`
    /// matches a configured aggregation stream, to the aggregation topic too
    /// — intentionally not deduplicated against the raw-topic publish (§9
    /// Open Question #2).
    pub async fn uve_update(&self, args: UveUpdateArgs<'_>) -> bool {
        let opstore_ok = match self.opstore.uve_update(args.uve_key, args.attr_name, args.payload).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, uve_key = args.uve_key, "UVEUpdate operational-store write failed");
                false
            }
        };

        let raw_payload = Self::raw_topic_payload(args.struct_type, args.attr_name, args.payload);
        if let Err(e) = self
            .producer
            .publish_uve(
                self.part_base,
                self.part_count,
                args.uve_key,
                args.struct_type,
                &args.generator.display_name(),
                args.collector_endpoint,
                &raw_payload,
            )
            .await
        {
            warn!(error = %e, uve_key = args.uve_key, "raw UVE publish failed");
        }

        let streams = self
            .producer
            .config()
            .aggregation_streams_for(args.struct_type, args.attr_name)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        for stream in streams {
            if let Err(e) = self
                .producer
                .publish_aggregation(&stream, args.uve_key, args.payload)
                .await
            {
                warn!(error = %e, stream, "aggregation publish failed");
            }
        }

        opstore_ok
    }

    /// `UVEDelete`: operational-store attribute removal plus an empty-value
    /// (tombstone) publish to the raw UVE topic — no aggregation-topic
    /// publish on delete.
    pub async fn uve_delete(
        &self,
        struct_type: &str,
        generator: &GeneratorId,
        uve_key: &str,
        collector_endpoint: &str,
    ) -> bool {
        let opstore_ok = match self.opstore.uve_delete_attr(uve_key, struct_type).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, uve_key, "UVEDelete operational-store write failed");
                false
            }
        };
        if let Err(e) = self
            .producer
            .publish_uve(
                self.part_base,
                self.part_count,
                uve_key,
                struct_type,
                &generator.display_name(),
                collector_endpoint,
                "",
            )
            .await
        {
            warn!(error = %e, uve_key, "UVE delete tombstone publish failed");
        }
        opstore_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_topic_payload_carries_full_map_only_for_uve_alarms() {
        let alarms = UvePublisher::raw_topic_payload("UVEAlarms", "alarms", "the-payload");
        assert_eq!(alarms, r#"{"alarms":"the-payload"}"#);

        let other = UvePublisher::raw_topic_payload("UveVirtualNetworkAgent", "in_tpkts", "42");
        assert_eq!(other, "{}");
    }
}
