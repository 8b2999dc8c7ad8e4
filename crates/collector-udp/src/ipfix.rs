//! IPFIX listener (C10). Grounded on `ipfix_collector.cc`'s `uflowfields_`
//! information-element name table and its `ExportDrecord` callback, which
//! walks a decoded data record's fields and copies the ones present in that
//! table onto a `UFlowSample`. Template management here plays the role
//! `ipfix_col`'s `ExportTrecord` callback and its internal template cache
//! played in the original — templates are learned per exporter and data sets
//! referencing an unknown template are dropped, same as an unrecognised
//! `tid` upstream would be.

use crate::flow::{insert_flow_samples, FlowSample};
use crate::udp_server::UdpServer;
use collector_store::writer::StoreWriter;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Information-element numbers used by `uflowfields_`'s mapped subset
/// (RFC 7012's IANA-assigned IDs).
mod ie {
    pub const PROTOCOL_IDENTIFIER: u16 = 4;
    pub const SOURCE_TRANSPORT_PORT: u16 = 7;
    pub const SOURCE_IPV4_ADDRESS: u16 = 8;
    pub const INGRESS_INTERFACE: u16 = 10;
    pub const DESTINATION_TRANSPORT_PORT: u16 = 11;
    pub const DESTINATION_IPV4_ADDRESS: u16 = 12;
    pub const VLAN_ID: u16 = 58;
}

const TEMPLATE_SET_ID: u16 = 2;
const MIN_DATA_SET_ID: u16 = 256;

#[derive(Debug, Clone)]
struct FieldSpec {
    id: u16,
    length: u16,
}

type Template = Vec<FieldSpec>;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes(self.take(2)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.take(4)?.try_into().ok()?))
    }
}

/// Decodes one template set's records into `template_id -> [FieldSpec]`.
/// Option templates (scope fields) are skipped — the mapped fields are never
/// scope fields in practice.
fn parse_template_set(data: &[u8]) -> HashMap<u16, Template> {
    let mut templates = HashMap::new();
    let mut r = Reader::new(data);
    while r.remaining() >= 4 {
        let Some(template_id) = r.u16() else { break };
        let Some(field_count) = r.u16() else { break };
        let mut fields = Vec::with_capacity(field_count as usize);
        let mut ok = true;
        for _ in 0..field_count {
            let Some(id) = r.u16() else { ok = false; break };
            let Some(length) = r.u16() else { ok = false; break };
            if id & 0x8000 != 0 {
                // Enterprise-specific IE: skip the enterprise number, never
                // matched by `uflowfields_`'s IANA-only table.
                if r.u32().is_none() {
                    ok = false;
                    break;
                }
            }
            fields.push(FieldSpec {
                id: id & 0x7fff,
                length,
            });
        }
        if !ok {
            break;
        }
        templates.insert(template_id, fields);
    }
    templates
}

fn decode_field(spec: &FieldSpec, raw: &[u8], sample: &mut FlowSample) {
    match spec.id {
        ie::PROTOCOL_IDENTIFIER if raw.len() == 1 => sample.protocol = raw[0],
        ie::SOURCE_TRANSPORT_PORT if raw.len() == 2 => {
            sample.sport = u16::from_be_bytes([raw[0], raw[1]])
        }
        ie::DESTINATION_TRANSPORT_PORT if raw.len() == 2 => {
            sample.dport = u16::from_be_bytes([raw[0], raw[1]])
        }
        ie::SOURCE_IPV4_ADDRESS if raw.len() == 4 => {
            sample.sip = format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3])
        }
        ie::DESTINATION_IPV4_ADDRESS if raw.len() == 4 => {
            sample.dip = format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3])
        }
        ie::INGRESS_INTERFACE if raw.len() == 4 => {
            sample.pifindex = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
        }
        ie::VLAN_ID => {
            let mut padded = [0u8; 4];
            padded[4 - raw.len()..].copy_from_slice(raw);
            sample.vlan = Some(u32::from_be_bytes(padded));
        }
        _ => {}
    }
}

fn parse_data_set(template: &Template, data: &[u8]) -> Vec<FlowSample> {
    let mut samples = Vec::new();
    let mut r = Reader::new(data);
    loop {
        let mut sample = FlowSample::default();
        let mut decoded_any = false;
        for spec in template {
            let Some(raw) = r.take(spec.length as usize) else {
                return samples;
            };
            decode_field(spec, raw, &mut sample);
            decoded_any = true;
        }
        if !decoded_any {
            break;
        }
        samples.push(sample);
        if r.remaining() < template.iter().map(|f| f.length as usize).sum::<usize>().max(1) {
            break;
        }
    }
    samples
}

/// Parses one IPFIX message, updating `templates` as template sets are seen
/// and returning every `FlowSample` decodable against an already-known
/// template. Data sets referencing a template this exporter hasn't sent yet
/// are silently dropped, matching `ipfix_col`'s behavior for an unrecognised
/// template id.
fn parse_message(data: &[u8], templates: &mut HashMap<u16, Template>) -> Vec<FlowSample> {
    let mut r = Reader::new(data);
    let Some(_version) = r.u16() else { return Vec::new() };
    let Some(length) = r.u16() else { return Vec::new() };
    if r.u32().is_none() || r.u32().is_none() || r.u32().is_none() {
        return Vec::new();
    }
    let body_len = (length as usize).saturating_sub(16);
    let Some(body) = r.take(body_len.min(r.remaining())) else {
        return Vec::new();
    };

    let mut samples = Vec::new();
    let mut br = Reader::new(body);
    while br.remaining() >= 4 {
        let Some(set_id) = br.u16() else { break };
        let Some(set_length) = br.u16() else { break };
        let payload_len = (set_length as usize).saturating_sub(4);
        let Some(payload) = br.take(payload_len) else { break };
        if set_id == TEMPLATE_SET_ID {
            templates.extend(parse_template_set(payload));
        } else if set_id >= MIN_DATA_SET_ID {
            if let Some(template) = templates.get(&set_id) {
                samples.extend(parse_data_set(template, payload));
            }
        }
    }
    samples
}

/// Per-exporter template cache plus the store writer, mirroring
/// `IpfixCollector`'s single `colinfo_` template table (here kept per source
/// address instead of globally, since nothing else identifies templates
/// across exporters).
pub struct IpfixCollector {
    writer: Arc<StoreWriter>,
    templates: Mutex<HashMap<IpAddr, HashMap<u16, Template>>>,
}

impl IpfixCollector {
    pub fn new(writer: Arc<StoreWriter>) -> Self {
        Self {
            writer,
            templates: Mutex::new(HashMap::new()),
        }
    }

    async fn on_packet(&self, data: &[u8], exporter: IpAddr, timestamp_us: u64) {
        let samples = {
            let mut templates = self.templates.lock().unwrap();
            let per_exporter = templates.entry(exporter).or_default();
            parse_message(data, per_exporter)
        };
        if samples.is_empty() {
            debug!(%exporter, "IPFIX packet carried no decodable data records");
            return;
        }
        insert_flow_samples(&self.writer, &exporter.to_string(), timestamp_us, &samples).await;
    }

    pub async fn run(self: Arc<Self>, port: u16, now_us: impl Fn() -> u64 + Send + Sync + 'static) -> anyhow::Result<()> {
        let server = UdpServer::bind("ipfix", port).await?;
        server
            .run(|data, from| {
                let this = self.clone();
                let data = data.to_vec();
                let ts = now_us();
                tokio::spawn(async move { this.on_packet(&data, from.ip(), ts).await });
                true
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_set() -> Vec<u8> {
        let mut set = Vec::new();
        set.extend(300u16.to_be_bytes()); // template_id
        set.extend(5u16.to_be_bytes()); // field_count
        for (id, len) in [
            (ie::PROTOCOL_IDENTIFIER, 1u16),
            (ie::SOURCE_TRANSPORT_PORT, 2),
            (ie::DESTINATION_TRANSPORT_PORT, 2),
            (ie::SOURCE_IPV4_ADDRESS, 4),
            (ie::DESTINATION_IPV4_ADDRESS, 4),
        ] {
            set.extend(id.to_be_bytes());
            set.extend(len.to_be_bytes());
        }
        set
    }

    fn data_set() -> Vec<u8> {
        let mut set = Vec::new();
        set.push(6); // protocol = TCP
        set.extend(1234u16.to_be_bytes());
        set.extend(80u16.to_be_bytes());
        set.extend([10, 0, 0, 1]);
        set.extend([10, 0, 0, 2]);
        set
    }

    fn wrap_set(set_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut set = Vec::new();
        set.extend(set_id.to_be_bytes());
        set.extend(((payload.len() + 4) as u16).to_be_bytes());
        set.extend(payload);
        set
    }

    fn message(sets: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend(10u16.to_be_bytes()); // version
        msg.extend(((16 + sets.len()) as u16).to_be_bytes()); // length
        msg.extend(0u32.to_be_bytes()); // export_time
        msg.extend(0u32.to_be_bytes()); // sequence
        msg.extend(0u32.to_be_bytes()); // odid
        msg.extend(sets);
        msg
    }

    #[test]
    fn template_then_data_set_decodes_flow_sample() {
        let mut templates = HashMap::new();
        let tmpl_msg = message(&wrap_set(TEMPLATE_SET_ID, &template_set()));
        assert!(parse_message(&tmpl_msg, &mut templates).is_empty());
        assert!(templates.contains_key(&300));

        let data_msg = message(&wrap_set(300, &data_set()));
        let samples = parse_message(&data_msg, &mut templates);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].protocol, 6);
        assert_eq!(samples[0].sport, 1234);
        assert_eq!(samples[0].dport, 80);
        assert_eq!(samples[0].sip, "10.0.0.1");
        assert_eq!(samples[0].dip, "10.0.0.2");
    }

    #[test]
    fn data_set_for_unknown_template_is_dropped() {
        let mut templates = HashMap::new();
        let data_msg = message(&wrap_set(301, &data_set()));
        assert!(parse_message(&data_msg, &mut templates).is_empty());
    }
}
