//! sFlow listener (C10). Grounded on `sflow_collector.cc`'s per-source-IP
//! `SFlowGenerator` fan-out and `sflow_generator.cc`'s `ProcessSFlowPacket`,
//! which pulls `sip`/`dip`/`sport`/`dport`/`protocol` out of a flow sample's
//! raw packet header record and the sampled interface index (`pifindex`) out
//! of the flow sample header itself.
//!
//! Only sFlow v5 flow samples (sample type 1) carrying a raw-packet-header
//! record (format 1) over Ethernet/IPv4 are decoded; counter samples and
//! anything else are skipped, matching the original's "only flow samples
//! feed `UnderlayFlowSampleInsert`" behavior.

use crate::flow::{insert_flow_samples, FlowSample};
use crate::udp_server::UdpServer;
use collector_store::writer::StoreWriter;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

const SFLOW_VERSION: u32 = 5;
const SAMPLE_TYPE_FLOW: u32 = 1;
const FLOW_RECORD_RAW_HEADER: u32 = 1;
const ETHERTYPE_IPV4: u16 = 0x0800;

/// Big-endian cursor over a byte slice; every read returns `None` on
/// underrun instead of panicking, so a truncated or malformed packet simply
/// yields no samples.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.take(4)?.try_into().ok()?))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Decodes one sFlow v5 datagram into its flow samples' raw-header-derived
/// `FlowSample`s. The agent address in the packet header is ignored in
/// favor of the UDP source address the caller already has.
fn parse_sflow_v5(data: &[u8]) -> Vec<FlowSample> {
    let mut r = Reader::new(data);
    let mut samples = Vec::new();

    let Some(version) = r.u32() else { return samples };
    if version != SFLOW_VERSION {
        return samples;
    }
    let Some(addr_type) = r.u32() else { return samples };
    let addr_len = if addr_type == 2 { 16 } else { 4 };
    if r.skip(addr_len).is_none() {
        return samples;
    }
    // sub_agent_id, sequence_number, uptime
    if r.skip(12).is_none() {
        return samples;
    }
    let Some(num_samples) = r.u32() else { return samples };

    for _ in 0..num_samples {
        let Some(sample_type) = r.u32() else { break };
        let Some(sample_length) = r.u32() else { break };
        let Some(sample_bytes) = r.take(sample_length as usize) else { break };
        if (sample_type & 0xfff) != SAMPLE_TYPE_FLOW {
            continue;
        }
        if let Some(sample) = parse_flow_sample(sample_bytes) {
            samples.push(sample);
        }
    }
    samples
}

fn parse_flow_sample(data: &[u8]) -> Option<FlowSample> {
    let mut r = Reader::new(data);
    r.u32()?; // sequence_number
    let source_id = r.u32()?;
    r.skip(12)?; // sampling_rate, sample_pool, drops
    let input = r.u32()?;
    r.u32()?; // output
    let flow_records_count = r.u32()?;

    let pifindex = if input != 0 { input } else { source_id & 0x00ff_ffff };

    for _ in 0..flow_records_count {
        let format = r.u32()?;
        let length = r.u32()?;
        let record = r.take(length as usize)?;
        if format == FLOW_RECORD_RAW_HEADER {
            if let Some(mut sample) = parse_raw_header_record(record) {
                sample.pifindex = pifindex;
                return Some(sample);
            }
        }
    }
    None
}

/// Raw-packet-header flow record: protocol/frame_length/stripped/header_length
/// followed by the captured header bytes, parsed here as Ethernet -> IPv4 ->
/// TCP/UDP.
fn parse_raw_header_record(data: &[u8]) -> Option<FlowSample> {
    let mut r = Reader::new(data);
    r.u32()?; // header_protocol
    r.u32()?; // frame_length
    r.u32()?; // stripped
    let header_length = r.u32()?;
    let header = r.take(header_length as usize)?;
    parse_ethernet_ipv4(header)
}

fn parse_ethernet_ipv4(header: &[u8]) -> Option<FlowSample> {
    if header.len() < 14 {
        return None;
    }
    let ethertype = u16::from_be_bytes([header[12], header[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &header[14..];
    if ip.len() < 20 {
        return None;
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    let protocol = ip[9];
    let sip = format!("{}.{}.{}.{}", ip[12], ip[13], ip[14], ip[15]);
    let dip = format!("{}.{}.{}.{}", ip[16], ip[17], ip[18], ip[19]);

    let (sport, dport) = if matches!(protocol, 6 | 17) && ip.len() >= ihl + 4 {
        let l4 = &ip[ihl..];
        (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        )
    } else {
        (0, 0)
    };

    Some(FlowSample {
        sip,
        dip,
        sport,
        dport,
        protocol,
        pifindex: 0,
        vlan: None,
    })
}

/// Per-source-IP generator fan-out, mirroring `SFlowCollector::GetSFlowGenerator`
/// — there's no per-generator task queue here (a tokio task already serializes
/// the listener loop), just the same "most recent activity per agent" bookkeeping.
pub struct SFlowCollector {
    writer: Arc<StoreWriter>,
    last_seen: Mutex<HashMap<String, u64>>,
}

impl SFlowCollector {
    pub fn new(writer: Arc<StoreWriter>) -> Self {
        Self {
            writer,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    async fn on_packet(&self, data: &[u8], from: SocketAddr, timestamp_us: u64) {
        let agent = from.ip().to_string();
        self.last_seen.lock().unwrap().insert(agent.clone(), timestamp_us);
        let samples = parse_sflow_v5(data);
        if samples.is_empty() {
            debug!(agent, "sFlow packet carried no decodable flow samples");
            return;
        }
        insert_flow_samples(&self.writer, &agent, timestamp_us, &samples).await;
    }

    pub async fn run(self: Arc<Self>, port: u16, now_us: impl Fn() -> u64 + Send + Sync + 'static) -> anyhow::Result<()> {
        let server = UdpServer::bind("sflow", port).await?;
        server
            .run(|data, from| {
                let this = self.clone();
                let data = data.to_vec();
                let ts = now_us();
                tokio::spawn(async move { this.on_packet(&data, from, ts).await });
                true
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        let mut eth = vec![0u8; 14];
        eth[12] = 0x08;
        eth[13] = 0x00;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6; // TCP
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let mut tcp = vec![0u8; 4];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        let mut header = eth;
        header.extend(ip);
        header.extend(tcp);

        let mut record = Vec::new();
        record.extend(0u32.to_be_bytes()); // header_protocol
        record.extend((header.len() as u32).to_be_bytes()); // frame_length
        record.extend(0u32.to_be_bytes()); // stripped
        record.extend((header.len() as u32).to_be_bytes()); // header_length
        record.extend(&header);

        let mut flow_sample = Vec::new();
        flow_sample.extend(1u32.to_be_bytes()); // sequence_number
        flow_sample.extend(0x0300_0007u32.to_be_bytes()); // source_id
        flow_sample.extend(0u32.to_be_bytes()); // sampling_rate
        flow_sample.extend(0u32.to_be_bytes()); // sample_pool
        flow_sample.extend(0u32.to_be_bytes()); // drops
        flow_sample.extend(7u32.to_be_bytes()); // input
        flow_sample.extend(0u32.to_be_bytes()); // output
        flow_sample.extend(1u32.to_be_bytes()); // flow_records_count
        flow_sample.extend(FLOW_RECORD_RAW_HEADER.to_be_bytes());
        flow_sample.extend((record.len() as u32).to_be_bytes());
        flow_sample.extend(&record);

        let mut packet = Vec::new();
        packet.extend(SFLOW_VERSION.to_be_bytes());
        packet.extend(1u32.to_be_bytes()); // addr_type = IPv4
        packet.extend([192, 168, 0, 1]);
        packet.extend(0u32.to_be_bytes()); // sub_agent_id
        packet.extend(0u32.to_be_bytes()); // sequence_number
        packet.extend(0u32.to_be_bytes()); // uptime
        packet.extend(1u32.to_be_bytes()); // num_samples
        packet.extend(SAMPLE_TYPE_FLOW.to_be_bytes());
        packet.extend((flow_sample.len() as u32).to_be_bytes());
        packet.extend(&flow_sample);
        packet
    }

    #[test]
    fn parses_flow_sample_sip_dip_ports_and_pifindex() {
        let samples = parse_sflow_v5(&sample_packet());
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.sip, "10.0.0.1");
        assert_eq!(s.dip, "10.0.0.2");
        assert_eq!(s.sport, 1234);
        assert_eq!(s.dport, 80);
        assert_eq!(s.protocol, 6);
        assert_eq!(s.pifindex, 7);
    }

    #[test]
    fn truncated_packet_yields_no_samples() {
        let samples = parse_sflow_v5(&[5, 0, 0, 0]);
        assert!(samples.is_empty());
    }
}
