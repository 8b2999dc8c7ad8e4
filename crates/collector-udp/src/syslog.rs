//! Structured syslog listener (C10, [ADD] per the expanded spec).
//!
//! Grounded on `structured_syslog_collector.cc`, which is a thin wrapper
//! delegating to an external structured-syslog server and binding
//! `DbHandler::StatTableInsert` straight onto its parsed output — no new
//! storage or UVE semantics of its own. This module plays the same role: it
//! parses RFC 5424-ish structured syslog (`<PRI>VERSION TIMESTAMP HOST
//! APP-NAME PROCID MSGID [id key="val" ...] MSG`) and hands the result into
//! the collector as a `Syslog`-typed `SessionMessage`, so it rides the exact
//! same classifier/writer/UVE path (C4/C5) a session-protocol message would.

use crate::udp_server::UdpServer;
use collector_core::model::{GeneratorId, Hints, MessageNode, SandeshType, SessionHeader, SessionMessage, Severity};
use collector_pipeline::ReceivePath;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSyslog {
    pub severity: Severity,
    pub hostname: String,
    pub app_name: String,
    pub msgid: String,
    pub structured_data: Vec<(String, BTreeMap<String, String>)>,
    pub message: String,
}

fn severity_from_pri(pri: u8) -> Severity {
    match pri & 0x07 {
        0 | 1 | 2 => Severity::Critical,
        3 => Severity::Error,
        4 => Severity::Warn,
        5 => Severity::Notice,
        6 => Severity::Info,
        _ => Severity::Debug,
    }
}

/// Parses one `[id key="val" key2="val2"]`-style structured-data block,
/// returning the id and its key/value pairs, plus how much of the input it
/// consumed.
fn parse_sd_element(input: &str) -> Option<((String, BTreeMap<String, String>), usize)> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'[') {
        return None;
    }
    let close = input.find(']')?;
    let inner = &input[1..close];
    let mut parts = inner.splitn(2, ' ');
    let id = parts.next()?.to_string();
    let mut params = BTreeMap::new();
    if let Some(rest) = parts.next() {
        let mut chars = rest.char_indices().peekable();
        while let Some((start, _)) = chars.peek().copied() {
            let key_end = rest[start..].find('=').map(|i| start + i)?;
            let key = rest[start..key_end].trim().to_string();
            if key.is_empty() {
                break;
            }
            let after_eq = &rest[key_end + 1..];
            let value_start = after_eq.find('"').map(|i| key_end + 1 + i + 1)?;
            let value_end = rest[value_start..].find('"').map(|i| value_start + i)?;
            let value = rest[value_start..value_end].to_string();
            params.insert(key, value);
            let next_pos = value_end + 1;
            while chars.peek().map(|(i, _)| *i < next_pos).unwrap_or(false) {
                chars.next();
            }
            if next_pos >= rest.len() {
                break;
            }
        }
    }
    Some(((id, params), close + 1))
}

/// Parses the full `[id ...][id2 ...]- MSG` structured-data-plus-message
/// tail that follows MSGID in an RFC 5424 line.
fn parse_sd_and_message(mut rest: &str) -> (Vec<(String, BTreeMap<String, String>)>, String) {
    let mut elements = Vec::new();
    rest = rest.trim_start();
    if let Some(stripped) = rest.strip_prefix('-') {
        return (elements, stripped.trim_start().to_string());
    }
    while rest.starts_with('[') {
        match parse_sd_element(rest) {
            Some((element, consumed)) => {
                elements.push(element);
                rest = &rest[consumed..];
            }
            None => break,
        }
    }
    (elements, rest.trim_start().to_string())
}

/// Parses one structured syslog line. Returns `None` for anything that
/// doesn't even have a `<PRI>` prefix — malformed beyond that point degrades
/// gracefully (empty fields) rather than rejecting the whole message.
pub fn parse_structured_syslog(line: &str) -> Option<ParsedSyslog> {
    let line = line.trim();
    if !line.starts_with('<') {
        return None;
    }
    let pri_end = line.find('>')?;
    let pri: u8 = line[1..pri_end].parse().ok()?;
    let rest = &line[pri_end + 1..];

    let mut fields = rest.splitn(6, ' ');
    let _version = fields.next().unwrap_or_default();
    let _timestamp = fields.next().unwrap_or_default();
    let hostname = fields.next().unwrap_or_default().to_string();
    let app_name = fields.next().unwrap_or_default().to_string();
    let _procid = fields.next().unwrap_or_default();
    let tail = fields.next().unwrap_or_default();

    let mut tail_fields = tail.splitn(2, ' ');
    let msgid = tail_fields.next().unwrap_or_default().to_string();
    let (structured_data, message) = tail_fields
        .next()
        .map(parse_sd_and_message)
        .unwrap_or_default();

    Some(ParsedSyslog {
        severity: severity_from_pri(pri),
        hostname,
        app_name,
        msgid,
        structured_data,
        message,
    })
}

fn to_session_message(parsed: &ParsedSyslog, timestamp_us: u64, sequence_num: u64) -> SessionMessage {
    let mut body = MessageNode::new("StructuredSyslog").with_text(parsed.message.clone());
    for (id, params) in &parsed.structured_data {
        let mut node = MessageNode::new(id.clone());
        for (key, value) in params {
            node = node.with_child(MessageNode::new(key.clone()).with_text(value.clone()));
        }
        body = body.with_child(node);
    }

    let header = SessionHeader {
        source: parsed.hostname.clone(),
        module: parsed.app_name.clone(),
        instance_id: "0".into(),
        node_type: "StructuredSyslog".into(),
        category: parsed.msgid.clone(),
        severity: parsed.severity,
        sandesh_type: SandeshType::Syslog,
        timestamp: timestamp_us,
        sequence_num,
        pid: None,
        ip_address: None,
        hints: Hints::default(),
    };

    SessionMessage {
        header,
        body,
        unm: format!("syslog-{sequence_num}"),
    }
}

/// UDP listener that parses each datagram as one structured syslog line and
/// dispatches it through the session receive path exactly like any other
/// `SessionMessage`.
pub struct StructuredSyslogListener {
    receive: Arc<ReceivePath>,
    sequence: AtomicU64,
}

impl StructuredSyslogListener {
    pub fn new(receive: Arc<ReceivePath>) -> Self {
        Self {
            receive,
            sequence: AtomicU64::new(0),
        }
    }

    async fn on_packet(&self, data: &[u8], from: SocketAddr, timestamp_us: u64) {
        let Ok(line) = std::str::from_utf8(data) else {
            debug!(%from, "structured syslog packet was not valid utf-8");
            return;
        };
        let Some(parsed) = parse_structured_syslog(line) else {
            debug!(%from, "structured syslog packet missing <PRI> prefix");
            return;
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let msg = to_session_message(&parsed, timestamp_us, seq);
        let generator = GeneratorId::new(
            msg.header.source.clone(),
            msg.header.module.clone(),
            "StructuredSyslog",
            "0",
        );
        self.receive.dispatch(&generator, &msg, false).await;
    }

    pub async fn run(self: Arc<Self>, port: u16, now_us: impl Fn() -> u64 + Send + Sync + 'static) -> anyhow::Result<()> {
        let server = UdpServer::bind("structured-syslog", port).await?;
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

    const LINE: &str = r#"<134>1 2026-07-28T00:00:00Z router1 appflow - APPTRACK [apptrack id="1" app="ssh"] session started"#;

    #[test]
    fn parses_pri_hostname_app_and_structured_data() {
        let parsed = parse_structured_syslog(LINE).unwrap();
        assert_eq!(parsed.severity, Severity::Info);
        assert_eq!(parsed.hostname, "router1");
        assert_eq!(parsed.app_name, "appflow");
        assert_eq!(parsed.msgid, "APPTRACK");
        assert_eq!(parsed.message, "session started");
        assert_eq!(parsed.structured_data.len(), 1);
        let (id, params) = &parsed.structured_data[0];
        assert_eq!(id, "apptrack");
        assert_eq!(params.get("id"), Some(&"1".to_string()));
        assert_eq!(params.get("app"), Some(&"ssh".to_string()));
    }

    #[test]
    fn dash_structured_data_yields_no_elements() {
        let line = "<14>1 - host app - MSGID - plain message";
        let parsed = parse_structured_syslog(line).unwrap();
        assert!(parsed.structured_data.is_empty());
        assert_eq!(parsed.message, "plain message");
    }

    #[test]
    fn missing_pri_prefix_is_rejected() {
        assert!(parse_structured_syslog("not a syslog line").is_none());
    }

    #[test]
    fn session_message_carries_syslog_type_and_structured_children() {
        let parsed = parse_structured_syslog(LINE).unwrap();
        let msg = to_session_message(&parsed, 100, 3);
        assert_eq!(msg.header.sandesh_type, SandeshType::Syslog);
        assert_eq!(msg.header.category, "APPTRACK");
        assert_eq!(msg.body.children.len(), 1);
        assert_eq!(msg.body.children[0].name, "apptrack");
    }
}
