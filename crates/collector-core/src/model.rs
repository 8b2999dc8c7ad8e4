//! Core data model shared by every collector crate: generator identity, the
//! typed-tree wire body, and the tag/attribute value variants used by the
//! store writer and the stat walker.

use std::collections::BTreeMap;
use std::fmt;

/// Unique, never-mutated identity of a producer process.
///
/// All four components must be non-empty; the registry (`collector-pipeline`)
/// rejects a ctrl message carrying an empty `instance_id` or `node_type`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneratorId {
    pub source: String,
    pub module: String,
    pub node_type: String,
    pub instance_id: String,
}

impl GeneratorId {
    pub fn new(
        source: impl Into<String>,
        module: impl Into<String>,
        node_type: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            module: module.into(),
            node_type: node_type.into(),
            instance_id: instance_id.into(),
        }
    }

    /// `source_type:node_type:module:instance_id`, used as the display name
    /// and as the operational-store key prefix.
    pub fn display_name(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.source, self.node_type, self.module, self.instance_id
        )
    }
}

impl fmt::Display for GeneratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// A tag/attribute value. Unsupported variant combinations at the stat
/// walker fail the write and increment an error counter.
#[derive(Debug, Clone, PartialEq)]
pub enum Var {
    Invalid,
    Str(String),
    U64(u64),
    Dbl(f64),
}

impl Var {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Var::Invalid)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Invalid => write!(f, ""),
            Var::Str(s) => write!(f, "{s}"),
            Var::U64(v) => write!(f, "{v}"),
            Var::Dbl(v) => write!(f, "{v}"),
        }
    }
}

pub type AttribMap = BTreeMap<String, Var>;

/// Sandesh message type, carried on every `SessionMessage` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandeshType {
    Log,
    Object,
    Uve,
    Flow,
    Session,
    Syslog,
    System,
}

/// Hints bitfield carried on the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hints(pub u32);

impl Hints {
    pub const KEY_HINT: Hints = Hints(0x1);

    pub fn contains(self, other: Hints) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Hints {
    type Output = Hints;
    fn bitor(self, rhs: Hints) -> Hints {
        Hints(self.0 | rhs.0)
    }
}

/// Header carried by every `SessionMessage`.
#[derive(Debug, Clone)]
pub struct SessionHeader {
    pub source: String,
    pub module: String,
    pub instance_id: String,
    pub node_type: String,
    pub category: String,
    pub severity: Severity,
    pub sandesh_type: SandeshType,
    /// Microseconds since epoch.
    pub timestamp: u64,
    pub sequence_num: u64,
    pub pid: Option<u32>,
    pub ip_address: Option<String>,
    pub hints: Hints,
}

impl SessionHeader {
    pub fn has_key_hint(&self) -> bool {
        self.hints.contains(Hints::KEY_HINT)
    }
}

/// Severity ordered to match Sandesh's own numbering: `Critical`/`Error` are
/// the least-expendable (lowest `Ord` value), `Debug`/`Info` the most
/// (highest), `Invalid` above even `Debug` so it is always discarded first.
/// The drop-level comparison (`severity >= drop_level`) relies on this
/// ordering directly — a `Warn` drop level sheds `Notice`/`Info`/`Debug` but
/// keeps `Warn` and everything more important than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Critical,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
    Invalid,
}

/// Minimal owned tree standing in for the out-of-scope wire-envelope parser
/// (spec's primary producer protocol is "gives us a typed message tree with
/// a header and an XML-ish body" — this type is that typed tree).
#[derive(Debug, Clone, Default)]
pub struct MessageNode {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub text: Option<String>,
    pub children: Vec<MessageNode>,
}

impl MessageNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: MessageNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn key(&self) -> Option<&str> {
        self.attr("key")
    }

    /// Serialized text payload, used as the raw UVE attribute body when no
    /// `aggtype=stats` rewrite applies. Mirrors the original's XML subtree
    /// serialization closely enough for store/pub-sub round-tripping: tag
    /// name, then either the text value or the serialized children.
    pub fn to_wire_string(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        let mut out = format!("<{}", self.name);
        for (k, v) in &self.attrs {
            out.push_str(&format!(" {k}=\"{v}\""));
        }
        out.push('>');
        for child in &self.children {
            out.push_str(&child.to_wire_string());
        }
        out.push_str(&format!("</{}>", self.name));
        out
    }
}

#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub header: SessionHeader,
    pub body: MessageNode,
    /// Random correlation id used as the message-table column's uuid
    /// component (spec.md §4.2).
    pub unm: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_id_display_name_matches_original_ordering() {
        let id = GeneratorId::new("H1", "M", "N", "I");
        assert_eq!(id.display_name(), "H1:N:M:I");
    }

    #[test]
    fn var_display_renders_plain_value() {
        assert_eq!(Var::Str("x".into()).to_string(), "x");
        assert_eq!(Var::U64(40).to_string(), "40");
    }

    #[test]
    fn message_node_key_reads_key_attribute() {
        let node = MessageNode::new("name").with_attr("key", "ObjectVNTable");
        assert_eq!(node.key(), Some("ObjectVNTable"));
    }
}
