//! Message classifier (C5): pure functions over a `SessionMessage` that
//! decide whether to drop it, extract object annotations, and extract the
//! UVE update/delete shape. No I/O — `receive.rs` (C4) calls these and then
//! drives the store writer / UVE publisher with the results.
//!
//! Grounded on `ruleeng.cc`'s object/UVE/flow dispatch by sandesh type and
//! `viz_message.cc`'s object-name and barekey extraction from `key=`
//! attributes.

use collector_core::model::{MessageNode, SandeshType, Severity};
use collector_store::writer::FlowRecord;
use std::collections::BTreeMap;

/// Step 1 of spec.md §4.4: `flow` is unconditionally dropped once the
/// queue is red (top watermark reached); `system`/`object`/`uve`/`session`
/// honour the writer's computed severity threshold; everything else bypasses
/// the drop check entirely.
pub fn should_drop(
    sandesh_type: SandeshType,
    msg_severity: Severity,
    effective_drop_level: Severity,
    queue_is_red: bool,
) -> bool {
    match sandesh_type {
        SandeshType::Flow => queue_is_red,
        SandeshType::System | SandeshType::Object | SandeshType::Uve | SandeshType::Session => {
            msg_severity >= effective_drop_level
        }
        SandeshType::Log | SandeshType::Syslog => false,
    }
}

/// Step 2: every node carrying a `key="<table>"` attribute contributes an
/// object name `"<table>:<value>"`, values from the same table concatenated
/// with `:` when it appears more than once in the message.
pub fn collect_object_names(body: &MessageNode) -> Vec<String> {
    let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    walk_keyed(body, &mut by_table);
    by_table
        .into_iter()
        .map(|(table, values)| format!("{table}:{}", values.join(":")))
        .collect()
}

fn walk_keyed(node: &MessageNode, acc: &mut BTreeMap<String, Vec<String>>) {
    if let Some(table) = node.key() {
        let value = node.text.clone().unwrap_or_default();
        acc.entry(table.to_string()).or_default().push(value);
    }
    for child in &node.children {
        walk_keyed(child, acc);
    }
}

/// One UVE attribute slated for `UVEUpdate`.
#[derive(Debug, Clone, PartialEq)]
pub struct UveAttrUpdate {
    pub attr_name: String,
    /// Either the child's raw text (`aggtype=stats`) or its serialized
    /// subtree — spec.md §4.4 step 3's payload distinction.
    pub payload: String,
    pub aggtype: Option<String>,
    pub hbin: Option<String>,
    pub tags: Option<String>,
    /// The child's own node, kept around so `receive.rs` can run stat
    /// extraction (C11) over its list-of-structs children when `tags` is
    /// present — the payload string alone has already flattened that
    /// structure away.
    pub node: MessageNode,
}

/// Everything step 3 extracts from a UVE-typed message's body.
#[derive(Debug, Clone, PartialEq)]
pub struct UveExtraction {
    pub struct_type: String,
    pub uve_key: String,
    pub table: String,
    /// True if any child attribute carried `deleted="true"`.
    pub deleted: bool,
    pub attrs: Vec<UveAttrUpdate>,
}

/// Locates the body's `data` subnode and its single typed child (`object`),
/// builds `table`/`barekey` from `object`'s `key`-annotated children, and
/// collects the remaining children as attribute updates. Returns `None` if
/// the body doesn't have the expected `data -> object` shape.
pub fn extract_uve(body: &MessageNode) -> Option<UveExtraction> {
    let data = body.children.iter().find(|c| c.name == "data")?;
    let object = data.children.first()?;
    let struct_type = object.name.clone();

    let mut table = String::new();
    let mut barekey_parts: Vec<String> = Vec::new();
    for child in &object.children {
        if let Some(k) = child.key() {
            if table.is_empty() {
                table = k.to_string();
            } else {
                barekey_parts.push(k.to_string());
            }
        }
    }
    let uve_key = if barekey_parts.is_empty() {
        table.clone()
    } else {
        format!("{table}:{}", barekey_parts.join(":"))
    };

    let mut deleted = false;
    let mut attrs = Vec::new();
    for child in &object.children {
        if child.attr("deleted") == Some("true") {
            deleted = true;
            continue;
        }
        if child.key().is_some() {
            continue;
        }
        if child.text.is_none() && child.children.is_empty() {
            continue;
        }
        let aggtype = child.attr("aggtype").map(str::to_string);
        let payload = if aggtype.as_deref() == Some("stats") {
            child.text.clone().unwrap_or_default()
        } else {
            child.to_wire_string()
        };
        attrs.push(UveAttrUpdate {
            attr_name: child.name.clone(),
            payload,
            aggtype,
            hbin: child.attr("hbin").map(str::to_string),
            tags: child.attr("tags").map(str::to_string),
            node: child.clone(),
        });
    }

    Some(UveExtraction {
        struct_type,
        uve_key,
        table,
        deleted,
        attrs,
    })
}

/// Step 5: log-stats FieldNames candidates for `SYSTEM`/`SYSLOG` messages —
/// message type, module, source, and category (if present).
pub fn log_stat_field_names(
    sandesh_type: SandeshType,
    msg_type: &str,
    module: &str,
    source: &str,
    category: Option<&str>,
) -> Vec<(&'static str, String)> {
    if !matches!(sandesh_type, SandeshType::System | SandeshType::Syslog) {
        return Vec::new();
    }
    let mut fields = vec![
        ("Messagetype", msg_type.to_string()),
        ("ModuleId", module.to_string()),
        ("Source", source.to_string()),
    ];
    if let Some(category) = category {
        fields.push(("Category", category.to_string()));
    }
    fields
}

fn child_text(node: &MessageNode, name: &str) -> Option<String> {
    node.children
        .iter()
        .find(|c| c.name == name)
        .and_then(|c| c.text.clone())
}

/// Step 4 (flow half): one `FlowRecord` per element of the body's `flowdata`
/// list node, field names matching `FlowRecord`'s members directly —
/// `flow_uuid`, `vrouter`, `source_vn`, `source_ip`, `dest_vn`, `dest_ip`,
/// `protocol`, `source_port`, `dest_port` — with a malformed element (missing
/// `flow_uuid`) skipped rather than failing the whole message.
pub fn extract_flow_records(body: &MessageNode, timestamp_us: u64) -> Vec<FlowRecord> {
    let Some(flowdata) = body.children.iter().find(|c| c.name == "flowdata") else {
        return Vec::new();
    };
    flowdata
        .children
        .iter()
        .filter_map(|element| {
            Some(FlowRecord {
                timestamp_us,
                flow_uuid: child_text(element, "flow_uuid")?,
                vrouter: child_text(element, "vrouter").unwrap_or_default(),
                source_vn: child_text(element, "source_vn").unwrap_or_default(),
                source_ip: child_text(element, "source_ip").unwrap_or_default(),
                dest_vn: child_text(element, "dest_vn").unwrap_or_default(),
                dest_ip: child_text(element, "dest_ip").unwrap_or_default(),
                protocol: child_text(element, "protocol").unwrap_or_default(),
                source_port: child_text(element, "source_port")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                dest_port: child_text(element, "dest_port")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                value: element.to_wire_string(),
            })
        })
        .collect()
}

/// One session record extracted from a `session_data` list node: `vrouter`,
/// `session_uuid`, and the serialized element as the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub vrouter: String,
    pub session_uuid: String,
    pub value: String,
}

/// Step 4 (session half): one `SessionRecord` per element of the body's
/// `session_data` list node.
pub fn extract_session_records(body: &MessageNode) -> Vec<SessionRecord> {
    let Some(session_data) = body.children.iter().find(|c| c.name == "session_data") else {
        return Vec::new();
    };
    session_data
        .children
        .iter()
        .filter_map(|element| {
            Some(SessionRecord {
                vrouter: child_text(element, "vrouter").unwrap_or_default(),
                session_uuid: child_text(element, "session_uuid")?,
                value: element.to_wire_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_drops_only_when_queue_red_regardless_of_severity() {
        assert!(should_drop(
            SandeshType::Flow,
            Severity::Debug,
            Severity::Debug,
            true
        ));
        assert!(!should_drop(
            SandeshType::Flow,
            Severity::Critical,
            Severity::Debug,
            false
        ));
    }

    #[test]
    fn log_bypasses_drop_check_entirely() {
        assert!(!should_drop(
            SandeshType::Log,
            Severity::Critical,
            Severity::Debug,
            true
        ));
    }

    #[test]
    fn object_uve_session_honour_severity_threshold() {
        // A `Warn` drop level sheds `Warn` itself and anything less
        // important (`Notice`/`Info`/`Debug`), but keeps `Error`/`Critical`.
        assert!(should_drop(
            SandeshType::Uve,
            Severity::Warn,
            Severity::Warn,
            false
        ));
        assert!(should_drop(
            SandeshType::Uve,
            Severity::Debug,
            Severity::Warn,
            false
        ));
        assert!(!should_drop(
            SandeshType::Uve,
            Severity::Error,
            Severity::Warn,
            false
        ));
    }

    #[test]
    fn collect_object_names_concatenates_same_table_values() {
        let body = MessageNode::new("msg")
            .with_child(MessageNode::new("a").with_attr("key", "ObjectVNTable").with_text("vn1"))
            .with_child(MessageNode::new("b").with_attr("key", "ObjectVNTable").with_text("vn2"));
        let names = collect_object_names(&body);
        assert_eq!(names, vec!["ObjectVNTable:vn1:vn2".to_string()]);
    }

    #[test]
    fn extract_uve_splits_table_barekey_and_attrs() {
        let object = MessageNode::new("UveVirtualNetworkAgent")
            .with_child(MessageNode::new("name").with_attr("key", "ObjectVNTable").with_text("vn1"))
            .with_child(
                MessageNode::new("in_tpkts")
                    .with_attr("aggtype", "stats")
                    .with_text("42"),
            );
        let data = MessageNode::new("data").with_child(object);
        let body = MessageNode::new("msg").with_child(data);

        let extraction = extract_uve(&body).unwrap();
        assert_eq!(extraction.struct_type, "UveVirtualNetworkAgent");
        assert_eq!(extraction.table, "ObjectVNTable");
        assert_eq!(extraction.uve_key, "ObjectVNTable");
        assert!(!extraction.deleted);
        assert_eq!(extraction.attrs.len(), 1);
        assert_eq!(extraction.attrs[0].attr_name, "in_tpkts");
        assert_eq!(extraction.attrs[0].payload, "42");
    }

    #[test]
    fn extract_uve_notices_deletion_marker() {
        let object = MessageNode::new("UveVirtualNetworkAgent").with_child(
            MessageNode::new("deleted_field").with_attr("deleted", "true"),
        );
        let data = MessageNode::new("data").with_child(object);
        let body = MessageNode::new("msg").with_child(data);
        let extraction = extract_uve(&body).unwrap();
        assert!(extraction.deleted);
        assert!(extraction.attrs.is_empty());
    }

    #[test]
    fn log_stat_field_names_empty_for_non_log_types() {
        assert!(log_stat_field_names(SandeshType::Uve, "X", "m", "s", None).is_empty());
        let fields = log_stat_field_names(SandeshType::System, "X", "m", "s", Some("cat"));
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn extract_flow_records_reads_listed_elements_and_skips_malformed() {
        let good = MessageNode::new("flow")
            .with_child(MessageNode::new("flow_uuid").with_text("f1"))
            .with_child(MessageNode::new("vrouter").with_text("vr-a"))
            .with_child(MessageNode::new("source_port").with_text("1234"));
        let malformed = MessageNode::new("flow").with_child(MessageNode::new("vrouter").with_text("vr-b"));
        let flowdata = MessageNode::new("flowdata")
            .with_child(good)
            .with_child(malformed);
        let body = MessageNode::new("msg").with_child(flowdata);

        let records = extract_flow_records(&body, 42);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].flow_uuid, "f1");
        assert_eq!(records[0].vrouter, "vr-a");
        assert_eq!(records[0].source_port, 1234);
        assert_eq!(records[0].timestamp_us, 42);
    }

    #[test]
    fn extract_session_records_reads_listed_elements() {
        let element = MessageNode::new("session")
            .with_child(MessageNode::new("session_uuid").with_text("s1"))
            .with_child(MessageNode::new("vrouter").with_text("vr-a"));
        let session_data = MessageNode::new("session_data").with_child(element);
        let body = MessageNode::new("msg").with_child(session_data);

        let records = extract_session_records(&body);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_uuid, "s1");
        assert_eq!(records[0].vrouter, "vr-a");
    }
}
