//! Stat walker (C11): a stack of nested attribute scopes that assembles
//! fully-qualified tag names and flushes a `StatTableInsert`-shaped record
//! per scope on `pop`.
//!
//! A direct generalization of `stat_walker.cc`'s `Push`/`Pop`/`FillTag` to
//! Rust ownership: the original's member-function callback becomes an
//! injector closure passed at construction, and the node stack is an owned
//! `Vec` instead of an intrusive list walked via parent pointers.

use collector_core::model::{MessageNode, Var};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One nested scope on the walker's stack.
struct StatNode {
    name: String,
    /// Tags seeded at `push` time, in short form (not yet namespaced).
    seed_tags: BTreeMap<String, Var>,
    attribs: BTreeMap<String, Var>,
}

/// `(timestamp, stat_name, stat_attr, tag_map, attrib_map)` — the shape
/// `StatTableInsert` (C2) consumes.
pub struct FlushedStat {
    pub stat_name: String,
    pub stat_attr: String,
    pub tags: BTreeMap<String, Var>,
    pub attribs: BTreeMap<String, Var>,
}

/// Injector invoked once per `pop()`. Boxed `FnMut` rather than a trait
/// object method, per §9's "callbacks as first-class closures" redesign
/// note.
pub type StatInjector = Box<dyn FnMut(FlushedStat) + Send>;

pub struct StatWalker {
    stack: Vec<StatNode>,
    inject: StatInjector,
}

impl StatWalker {
    pub fn new(inject: StatInjector) -> Self {
        Self {
            stack: Vec::new(),
            inject,
        }
    }

    /// Pushes a new scope. `name` must not itself contain a dot — the
    /// original asserts this; here it is simply rejected.
    ///
    /// Tag names are short-form at push time; they get fully qualified
    /// lazily, at `pop`, against whatever the stack looks like then.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        tags: BTreeMap<String, Var>,
        attribs: BTreeMap<String, Var>,
    ) -> Result<(), &'static str> {
        let name = name.into();
        if name.contains('.') {
            return Err("stat node name must not contain '.'");
        }
        self.stack.push(StatNode {
            name,
            seed_tags: tags,
            attribs,
        });
        Ok(())
    }

    /// Builds the fully qualified tag name for one ancestor-scope tag,
    /// `"<parent1>.<parent2>...<name>.<tag>"` (`FillTag` in the original).
    fn fill_tag(&self, depth: usize, tag_name: &str) -> String {
        let mut parts: Vec<&str> = self.stack[..=depth].iter().map(|n| n.name.as_str()).collect();
        parts.push(tag_name);
        parts.join(".")
    }

    /// Flushes the top scope: assembles the tag map from its own seed tags
    /// plus every tag accumulated by ancestor scopes (duplicates resolved
    /// last-write-wins, outermost first), duplicates tags as plain
    /// attributes, and invokes the injector. Returns `None` if the stack is
    /// empty.
    pub fn pop(&mut self) -> Option<()> {
        let depth = self.stack.len().checked_sub(1)?;
        let mut tags = BTreeMap::new();
        for (i, node) in self.stack.iter().enumerate() {
            for (tag_name, value) in &node.seed_tags {
                let qualified = if i == depth {
                    self.fill_tag(depth, tag_name)
                } else {
                    self.qualify_at(i, tag_name)
                };
                tags.insert(qualified, value.clone());
            }
        }

        let top = self.stack.pop()?;
        let mut attribs = top.attribs;
        for (tag_name, value) in &tags {
            attribs.entry(tag_name.clone()).or_insert_with(|| value.clone());
        }

        let prename = self.qualify_at_inclusive(depth, &top.name);
        (self.inject)(FlushedStat {
            stat_name: prename,
            stat_attr: top.name,
            tags,
            attribs,
        });
        Some(())
    }

    fn qualify_at(&self, index: usize, tag_name: &str) -> String {
        let mut parts: Vec<&str> = self.stack[..=index].iter().map(|n| n.name.as_str()).collect();
        parts.push(tag_name);
        parts.join(".")
    }

    fn qualify_at_inclusive(&self, depth: usize, name: &str) -> String {
        let mut parts: Vec<&str> = self.stack[..depth].iter().map(|n| n.name.as_str()).collect();
        parts.push(name);
        parts.join(".")
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Drives the stat walker over a `tags="..."`-annotated UVE attribute whose
/// child is a list-of-structs (spec.md §4.4 step 3): one scope per list
/// element, named after the element's struct type, with fields named in
/// `tags_csv` promoted to tags (and, per `pop`'s rule, duplicated as
/// attributes) and every other field left as a plain attribute.
///
/// `attr_name` becomes the outer scope so tag names come out fully qualified
/// as `"<attr_name>.<element_type>.<tag>"`, matching `FillTag`'s ancestor-name
/// qualification.
pub fn extract_uve_tagged_stats(
    attr_name: &str,
    tags_csv: &str,
    list_node: &MessageNode,
) -> Vec<FlushedStat> {
    let tag_names: Vec<&str> = tags_csv
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let flushed = Arc::new(Mutex::new(Vec::new()));
    let flushed_clone = flushed.clone();
    let mut walker = StatWalker::new(Box::new(move |f| flushed_clone.lock().unwrap().push(f)));
    if walker.push(attr_name, BTreeMap::new(), BTreeMap::new()).is_err() {
        return Vec::new();
    }

    for element in &list_node.children {
        let mut tags = BTreeMap::new();
        let mut attribs = BTreeMap::new();
        for field in &element.children {
            let value = field.text.clone().map(Var::Str).unwrap_or(Var::Invalid);
            if tag_names.contains(&field.name.as_str()) {
                tags.insert(field.name.clone(), value);
            } else {
                attribs.insert(field.name.clone(), value);
            }
        }
        if walker.push(&element.name, tags, attribs).is_err() {
            continue;
        }
        walker.pop();
    }
    walker.pop();

    Arc::try_unwrap(flushed)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_dotted_name() {
        let mut walker = StatWalker::new(Box::new(|_| {}));
        let result = walker.push("bad.name", BTreeMap::new(), BTreeMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn pop_flushes_and_qualifies_nested_tags() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let flushed_clone = flushed.clone();
        let mut walker = StatWalker::new(Box::new(move |f| flushed_clone.lock().unwrap().push(f)));

        let mut outer_tags = BTreeMap::new();
        outer_tags.insert("iface".to_string(), Var::Str("eth0".to_string()));
        walker.push("interface", outer_tags, BTreeMap::new()).unwrap();

        let mut inner_attribs = BTreeMap::new();
        inner_attribs.insert("bytes".to_string(), Var::U64(1024));
        walker.push("counters", BTreeMap::new(), inner_attribs).unwrap();

        walker.pop().unwrap();
        walker.pop().unwrap();

        let results = flushed.lock().unwrap();
        assert_eq!(results.len(), 2);
        let inner = &results[0];
        assert_eq!(inner.stat_attr, "counters");
        assert!(inner.tags.contains_key("interface.counters.iface"));
        assert_eq!(inner.attribs.get("bytes"), Some(&Var::U64(1024)));
    }

    #[test]
    fn pop_on_empty_stack_returns_none() {
        let mut walker = StatWalker::new(Box::new(|_| {}));
        assert!(walker.pop().is_none());
    }

    #[test]
    fn extract_uve_tagged_stats_promotes_listed_fields_to_tags() {
        let element = MessageNode::new("FlowSampleStat")
            .with_child(MessageNode::new("pifindex").with_text("7"))
            .with_child(MessageNode::new("bytes").with_text("1024"));
        let list = MessageNode::new("samples").with_child(element);

        let flushed = extract_uve_tagged_stats("in_tpkts", "pifindex", &list);
        let sample_row = flushed
            .iter()
            .find(|f| f.stat_attr == "FlowSampleStat")
            .unwrap();
        assert!(sample_row
            .tags
            .contains_key("in_tpkts.FlowSampleStat.pifindex"));
        assert_eq!(
            sample_row.attribs.get("bytes"),
            Some(&Var::Str("1024".to_string()))
        );
    }
}
