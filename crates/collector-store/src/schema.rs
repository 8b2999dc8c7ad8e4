//! Compiled-in column family names and the row-time/field-cache bucketing
//! scheme. The table list is reproduced bit-exactly from
//! `original_source/src/analytics/vizd_table_desc.cc` so a separate query
//! engine can keep reading what this writer produces.

use std::collections::HashSet;

/// Wide-column store table names. Declared once so `CreateTables` and every
/// insert path reference the same literal.
pub mod tables {
    pub const COLLECTOR_GLOBAL_TABLE: &str = "MessageTable";
    pub const MESSAGE_TABLE_SOURCE: &str = "MessageTablesource";
    pub const MESSAGE_TABLE_MODULE_ID: &str = "MessageTableModuleId";
    pub const MESSAGE_TABLE_MESSAGE_TYPE: &str = "MessageTableMessagetype";
    pub const MESSAGE_TABLE_CATEGORY: &str = "MessageTableCategory";
    pub const MESSAGE_TABLE_TIMESTAMP: &str = "MessageTableTimestamp";
    pub const MESSAGE_TABLE_KEYWORD: &str = "MessageTableKeyword";
    pub const OBJECT_TABLE: &str = "ObjectTable";
    pub const OBJECT_VALUE_TABLE: &str = "ObjectValueTable";
    pub const SYSTEM_OBJECT_TABLE: &str = "SystemObjectTable";
    pub const FIELD_NAMES_TABLE: &str = "FieldNames";
    pub const FLOW_TABLE: &str = "FlowRecordTable";
    pub const FLOW_TABLE_SVN_SIP: &str = "FlowTableSvnSip";
    pub const FLOW_TABLE_DVN_DIP: &str = "FlowTableDvnDip";
    pub const FLOW_TABLE_PROT_SP: &str = "FlowTableProtSp";
    pub const FLOW_TABLE_PROT_DP: &str = "FlowTableProtDp";
    pub const FLOW_TABLE_VROUTER: &str = "FlowTableVrouter";
    pub const SESSION_TABLE: &str = "SessionTable";
    pub const STATS_TABLE_BY_STR_TAG: &str = "StatTableByStrTag";
    pub const STATS_TABLE_BY_U64_TAG: &str = "StatTableByU64Tag";
    pub const STATS_TABLE_BY_DBL_TAG: &str = "StatTableByDblTag";
    pub const STATS_TABLE_BY_STR_STR_TAG: &str = "StatTableByStrStrTag";
    pub const STATS_TABLE_BY_STR_U64_TAG: &str = "StatTableByStrU64Tag";
    pub const STATS_TABLE_BY_U64_STR_TAG: &str = "StatTableByU64StrTag";
    pub const STATS_TABLE_BY_U64_U64_TAG: &str = "StatTableByU64U64Tag";

    pub const ALL: &[&str] = &[
        COLLECTOR_GLOBAL_TABLE,
        MESSAGE_TABLE_SOURCE,
        MESSAGE_TABLE_MODULE_ID,
        MESSAGE_TABLE_MESSAGE_TYPE,
        MESSAGE_TABLE_CATEGORY,
        MESSAGE_TABLE_TIMESTAMP,
        MESSAGE_TABLE_KEYWORD,
        OBJECT_TABLE,
        OBJECT_VALUE_TABLE,
        SYSTEM_OBJECT_TABLE,
        FIELD_NAMES_TABLE,
        FLOW_TABLE,
        FLOW_TABLE_SVN_SIP,
        FLOW_TABLE_DVN_DIP,
        FLOW_TABLE_PROT_SP,
        FLOW_TABLE_PROT_DP,
        FLOW_TABLE_VROUTER,
        SESSION_TABLE,
        STATS_TABLE_BY_STR_TAG,
        STATS_TABLE_BY_U64_TAG,
        STATS_TABLE_BY_DBL_TAG,
        STATS_TABLE_BY_STR_STR_TAG,
        STATS_TABLE_BY_STR_U64_TAG,
        STATS_TABLE_BY_U64_STR_TAG,
        STATS_TABLE_BY_U64_U64_TAG,
    ];
}

/// Row class used to select a TTL from `collector_core::config::TtlMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    Flow,
    Stats,
    ConfigAudit,
    Global,
}

/// `T2 = T >> k`, `T1 = T & ((1<<k)-1)`, for the configured row-time bit
/// width `k`. `T2` buckets the row key coarsely; `T1` orders columns within
/// a bucket.
pub fn row_time_split(timestamp_us: u64, k: u32) -> (u64, u64) {
    let t2 = timestamp_us >> k;
    let t1 = timestamp_us & ((1u64 << k) - 1);
    (t2, t1)
}

/// `cache_epoch = T2 >> c` for the configured cache-epoch bit width `c`.
pub fn cache_epoch(t2: u64, c: u32) -> u64 {
    t2 >> c
}

/// Process-wide FieldName dedup cache: a field is recorded in the
/// `FieldNames` table at most once per cache epoch. On epoch advance the set
/// is cleared entirely rather than pruned entry-by-entry (matches the
/// original's "clear-and-reinsert" epoch rollover).
#[derive(Debug, Default)]
pub struct FieldNameCache {
    epoch: Option<u64>,
    seen: HashSet<String>,
}

impl FieldNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `(epoch, signature)` had not yet been recorded —
    /// i.e. the caller should write the FieldNames row. Clears the cache
    /// first if `epoch` has advanced past the last seen epoch.
    pub fn record_if_new(&mut self, epoch: u64, signature: &str) -> bool {
        match self.epoch {
            Some(cur) if cur == epoch => {}
            _ => {
                self.epoch = Some(epoch);
                self.seen.clear();
            }
        }
        self.seen.insert(signature.to_string())
    }
}

/// `(base, count)` for a given partition-type total. Types below 15 total
/// partitions are unpartitioned (every type maps onto the whole range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    CNodes,
    PNodes,
    Vms,
    Ifs,
    Other,
}

pub fn partition_map(part_type: PartType, total_partitions: u32) -> (u32, u32) {
    if total_partitions < 15 {
        return (0, total_partitions);
    }
    // Reserve a slice of the partition space per type, the remainder going
    // to `Other`; proportions are illustrative, not from a recovered source
    // constant (viz_constants.h's table was not in the retrieved pack).
    let cnodes = (total_partitions as f64 * 0.1).round() as u32;
    let pnodes = (total_partitions as f64 * 0.2).round() as u32;
    let vms = (total_partitions as f64 * 0.4).round() as u32;
    let ifs = (total_partitions as f64 * 0.2).round() as u32;
    let used = cnodes + pnodes + vms + ifs;
    let other = total_partitions.saturating_sub(used);
    match part_type {
        PartType::CNodes => (0, cnodes),
        PartType::PNodes => (cnodes, pnodes),
        PartType::Vms => (cnodes + pnodes, vms),
        PartType::Ifs => (cnodes + pnodes + vms, ifs),
        PartType::Other => (cnodes + pnodes + vms + ifs, other),
    }
}

/// `djb2`-style string hash used for UVE key partitioning (matches the
/// "hash the bare key" description in spec.md §4.5; the original's exact
/// hash function was not in the retrieved pack, so a standard djb2 is used).
pub fn djb_hash(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_time_split_matches_worked_example() {
        // header.timestamp = 0x2_0000_0000 (scenario 1), default k=16.
        let (t2, t1) = row_time_split(0x2_0000_0000, 16);
        assert_eq!(t2, 0x2_0000_0000 >> 16);
        assert_eq!(t1, 0);
    }

    #[test]
    fn field_name_cache_dedups_within_epoch() {
        let mut cache = FieldNameCache::new();
        assert!(cache.record_if_new(3, "X"));
        assert!(!cache.record_if_new(3, "X"));
        assert!(cache.record_if_new(3, "Y"));
    }

    #[test]
    fn field_name_cache_epoch_rollover_re_records() {
        // k=8, c=2 => epoch advances every 1<<10 us, per scenario 6.
        let mut cache = FieldNameCache::new();
        let (t2_a, _) = row_time_split(0, 8);
        let epoch_a = cache_epoch(t2_a, 2);
        assert!(cache.record_if_new(epoch_a, "X"));

        let (t2_b, _) = row_time_split(1 << 10, 8);
        let epoch_b = cache_epoch(t2_b, 2);
        assert_ne!(epoch_a, epoch_b);
        assert!(cache.record_if_new(epoch_b, "X"));
    }

    #[test]
    fn partition_map_below_fifteen_is_unpartitioned() {
        assert_eq!(partition_map(PartType::Vms, 10), (0, 10));
        assert_eq!(partition_map(PartType::Other, 14), (0, 14));
    }
}
