//! # collector-store
//!
//! The wide-column backing store side of the collector: the watermarked
//! queue (C1) back-pressure primitive, the store writer (C2) that turns
//! `StoreRow`s into column-family writes with TTLs and drop-level
//! enforcement, the `scylla`-backed `ColumnStore` implementation, and the
//! connection-state/metrics singleton (C12).

pub mod connstate;
pub mod schema;
pub mod scylla_store;
pub mod watermark;
pub mod writer;

pub use connstate::ConnectionState;
pub use watermark::WatermarkQueue;
pub use writer::{ColumnStore, FlowRecord, StoreWriter};
