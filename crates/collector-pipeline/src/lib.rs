//! # collector-pipeline
//!
//! The message-processing side of the collector: the Generator registry
//! (C3), the message classifier (C5), the session receive path (C4) that
//! drives the two together, the UVE publisher (C6), and the stat walker
//! (C11).

pub mod classify;
pub mod receive;
pub mod registry;
pub mod stat_walker;
pub mod uve;

pub use receive::ReceivePath;
pub use registry::{CtrlFields, GeneratorRegistry, Session};
pub use uve::{UveUpdateArgs, UvePublisher};
