//! # collector-core
//!
//! Foundational types shared by every crate in the telemetry collector:
//! generator identity and the typed message tree (`model`), the process
//! configuration surface (`config`), and the error taxonomy the rest of the
//! workspace returns (`error`).
//!
//! ## Example
//!
//! ```rust
//! use collector_core::model::GeneratorId;
//!
//! let id = GeneratorId::new("h1", "m", "n", "i");
//! assert_eq!(id.display_name(), "h1:n:m:i");
//! ```

pub mod config;
pub mod error;
pub mod model;

pub use config::CollectorConfig;
pub use error::{CollectorError, Result};
