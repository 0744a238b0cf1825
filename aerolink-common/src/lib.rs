//! # aerolink Common
//!
//! Shared utilities for the aerolink on-device daemons.
//!
//! ## Logging
//!
//! ```rust
//! aerolink_common::init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
