//! Request handlers registered with the router.
//!
//! Each submodule exposes one or more [`Capability`](crate::router::Capability)
//! implementations plus the pure helpers they are built from. Registration
//! order lives in `main.rs`.

pub mod debug;
pub mod partitions;
pub mod platform;
pub mod settings;
pub mod status;
pub mod video;
pub mod wifi;
