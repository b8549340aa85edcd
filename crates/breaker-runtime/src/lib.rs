//! AntiDebug Breaker runtime
//!
//! The background service that keeps host script registrations, page caches
//! and toolbar badges in line with the per-hostname lists in the persistent
//! store, plus the configuration and host permissions it runs under.

pub mod background;
pub mod capabilities;
pub mod cli;
pub mod config;

pub use background::{Background, BackgroundEvent, FanOutOutcome, HostApis, TabStatus};
pub use capabilities::{Capabilities, CapabilityError};
pub use config::Config;
