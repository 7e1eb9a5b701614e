//! Core types for hmibridge.
//!
//! This crate holds what every other crate in the workspace shares: the
//! error taxonomy, configuration loading and the lifecycle context.

pub mod config;
pub mod error;
pub mod lifecycle;

pub use config::{BridgeConfig, MqttSettings, Profile, WhitelistRule};
pub use error::{Error, ErrorCategory, Result};
pub use lifecycle::{Lifecycle, LifecycleState};
