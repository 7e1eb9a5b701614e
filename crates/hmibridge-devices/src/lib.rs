//! Boiler console bridge.
//!
//! This crate reads a Climatix-style HMI web console and mirrors its points
//! onto a publish/subscribe bus.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `http` | ✅ | `HmiClient` over reqwest |
//! | `mqtt` | ✅ | `MqttBus` over rumqttc |
//!
//! ## Architecture
//!
//! - **hmi**: console formats (localization scripts, pages, telemetry stream)
//!   and the [`DeviceSession`] seam
//! - **sync**: policy filtering, fallback entities, enumeration translation
//! - **discovery**: topic layout and Home Assistant discovery payloads
//! - **adapters**: the [`MessageBus`] seam and its MQTT implementation
//! - **bridge**: the poll/command engine tying the above together

pub mod adapters;
pub mod bridge;
pub mod discovery;
pub mod hmi;
pub mod sync;

pub use adapters::{InboundMessage, MessageBus};
#[cfg(feature = "mqtt")]
pub use adapters::MqttBus;
pub use bridge::{Bridge, BridgeSettings, CommandOutcome, PollReport};
pub use discovery::{DiscoveryContext, EntityAttributes, Topics};
#[cfg(feature = "http")]
pub use hmi::HmiClient;
pub use hmi::{DeviceSession, LocalizationTable, PageModel, PageParser};
pub use sync::{EntityKey, EntityRegistry, SyncPolicy, SynchronizedEntity, Synchronizer, Whitelist};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
