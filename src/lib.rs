//! # yeelight_rs
//!
//! An async Rust library for discovering and controlling Yeelight smart
//! bulbs over the local network.
//!
//! This crate covers the bulbs' LAN control stack end to end: SSDP multicast
//! and mDNS discovery, the line-oriented JSON control protocol over a
//! persistent TCP connection per bulb, and group synchronization that keeps
//! a set of bulbs following a master device's state.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use yeelight_rs::{ControlSession, DeviceRegistry, Discovery, EventBus, Power};
//!
//! async fn turn_everything_on() -> Result<(), yeelight_rs::Error> {
//!     let registry = DeviceRegistry::new();
//!     let events = EventBus::default();
//!
//!     // Find bulbs on the local network (SSDP + mDNS, 5s window).
//!     let devices = Discovery::new(registry.clone())
//!         .discover(&CancellationToken::new())
//!         .await?;
//!
//!     for device in devices {
//!         let session =
//!             ControlSession::connect(device.addr(), registry.clone(), events.clone()).await?;
//!         session.set_power(Power::On).await?;
//!         session.close().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Discovery**: SSDP multicast probe and mDNS browse run concurrently
//!   with retry and cancellation, feeding a [`DeviceRegistry`]
//! - **Control**: per-bulb [`ControlSession`] with request/response
//!   correlation, state-push decoding, and keep-alive
//! - **Events**: state pushes become [`StateChange`] events on an
//!   [`EventBus`] any component can subscribe to
//! - **Group sync**: a [`SyncCoordinator`] propagates a master bulb's state
//!   to its group per [`SyncPolicy`] (mirror, alternate, sequence, random)
//! - **Supervision**: bounded exponential backoff via
//!   [`retry::with_retry`] and [`retry::connect_with_retry`]
//!
//! ## Ownership
//!
//! There are no singletons: the registry, event bus, group store, and
//! coordinator are plain values the caller constructs and wires together,
//! so tests (and multi-network setups) can run several independent stacks
//! side by side.

mod device;
mod discovery;
mod errors;
mod events;
mod protocol;
mod registry;
pub mod retry;
mod session;
mod sync;
mod types;

// Re-export public API
pub use device::{Connectivity, Device};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryResult};
pub use errors::Error;
pub use events::{EventBus, StateChange};
pub use protocol::{Method, StateDelta};
pub use registry::DeviceRegistry;
pub use retry::{RetryPolicy, connect_with_retry, with_retry};
pub use session::{CONTROL_PORT, ControlSession, SessionConfig, SessionState};
pub use sync::{GroupStore, SessionMap, SyncCoordinator, SyncGroup, SyncPolicy, SyncStats};
pub use types::{
    Brightness, Color, DeviceState, Feature, FeatureSet, Flow, FlowMode, FlowTransition, Kelvin,
    Power, Rgb,
};
