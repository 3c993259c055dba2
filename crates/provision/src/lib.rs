//! Zero-touch provisioning for MikroTik RouterBoard devices.
//!
//! A device is known only by its hardware address. Provisioning a session:
//!
//! 1. locates the device on the local network ([`locator`]),
//! 2. tells it over SSH to fetch and import the base script ([`executor`]),
//! 3. renders its personalized script for download ([`render`]),
//! 4. waits out the device-side fetch interval.
//!
//! Progress is published as an ordered event log per session
//! ([`status::StatusBus`]) that any number of callers can poll or subscribe
//! to, over the HTTP API in [`server`] or directly.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = Arc::new(StatusBus::new());
//! let registry = Arc::new(SessionRegistry::in_memory(Arc::clone(&bus)));
//! let provisioner = Provisioner::new(registry, Arc::new(orchestrator));
//!
//! let id = provisioner.start(ProvisionRequest::for_address("AA:BB:CC:DD:EE:FF")).await?;
//! let mut events = bus.subscribe(id).await?;
//! while let Some(event) = events.next().await {
//!     println!("{} {}", event.sequence, event.message);
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod locator;
pub mod mac;
pub mod net;
pub mod orchestrator;
pub mod registry;
pub mod render;
pub mod server;
pub mod service;
pub mod session;
pub mod status;

pub use config::{ConfigError, ProvisionerConfig};
pub use error::{
    DiscoveryError, ProvisionError, RegistryError, RenderError, StatusError, TransportError,
};
pub use mac::HardwareAddress;
pub use orchestrator::{OrchestratorConfig, SessionOrchestrator};
pub use registry::{SessionFilter, SessionRegistry, SessionStore};
pub use service::{ProvisionRequest, Provisioner};
pub use session::{Credentials, NetworkParams, Session, SessionId, SessionSnapshot, SessionState};
pub use status::{EventKind, StatusBus, StatusEvent};
