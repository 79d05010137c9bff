//! # tracker-ota-core
//!
//! Orchestration core for pushing firmware to a fleet of wireless trackers
//! through a serially attached gateway dongle.
//!
//! ## Flow
//!
//! 1. The gateway is found by USB identity and opened ([`serial`]).
//! 2. A UDP rendezvous listener binds and signals readiness ([`listener`],
//!    [`readiness`]).
//! 3. The gateway is told to broadcast the join request, carrying the run
//!    token and WiFi credentials ([`gateway`]).
//! 4. Trackers hail the listener; each authenticated address gets one OTA
//!    session driven by a [`pusher::FirmwarePusher`] ([`registry`]).
//! 5. The orchestrator reports aggregate progress until stopped
//!    ([`orchestrator`]).
//!
//! ## Design Principles
//!
//! - **Synchronous**: plain threads and channels, no async runtime.
//! - **Isolation**: a failed device only removes its own session.
//! - **Explicit secrets**: the run token is passed to the components that
//!   need it, never stored globally.

pub mod bootloader;
pub mod config;
pub mod error;
pub mod espota;
pub mod gateway;
pub mod listener;
pub mod orchestrator;
pub mod pusher;
pub mod readiness;
pub mod registry;
pub mod serial;
pub mod token;

pub use config::{ConfigSource, ConfigValue, OtaConfig};
pub use error::{
    ConfigError, HandshakeError, ListenerError, OtaError, Result, SerialError, UploadError,
};
pub use espota::EspOtaPusher;
pub use gateway::{GatewayBootstrap, GatewayLink, HandshakeState};
pub use listener::{HailSink, RendezvousListener};
pub use orchestrator::{Orchestrator, ShutdownFlag};
pub use pusher::{FirmwarePusher, ProgressSink, SessionEvent, UploadRequest};
pub use readiness::ReadinessGate;
pub use registry::{Admission, OtaSession, SessionOutcome, SessionRegistry, SessionState, UploadPlan};
pub use serial::{discover_gateway, SerialGateway};
pub use token::{HailVerifier, RunToken};
