//! # Honeypool
//!
//! Per-attacker sandbox pool for honeypots.
//!
//! ## Features
//!
//! - **Sticky Identity:** Every remote host gets its own sandbox, keyed by a
//!   fingerprint of its address, for the lifetime of the pool
//! - **Lazy Provisioning:** Sandboxes are cloned from a template on first
//!   contact and concurrent first contacts share one provisioning
//! - **Tiered Reclamation:** Idle sandboxes are frozen, then stopped, and
//!   brought back transparently when traffic resumes
//! - **Pluggable Runtimes:** The state machine only depends on the
//!   `SandboxBackend` seam; a Docker backend ships with the crate
//! - **Lifecycle Events:** Clone, start, unfreeze, stop and error events for
//!   downstream consumers

pub mod config;
pub mod core;
pub mod error;
pub mod runtime;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result};
pub use sandbox::{ActivityTrackingConn, Fingerprint, Inbound, SandboxPool};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
