//! Sandbox module - Per-peer isolated environments
//!
//! - fingerprint.rs: Stable identity of a remote host
//! - instance.rs: Lifecycle state machine of one sandbox
//! - housekeeper.rs: Idle-tier reclamation (freeze, then stop)
//! - conn.rs: Connections into a sandbox and activity tracking
//! - pool.rs: Fingerprint to sandbox mapping and inbound routing

mod conn;
mod fingerprint;
mod housekeeper;
mod instance;
mod pool;

#[cfg(test)]
pub(crate) mod testing;

pub use conn::{ActivityTrackingConn, SandboxConn, Transport};
pub use fingerprint::Fingerprint;
pub use instance::{Sandbox, SandboxDetail, SandboxState};
pub use pool::{Endpoint, Inbound, SandboxPool, UdpPeer};
