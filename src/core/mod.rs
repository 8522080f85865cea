//! Core module - Fundamental traits and types for Honeypool
//!
//! This module defines the abstractions at the edges of the pool:
//! - Runtime traits for the isolation technology backing a sandbox
//! - Event types and sinks for lifecycle notifications
//!
//! Backends and sinks implement these traits so the sandbox state machine
//! never depends on a concrete technology.

pub mod events;
pub mod runtime;

// Re-export core traits for convenient access
pub use events::{ChannelSink, EventSink, NullSink, SandboxEvent, SandboxEventKind, TracingSink};
pub use runtime::{IsolationProfile, RuntimeState, SandboxBackend, SandboxRuntime};
