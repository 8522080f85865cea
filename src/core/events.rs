//! Lifecycle events and the sinks that receive them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Kind of lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEventKind {
    /// A new instance was cloned from a template
    SandboxCloned { name: String, template: String },
    /// An instance was started
    SandboxStarted { name: String },
    /// A frozen instance was resumed
    SandboxUnfrozen { name: String, ip: Option<IpAddr> },
    /// An idle instance was stopped
    SandboxStopped { name: String },
    /// A lifecycle operation failed
    SandboxError { name: String, error: String },
}

/// A timestamped lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SandboxEventKind,
}

impl SandboxEvent {
    fn now(kind: SandboxEventKind) -> Self {
        SandboxEvent {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn cloned(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self::now(SandboxEventKind::SandboxCloned {
            name: name.into(),
            template: template.into(),
        })
    }

    pub fn started(name: impl Into<String>) -> Self {
        Self::now(SandboxEventKind::SandboxStarted { name: name.into() })
    }

    pub fn unfrozen(name: impl Into<String>, ip: Option<IpAddr>) -> Self {
        Self::now(SandboxEventKind::SandboxUnfrozen {
            name: name.into(),
            ip,
        })
    }

    pub fn stopped(name: impl Into<String>) -> Self {
        Self::now(SandboxEventKind::SandboxStopped { name: name.into() })
    }

    pub fn error(name: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::now(SandboxEventKind::SandboxError {
            name: name.into(),
            error: error.to_string(),
        })
    }

    /// Name of the sandbox the event is about
    pub fn sandbox_name(&self) -> &str {
        match &self.kind {
            SandboxEventKind::SandboxCloned { name, .. }
            | SandboxEventKind::SandboxStarted { name }
            | SandboxEventKind::SandboxUnfrozen { name, .. }
            | SandboxEventKind::SandboxStopped { name }
            | SandboxEventKind::SandboxError { name, .. } => name,
        }
    }
}

/// Receiver of lifecycle notifications
pub trait EventSink: Send + Sync {
    fn send(&self, event: SandboxEvent);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: SandboxEvent) {}
}

/// Logs every event as a JSON line through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn send(&self, event: SandboxEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => info!(target: "honeypool::events", sandbox = event.sandbox_name(), "{}", line),
            Err(e) => warn!("Failed to serialize event for {}: {}", event.sandbox_name(), e),
        }
    }
}

/// Forwards events into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SandboxEvent>,
}

impl ChannelSink {
    /// Create a sink together with the receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: SandboxEvent) {
        // receiver gone means nobody is interested any more
        let _ = self.tx.send(event);
    }
}
