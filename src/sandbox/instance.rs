//! Sandbox lifecycle state machine
//!
//! A `Sandbox` wraps one runtime handle and moves it through
//! `Unprovisioned -> Running <-> Frozen -> Stopped -> Running`. Every
//! transition happens under the sandbox's own lock, so the accepting path
//! and the housekeeper never observe a half-finished transition.

use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SandboxConfig;
use crate::core::{EventSink, RuntimeState, SandboxBackend, SandboxEvent, SandboxRuntime};
use crate::error::{Error, Result};
use crate::sandbox::conn::{SandboxConn, Transport};
use crate::sandbox::fingerprint::Fingerprint;
use crate::sandbox::housekeeper;

/// Lifecycle state of a pooled sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Never provisioned by this process
    Unprovisioned,
    Running,
    Frozen,
    Stopped,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Unprovisioned => write!(f, "unprovisioned"),
            SandboxState::Running => write!(f, "running"),
            SandboxState::Frozen => write!(f, "frozen"),
            SandboxState::Stopped => write!(f, "stopped"),
        }
    }
}

impl From<RuntimeState> for SandboxState {
    fn from(state: RuntimeState) -> Self {
        match state {
            RuntimeState::Running => SandboxState::Running,
            RuntimeState::Frozen => SandboxState::Frozen,
            RuntimeState::Stopped => SandboxState::Stopped,
        }
    }
}

/// Point-in-time view of a sandbox
#[derive(Debug, Clone, Serialize)]
pub struct SandboxDetail {
    pub name: String,
    pub fingerprint: String,
    pub template: String,
    pub state: SandboxState,
    pub ip: Option<IpAddr>,
    pub device: Option<String>,
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
    pub housekeeper_active: bool,
}

/// Pool-wide collaborators shared by every sandbox
pub(crate) struct Shared {
    pub(crate) config: SandboxConfig,
    pub(crate) backend: Arc<dyn SandboxBackend>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Mutable part of a sandbox, only touched with the lock held
pub(crate) struct SandboxInner {
    pub(crate) handle: Option<Box<dyn SandboxRuntime>>,
    pub(crate) state: SandboxState,
    pub(crate) last_active: Instant,
    pub(crate) ip: Option<IpAddr>,
    pub(crate) device: Option<String>,
    pub(crate) housekeeper: Option<JoinHandle<()>>,
}

impl SandboxInner {
    /// Refresh the idle clock; never moves backwards
    pub(crate) fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_active {
            self.last_active = now;
        }
    }

    pub(crate) fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_active)
    }

    fn housekeeper_active(&self) -> bool {
        self.housekeeper.as_ref().map_or(false, |h| !h.is_finished())
    }
}

/// One isolated environment bound to one peer fingerprint
pub struct Sandbox {
    name: String,
    fingerprint: Fingerprint,
    pub(crate) shared: Arc<Shared>,
    pub(crate) inner: Mutex<SandboxInner>,
}

impl Sandbox {
    pub(crate) fn new(fingerprint: Fingerprint, shared: Arc<Shared>) -> Self {
        Self::with_handle(fingerprint, shared, None, SandboxState::Unprovisioned)
    }

    /// Wrap an instance that already exists in the backend
    pub(crate) fn adopted(
        fingerprint: Fingerprint,
        shared: Arc<Shared>,
        handle: Box<dyn SandboxRuntime>,
        state: RuntimeState,
    ) -> Self {
        Self::with_handle(fingerprint, shared, Some(handle), state.into())
    }

    fn with_handle(
        fingerprint: Fingerprint,
        shared: Arc<Shared>,
        handle: Option<Box<dyn SandboxRuntime>>,
        state: SandboxState,
    ) -> Self {
        Sandbox {
            name: fingerprint.sandbox_name(&shared.config.name_prefix),
            fingerprint,
            inner: Mutex::new(SandboxInner {
                handle,
                state,
                last_active: Instant::now(),
                ip: None,
                device: None,
                housekeeper: None,
            }),
            shared,
        }
    }

    /// External name of the sandbox
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn template(&self) -> &str {
        &self.shared.config.template
    }

    pub async fn state(&self) -> SandboxState {
        self.inner.lock().await.state
    }

    /// Time since the last recorded activity
    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.idle_for()
    }

    /// Whether a housekeeper task is currently watching this sandbox
    pub async fn housekeeper_active(&self) -> bool {
        self.inner.lock().await.housekeeper_active()
    }

    pub async fn detail(&self) -> SandboxDetail {
        let inner = self.inner.lock().await;
        SandboxDetail {
            name: self.name.clone(),
            fingerprint: self.fingerprint.to_string(),
            template: self.template().to_string(),
            state: inner.state,
            ip: inner.ip,
            device: inner.device.clone(),
            idle: inner.idle_for(),
            housekeeper_active: inner.housekeeper_active(),
        }
    }

    /// Bring the sandbox into a usable running state and refresh its idle clock.
    ///
    /// Frozen sandboxes are unfrozen, stopped or unprovisioned ones are
    /// provisioned, running ones only have their activity refreshed. A
    /// housekeeper is armed whenever the sandbox ends up running.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let before = inner.state;
        let mut result = self.advance(inner).await;

        // the runtime may have moved on behind our back; retry once from its view
        if let Err(Error::Provision { .. }) = result {
            self.resync(inner).await;
            if inner.state != before {
                info!(
                    "Sandbox {} is {} in the runtime, retrying from there",
                    self.name, inner.state
                );
                result = self.advance(inner).await;
            }
        }

        if inner.state == SandboxState::Running {
            self.arm_housekeeper(inner);
        }

        match result {
            Err(Error::Cancelled(ref reason)) => {
                debug!("Preparing sandbox {} cancelled: {}", self.name, reason);
            }
            Err(ref e) => {
                error!("Error preparing sandbox {}: {}", self.name, e);
                self.shared.events.send(SandboxEvent::error(&self.name, e));
            }
            Ok(()) => {}
        }

        result
    }

    /// One step towards Running from the tracked state
    async fn advance(&self, inner: &mut SandboxInner) -> Result<()> {
        match inner.state {
            SandboxState::Running if inner.ip.is_some() => {
                inner.touch();
                Ok(())
            }
            // running but a previous settle never found an address
            SandboxState::Running => self.settle(inner).await,
            SandboxState::Frozen => self.unfreeze(inner).await,
            SandboxState::Unprovisioned | SandboxState::Stopped => self.provision(inner).await,
        }
    }

    /// Replace the tracked state with what the runtime reports.
    ///
    /// A vanished instance drops the handle and counts as stopped, so the
    /// next provision clones it again.
    pub(crate) async fn resync(&self, inner: &mut SandboxInner) {
        let Some(handle) = inner.handle.as_ref() else {
            return;
        };

        let live = match handle.is_defined().await {
            Ok(true) => match handle.state().await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Could not query state of sandbox {}: {}", self.name, e);
                    return;
                }
            },
            Ok(false) => None,
            Err(e) => {
                warn!("Could not look up instance of sandbox {}: {}", self.name, e);
                return;
            }
        };

        let state = match live {
            Some(state) => SandboxState::from(state),
            None => {
                warn!("Instance backing {} is gone", self.name);
                inner.handle = None;
                SandboxState::Stopped
            }
        };

        if state != inner.state {
            debug!("Sandbox {}: tracked {}, runtime reports {}", self.name, inner.state, state);
            inner.state = state;
        }
        if state != SandboxState::Running {
            inner.ip = None;
            inner.device = None;
        }
    }

    /// Arm the housekeeper if the sandbox is running or frozen
    pub(crate) async fn arm(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        if matches!(guard.state, SandboxState::Running | SandboxState::Frozen) {
            self.arm_housekeeper(&mut guard);
        }
    }

    fn arm_housekeeper(self: &Arc<Self>, inner: &mut SandboxInner) {
        if inner.housekeeper_active() || self.shared.is_shutting_down() {
            return;
        }
        inner.housekeeper = Some(housekeeper::spawn(Arc::clone(self)));
    }

    async fn provision(&self, inner: &mut SandboxInner) -> Result<()> {
        info!(
            "Provisioning sandbox {} from template {}",
            self.name, self.shared.config.template
        );

        let existing = match inner.handle.take() {
            Some(handle) => {
                if handle.is_defined().await.map_err(|e| self.provision_error(e))? {
                    Some(handle)
                } else {
                    warn!("Instance backing {} is gone, cloning again", self.name);
                    None
                }
            }
            None => None,
        };

        let mut handle = match existing {
            Some(handle) => handle,
            None => self.open_or_clone().await?,
        };

        // a looked-up instance may already be running or paused
        let live = match handle.state().await {
            Ok(state) => state,
            Err(e) => {
                inner.handle = Some(handle);
                return Err(self.provision_error(e));
            }
        };

        match live {
            RuntimeState::Frozen => {
                inner.handle = Some(handle);
                inner.state = SandboxState::Frozen;
                self.unfreeze(inner).await
            }
            RuntimeState::Running => {
                debug!("Instance backing {} is already running", self.name);
                inner.handle = Some(handle);
                inner.state = SandboxState::Running;
                inner.touch();
                self.settle(inner).await
            }
            RuntimeState::Stopped => {
                inner.touch();
                let started = handle.start().await;
                inner.handle = Some(handle);
                started.map_err(|e| self.provision_error(e))?;

                inner.state = SandboxState::Running;
                inner.touch();
                self.shared.events.send(SandboxEvent::started(&self.name));

                self.settle(inner).await
            }
        }
    }

    async fn open_or_clone(&self) -> Result<Box<dyn SandboxRuntime>> {
        let backend = &self.shared.backend;
        let template = &self.shared.config.template;

        if let Some(handle) = backend
            .lookup(&self.name)
            .await
            .map_err(|e| self.provision_error(e))?
        {
            debug!("Reusing existing {} instance {}", backend.name(), self.name);
            return Ok(handle);
        }

        debug!("Creating new sandbox {} from template {}", self.name, template);

        let mut handle = backend
            .clone_instance(&self.name, template)
            .await
            .map_err(|e| self.provision_error(e))?;
        handle
            .configure(&self.shared.config.isolation)
            .await
            .map_err(|e| self.provision_error(e))?;

        self.shared
            .events
            .send(SandboxEvent::cloned(&self.name, template));

        Ok(handle)
    }

    async fn unfreeze(&self, inner: &mut SandboxInner) -> Result<()> {
        info!("Unfreezing sandbox {}", self.name);

        let handle = inner.handle.as_mut().ok_or_else(|| {
            Error::Internal(format!("frozen sandbox {} has no runtime handle", self.name))
        })?;
        handle.unfreeze().await.map_err(|e| self.provision_error(e))?;

        inner.state = SandboxState::Running;
        inner.touch();

        self.settle(inner).await?;

        self.shared
            .events
            .send(SandboxEvent::unfrozen(&self.name, inner.ip));
        Ok(())
    }

    /// Wait until the sandbox runs and has an address, then resolve its device
    async fn settle(&self, inner: &mut SandboxInner) -> Result<()> {
        let policy = &self.shared.config.settle;
        let handle = inner.handle.as_ref().ok_or_else(|| {
            Error::Internal(format!("running sandbox {} has no runtime handle", self.name))
        })?;

        info!("Waiting for sandbox {} to settle", self.name);

        let running = self
            .cancellable(handle.wait_for_state(RuntimeState::Running, policy.running_timeout))
            .await?
            .map_err(|e| self.settle_error(e))?;
        if !running {
            return Err(self.settle_error(format!(
                "still not running after {:?}",
                policy.running_timeout
            )));
        }

        let mut retries = 0;
        let ip = loop {
            match handle.ip_addresses(&policy.interface).await {
                Ok(ips) if !ips.is_empty() => break ips[0],
                Ok(_) => debug!("Waiting for ip to settle {} (no address yet)", self.name),
                Err(e) => debug!("Waiting for ip to settle {} ({})", self.name, e),
            }

            if retries >= policy.address_retries {
                inner.ip = None;
                return Err(self.settle_error(format!(
                    "could not get an IP address on {}",
                    policy.interface
                )));
            }
            retries += 1;
            self.cancellable(tokio::time::sleep(policy.retry_backoff)).await?;
        };
        debug!("Got ip {} for {}", ip, self.name);

        // only used for traffic capture, so a missing device is not fatal
        let device = match handle.network_device(policy.device_index).await {
            Ok(device) => {
                debug!("Using network device {} for {}", device, self.name);
                Some(device)
            }
            Err(e) => {
                warn!("Could not resolve network device of {}: {}", self.name, e);
                None
            }
        };

        inner.ip = Some(ip);
        inner.device = device;
        inner.touch();
        Ok(())
    }

    /// Connect to `port` inside the sandbox.
    ///
    /// Retries with a fixed backoff to cover the gap between the sandbox
    /// reporting an address and its services listening. Each attempt is
    /// bounded by `connect_timeout` and all of them together by
    /// `dial_retries * retry_backoff`.
    pub async fn dial(&self, transport: Transport, port: u16) -> Result<SandboxConn> {
        self.dial_with(transport, port, SandboxConn::connect).await
    }

    pub(crate) async fn dial_with<F, Fut>(
        &self,
        transport: Transport,
        port: u16,
        connect: F,
    ) -> Result<SandboxConn>
    where
        F: Fn(Transport, SocketAddr) -> Fut,
        Fut: Future<Output = io::Result<SandboxConn>>,
    {
        let ip = {
            let inner = self.inner.lock().await;
            match (inner.state, inner.ip) {
                (SandboxState::Running, Some(ip)) => ip,
                (state, _) => {
                    return Err(Error::Dial {
                        name: self.name.clone(),
                        addr: format!("<unknown>:{}", port),
                        reason: format!("sandbox is {} without a known address", state),
                    })
                }
            }
        };

        let addr = SocketAddr::new(ip, port);
        let policy = &self.shared.config.settle;
        let budget = (policy.retry_backoff * policy.dial_retries).max(policy.connect_timeout);
        let deadline = Instant::now() + budget;
        let mut retries = 0;

        loop {
            let limit = policy
                .connect_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let reason = match self
                .cancellable(tokio::time::timeout(limit, connect(transport, addr)))
                .await?
            {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {:?}", limit),
            };

            if retries >= policy.dial_retries || Instant::now() + policy.retry_backoff > deadline {
                return Err(Error::Dial {
                    name: self.name.clone(),
                    addr: format!("{}/{}", addr, transport),
                    reason,
                });
            }

            debug!("Waiting for sandbox {} to be fully started ({})", self.name, reason);
            retries += 1;
            self.cancellable(tokio::time::sleep(policy.retry_backoff)).await?;
        }
    }

    /// Run `fut` unless the pool shuts down first
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output> {
        let mut shutdown = self.shared.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(Error::Cancelled(format!("sandbox {}: pool is shutting down", self.name)));
        }

        tokio::select! {
            out = fut => Ok(out),
            _ = shutdown.wait_for(|down| *down) => {
                Err(Error::Cancelled(format!("sandbox {}: pool is shutting down", self.name)))
            }
        }
    }

    fn provision_error(&self, reason: impl std::fmt::Display) -> Error {
        Error::Provision {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn settle_error(&self, reason: impl std::fmt::Display) -> Error {
        Error::SettleTimeout {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.name)
            .field("template", &self.shared.config.template)
            .finish()
    }
}
