//! Idle housekeeping
//!
//! One housekeeper task runs per active sandbox. Every poll interval it
//! looks at how long the sandbox has been idle and moves it down one tier:
//! running sandboxes are frozen after `freeze_after`, frozen sandboxes are
//! stopped after `stop_after`. After a stop the task ends; the next
//! `Sandbox::ensure_ready` arms a fresh one.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::SandboxEvent;
use crate::sandbox::instance::{Sandbox, SandboxInner, SandboxState};

/// What the housekeeper does after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Continue,
    Done,
}

pub(crate) fn spawn(sandbox: Arc<Sandbox>) -> JoinHandle<()> {
    tokio::spawn(run(sandbox))
}

async fn run(sandbox: Arc<Sandbox>) {
    info!("Housekeeper ({}) started", sandbox.name());

    let mut shutdown = sandbox.shared.shutdown.clone();
    let mut interval = tokio::time::interval(sandbox.shared.config.idle.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first immediate tick
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait_for(|down| *down) => break,
        }

        if tick(&sandbox).await == Tick::Done {
            break;
        }
    }

    info!("Housekeeper ({}) stopped", sandbox.name());
}

/// Evaluate idle time once and apply at most one tier transition
pub(crate) async fn tick(sandbox: &Sandbox) -> Tick {
    let idle_config = sandbox.shared.config.idle;
    let mut guard = sandbox.inner.lock().await;
    let inner = &mut *guard;
    let idle = inner.idle_for();

    debug!(
        "Sandbox {}: idle for {:?} with current state {}",
        sandbox.name(),
        idle,
        inner.state
    );

    match inner.state {
        SandboxState::Running if idle >= idle_config.freeze_after => {
            let Some(handle) = inner.handle.as_mut() else {
                return Tick::Continue;
            };

            info!("Sandbox {}: idle for {:?}, freezing", sandbox.name(), idle);
            match handle.freeze().await {
                Ok(()) => {
                    inner.state = SandboxState::Frozen;
                    Tick::Continue
                }
                Err(e) => {
                    error!("Could not freeze sandbox {}: {}", sandbox.name(), e);
                    sandbox.shared.events.send(SandboxEvent::error(sandbox.name(), &e));
                    recover(sandbox, inner).await
                }
            }
        }
        SandboxState::Frozen if idle >= idle_config.stop_after => {
            let Some(handle) = inner.handle.as_mut() else {
                return Tick::Continue;
            };

            info!("Sandbox {}: idle for {:?}, stopping", sandbox.name(), idle);
            match handle.stop().await {
                Ok(()) => {
                    inner.state = SandboxState::Stopped;
                    retire(sandbox, inner)
                }
                Err(e) => {
                    error!("Could not stop sandbox {}: {}", sandbox.name(), e);
                    sandbox.shared.events.send(SandboxEvent::error(sandbox.name(), &e));
                    recover(sandbox, inner).await
                }
            }
        }
        // nothing left to reclaim
        SandboxState::Stopped | SandboxState::Unprovisioned => {
            inner.housekeeper = None;
            Tick::Done
        }
        _ => Tick::Continue,
    }
}

/// After a failed transition, follow the runtime if it already stopped the instance
async fn recover(sandbox: &Sandbox, inner: &mut SandboxInner) -> Tick {
    sandbox.resync(inner).await;
    if inner.state == SandboxState::Stopped {
        warn!("Sandbox {} stopped outside the housekeeper", sandbox.name());
        return retire(sandbox, inner);
    }
    Tick::Continue
}

/// Forget the runtime handle of a stopped sandbox and release the housekeeper slot
fn retire(sandbox: &Sandbox, inner: &mut SandboxInner) -> Tick {
    inner.handle = None;
    inner.ip = None;
    inner.device = None;
    inner.housekeeper = None;
    sandbox.shared.events.send(SandboxEvent::stopped(sandbox.name()));
    Tick::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdleThresholds, SandboxConfig};
    use crate::core::{ChannelSink, EventSink, NullSink, RuntimeState, SandboxBackend, SandboxEventKind};
    use crate::sandbox::instance::Shared;
    use crate::sandbox::testing::FakeBackend;
    use crate::sandbox::Fingerprint;
    use std::time::Duration;
    use tokio::sync::watch;

    const MINUTE: Duration = Duration::from_secs(60);

    fn sandbox(backend: &FakeBackend, events: Arc<dyn EventSink>) -> (Arc<Sandbox>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let mut config = SandboxConfig::default();
        config.template = "alpine".to_string();
        config.idle = IdleThresholds::new(15 * MINUTE, 30 * MINUTE, MINUTE);
        let shared = Arc::new(Shared {
            config,
            backend: Arc::new(backend.clone()),
            events,
            shutdown: rx,
        });
        let fp = Fingerprint::from_ip("203.0.113.50".parse().unwrap());
        (Arc::new(Sandbox::new(fp, shared)), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_progression() {
        let backend = FakeBackend::new();
        let (sink, mut rx) = ChannelSink::new();
        let (sandbox, _tx) = sandbox(&backend, Arc::new(sink));

        sandbox.ensure_ready().await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Running);

        tokio::time::sleep(16 * MINUTE).await;
        assert_eq!(sandbox.state().await, SandboxState::Frozen);
        assert_eq!(backend.count("freeze"), 1);
        assert!(sandbox.housekeeper_active().await);

        tokio::time::sleep(15 * MINUTE).await;
        assert_eq!(sandbox.state().await, SandboxState::Stopped);
        assert_eq!(backend.count("stop"), 1);
        assert_eq!(backend.runtime_state(sandbox.name()), Some(RuntimeState::Stopped));

        tokio::task::yield_now().await;
        assert!(!sandbox.housekeeper_active().await);

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert!(matches!(kinds.last(), Some(SandboxEventKind::SandboxStopped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_stopped_from_running() {
        let backend = FakeBackend::new();
        backend.fail_always("freeze");
        let (sandbox, _tx) = sandbox(&backend, Arc::new(NullSink));

        sandbox.ensure_ready().await.unwrap();
        tokio::time::sleep(45 * MINUTE).await;

        // freezing keeps failing, so the sandbox never reaches the stop tier
        assert_eq!(sandbox.state().await, SandboxState::Running);
        assert_eq!(backend.count("stop"), 0);
        assert!(backend.count("freeze") > 1);
        assert!(sandbox.housekeeper_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_keeps_watching() {
        let backend = FakeBackend::new();
        backend.fail_next("stop");
        let (sandbox, _tx) = sandbox(&backend, Arc::new(NullSink));

        sandbox.ensure_ready().await.unwrap();
        tokio::time::sleep(30 * MINUTE + 30 * Duration::from_secs(1)).await;
        assert_eq!(sandbox.state().await, SandboxState::Frozen);
        assert!(sandbox.housekeeper_active().await);

        tokio::time::sleep(MINUTE).await;
        assert_eq!(sandbox.state().await, SandboxState::Stopped);
        assert_eq!(backend.count("stop"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearmed_after_stop() {
        let backend = FakeBackend::new();
        let (sandbox, _tx) = sandbox(&backend, Arc::new(NullSink));

        sandbox.ensure_ready().await.unwrap();
        tokio::time::sleep(31 * MINUTE).await;
        assert_eq!(sandbox.state().await, SandboxState::Stopped);

        sandbox.ensure_ready().await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Running);
        assert!(sandbox.housekeeper_active().await);
        // stopped instance is started again rather than cloned
        assert_eq!(backend.count("clone"), 1);
        assert_eq!(backend.count("start"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_instance_is_recloned() {
        let backend = FakeBackend::new();
        let (sandbox, _tx) = sandbox(&backend, Arc::new(NullSink));

        sandbox.ensure_ready().await.unwrap();
        tokio::time::sleep(31 * MINUTE).await;
        backend.destroy(sandbox.name());

        sandbox.ensure_ready().await.unwrap();
        assert_eq!(backend.count("clone"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_housekeeper() {
        let backend = FakeBackend::new();
        let (sandbox, _tx) = sandbox(&backend, Arc::new(NullSink));

        for _ in 0..10 {
            sandbox.ensure_ready().await.unwrap();
        }
        tokio::time::sleep(16 * MINUTE).await;

        // a second housekeeper would have raced to freeze as well
        assert_eq!(backend.count("freeze"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_housekeeper() {
        let backend = FakeBackend::new();
        let (sandbox, tx) = sandbox(&backend, Arc::new(NullSink));

        sandbox.ensure_ready().await.unwrap();
        assert!(sandbox.housekeeper_active().await);

        tx.send(true).unwrap();
        tokio::time::sleep(MINUTE).await;
        assert!(!sandbox.housekeeper_active().await);
        assert_eq!(sandbox.state().await, SandboxState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_instance_is_retired() {
        let backend = FakeBackend::new();
        let (sink, mut rx) = ChannelSink::new();
        let (sandbox, _tx) = sandbox(&backend, Arc::new(sink));

        sandbox.ensure_ready().await.unwrap();
        tokio::time::sleep(16 * MINUTE).await;
        assert_eq!(sandbox.state().await, SandboxState::Frozen);

        // removed by an operator while frozen: stopping it can only fail
        backend.destroy(sandbox.name());
        tokio::time::sleep(15 * MINUTE).await;
        tokio::task::yield_now().await;

        assert_eq!(sandbox.state().await, SandboxState::Stopped);
        assert!(!sandbox.housekeeper_active().await);
        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert!(matches!(kinds.last(), Some(SandboxEventKind::SandboxStopped { .. })));

        sandbox.ensure_ready().await.unwrap();
        assert_eq!(backend.count("clone"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tick_releases_slot() {
        let backend = FakeBackend::new();
        let (fresh, _tx) = sandbox(&backend, Arc::new(NullSink));
        backend.insert_instance(fresh.name(), RuntimeState::Frozen);
        let handle = backend.lookup(fresh.name()).await.unwrap().unwrap();
        let sandbox = Arc::new(Sandbox::adopted(
            fresh.fingerprint(),
            Arc::clone(&fresh.shared),
            handle,
            RuntimeState::Frozen,
        ));

        // a loop that has not noticed its exit yet still counts as active
        sandbox.inner.lock().await.housekeeper = Some(tokio::spawn(std::future::pending()));
        tokio::time::sleep(31 * MINUTE).await;

        assert_eq!(tick(&sandbox).await, Tick::Done);
        assert!(!sandbox.housekeeper_active().await);

        sandbox.ensure_ready().await.unwrap();
        assert_eq!(sandbox.state().await, SandboxState::Running);
        assert!(sandbox.housekeeper_active().await);
    }
}
