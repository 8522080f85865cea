//! In-memory backend for lifecycle tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::{IsolationProfile, RuntimeState, SandboxBackend, SandboxRuntime};
use crate::error::{Error, Result};

#[derive(Default)]
struct World {
    instances: HashMap<String, RuntimeState>,
    calls: Vec<String>,
    fail_next: HashSet<String>,
    fail_always: HashSet<String>,
    ip: Option<IpAddr>,
}

impl World {
    /// Record a call and decide whether it should fail
    fn record(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        if self.fail_always.contains(op) || self.fail_next.remove(op) {
            return Err(Error::Runtime(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

/// Records every runtime call and lets tests inject failures per operation
#[derive(Clone)]
pub(crate) struct FakeBackend {
    world: Arc<Mutex<World>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        let world = World {
            ip: Some(IpAddr::from([127, 0, 0, 1])),
            ..World::default()
        };
        FakeBackend {
            world: Arc::new(Mutex::new(world)),
        }
    }

    fn world(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.world().calls.iter().filter(|c| *c == op).count()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.world().calls.clone()
    }

    pub(crate) fn insert_instance(&self, name: &str, state: RuntimeState) {
        self.world().instances.insert(name.to_string(), state);
    }

    /// Remove an instance behind the pool's back
    pub(crate) fn destroy(&self, name: &str) {
        self.world().instances.remove(name);
    }

    pub(crate) fn set_ip(&self, ip: Option<IpAddr>) {
        self.world().ip = ip;
    }

    pub(crate) fn fail_next(&self, op: &str) {
        self.world().fail_next.insert(op.to_string());
    }

    pub(crate) fn fail_always(&self, op: &str) {
        self.world().fail_always.insert(op.to_string());
    }

    pub(crate) fn runtime_state(&self, name: &str) -> Option<RuntimeState> {
        self.world().instances.get(name).copied()
    }

    fn handle(&self, name: &str) -> Box<dyn SandboxRuntime> {
        Box::new(FakeRuntime {
            name: name.to_string(),
            world: Arc::clone(&self.world),
        })
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn lookup(&self, name: &str) -> Result<Option<Box<dyn SandboxRuntime>>> {
        let mut world = self.world();
        world.record("lookup")?;
        Ok(world.instances.contains_key(name).then(|| self.handle(name)))
    }

    async fn clone_instance(&self, name: &str, _template: &str) -> Result<Box<dyn SandboxRuntime>> {
        let mut world = self.world();
        world.record("clone")?;
        world.instances.insert(name.to_string(), RuntimeState::Stopped);
        Ok(self.handle(name))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut world = self.world();
        world.record("list")?;
        let mut names: Vec<String> = world.instances.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

struct FakeRuntime {
    name: String,
    world: Arc<Mutex<World>>,
}

impl FakeRuntime {
    /// Move the instance to `to`, refusing if it is not in `from` when given
    fn transition(&self, op: &str, from: Option<RuntimeState>, to: RuntimeState) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        world.record(op)?;
        match world.instances.get_mut(&self.name) {
            Some(state) if from.map_or(true, |from| *state == from) => {
                *state = to;
                Ok(())
            }
            Some(state) => Err(Error::Runtime(format!("{}: cannot {} while {:?}", self.name, op, state))),
            None => Err(Error::Runtime(format!("{}: no such instance", self.name))),
        }
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_defined(&self) -> Result<bool> {
        let mut world = self.world.lock().unwrap();
        world.record("is_defined")?;
        Ok(world.instances.contains_key(&self.name))
    }

    async fn configure(&mut self, _profile: &IsolationProfile) -> Result<()> {
        self.world.lock().unwrap().record("configure")
    }

    async fn start(&mut self) -> Result<()> {
        self.transition("start", None, RuntimeState::Running)
    }

    async fn stop(&mut self) -> Result<()> {
        self.transition("stop", None, RuntimeState::Stopped)
    }

    async fn freeze(&mut self) -> Result<()> {
        self.transition("freeze", Some(RuntimeState::Running), RuntimeState::Frozen)
    }

    async fn unfreeze(&mut self) -> Result<()> {
        self.transition("unfreeze", Some(RuntimeState::Frozen), RuntimeState::Running)
    }

    async fn state(&self) -> Result<RuntimeState> {
        let mut world = self.world.lock().unwrap();
        world.record("state")?;
        world
            .instances
            .get(&self.name)
            .copied()
            .ok_or_else(|| Error::Runtime(format!("{}: no such instance", self.name)))
    }

    async fn wait_for_state(&self, target: RuntimeState, _timeout: Duration) -> Result<bool> {
        let mut world = self.world.lock().unwrap();
        world.record("wait")?;
        Ok(world.instances.get(&self.name) == Some(&target))
    }

    async fn ip_addresses(&self, _interface: &str) -> Result<Vec<IpAddr>> {
        let mut world = self.world.lock().unwrap();
        world.record("ip")?;
        Ok(world.ip.into_iter().collect())
    }

    async fn network_device(&self, index: usize) -> Result<String> {
        self.world.lock().unwrap().record("device")?;
        Ok(format!("veth-fake{}", index))
    }
}
