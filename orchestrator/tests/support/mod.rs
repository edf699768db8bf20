//! In-memory stand-in for ports, worker processes and the host process table.
//!
//! A launched fake worker "binds" its port immediately, so the allocator's
//! ground truth and the readiness probe both see it, and "unbinds" when it
//! exits. Nothing touches real sockets or processes.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use orchestrator::{
    ports::{AllocatorConfig, PortAllocator, PortProbe},
    readiness::{LivenessCheck, ProbeConfig, ReadinessProbe},
    workers::{
        launch::{LaunchSpec, LaunchTemplate, WorkerLauncher, WorkerProcess},
        processes::{MarkerArgMatcher, ProcessInfo, ProcessTable},
        SupervisorConfig, WorkerPlatform, WorkerSupervisor,
    },
};

pub const ORCHESTRATOR_PID: u32 = 1000;

#[derive(Debug, Clone)]
struct FakeProc {
    port: u16,
    parent_pid: Option<u32>,
    args: Vec<String>,
    exited: bool,
}

#[derive(Default)]
struct WorldState {
    bound: HashSet<u16>,
    unhealthy: HashSet<u16>,
    processes: BTreeMap<u32, FakeProc>,
    next_pid: u32,
    launches: Vec<LaunchSpec>,
    fail_spawns: usize,
    stall_launches: usize,
    ignore_sigterm: bool,
    killed: Vec<u32>,
    terminated: Vec<u32>,
}

impl WorldState {
    fn exit(&mut self, pid: u32) {
        if let Some(process) = self.processes.get_mut(&pid) {
            if !process.exited {
                process.exited = true;
                self.bound.remove(&process.port);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeWorld {
    state: Arc<Mutex<WorldState>>,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        let world = Self::default();
        world.state.lock().unwrap().next_pid = 5000;
        Arc::new(world)
    }

    /// Something outside the orchestrator is listening on `port`.
    pub fn bind_external(&self, port: u16) {
        self.state.lock().unwrap().bound.insert(port);
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.state.lock().unwrap().bound.contains(&port)
    }

    /// The next `n` launches fail to spawn.
    pub fn fail_next_spawns(&self, n: usize) {
        self.state.lock().unwrap().fail_spawns = n;
    }

    /// The next `n` launched workers never bind their port.
    pub fn stall_next_launches(&self, n: usize) {
        self.state.lock().unwrap().stall_launches = n;
    }

    /// Workers stay up after SIGTERM and only die when killed.
    pub fn ignore_sigterm(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_sigterm = ignore;
    }

    /// The worker on `port` keeps its socket but stops answering probes.
    pub fn hang(&self, port: u16) {
        self.state.lock().unwrap().unhealthy.insert(port);
    }

    /// A stalled worker on `port` finally binds.
    pub fn finish_binding(&self, port: u16) {
        self.state.lock().unwrap().bound.insert(port);
    }

    /// The live worker on `port` dies without being asked to.
    pub fn crash(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        let pid = state
            .processes
            .iter()
            .find(|(_, p)| p.port == port && !p.exited)
            .map(|(pid, _)| *pid);
        if let Some(pid) = pid {
            state.exit(pid);
        }
    }

    /// A worker process from an earlier orchestrator run, not our child.
    pub fn add_stray_worker(&self, pid: u32, identity: &str, tenant_id: &str) {
        self.state.lock().unwrap().processes.insert(
            pid,
            FakeProc {
                port: 0,
                parent_pid: Some(1),
                args: vec![
                    "step-worker".to_string(),
                    "--journey-worker".to_string(),
                    identity.to_string(),
                    "--tenant".to_string(),
                    tenant_id.to_string(),
                ],
                exited: false,
            },
        );
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().unwrap().launches.len()
    }

    pub fn live_workers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| !p.exited)
            .count()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn platform(self: &Arc<Self>) -> WorkerPlatform {
        WorkerPlatform {
            launcher: self.clone(),
            processes: self.clone(),
            matcher: Arc::new(MarkerArgMatcher::default()),
        }
    }
}

#[async_trait]
impl PortProbe for FakeWorld {
    async fn is_available(&self, port: u16) -> bool {
        !self.state.lock().unwrap().bound.contains(&port)
    }
}

#[async_trait]
impl LivenessCheck for FakeWorld {
    async fn is_live(&self, port: u16) -> bool {
        let state = self.state.lock().unwrap();
        state.bound.contains(&port) && !state.unhealthy.contains(&port)
    }
}

#[async_trait]
impl WorkerLauncher for FakeWorld {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>> {
        let mut state = self.state.lock().unwrap();
        state.launches.push(spec.clone());

        if state.fail_spawns > 0 {
            state.fail_spawns -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such worker binary"));
        }

        let port: u16 = spec
            .env
            .get("PORT")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "PORT missing"))?;

        if state.stall_launches > 0 {
            state.stall_launches -= 1;
        } else {
            state.bound.insert(port);
        }
        state.unhealthy.remove(&port);

        let pid = state.next_pid;
        state.next_pid += 1;
        let mut args = vec![spec.program.to_string_lossy().into_owned()];
        args.extend(spec.args.iter().cloned());
        state.processes.insert(
            pid,
            FakeProc {
                port,
                parent_pid: Some(ORCHESTRATOR_PID),
                args,
                exited: false,
            },
        );

        Ok(Box::new(FakeProcess {
            pid,
            state: Arc::clone(&self.state),
        }))
    }
}

impl ProcessTable for FakeWorld {
    fn current_pid(&self) -> u32 {
        ORCHESTRATOR_PID
    }

    fn list(&self) -> Vec<ProcessInfo> {
        self.state
            .lock()
            .unwrap()
            .processes
            .iter()
            .filter(|(_, p)| !p.exited)
            .map(|(pid, p)| ProcessInfo {
                pid: *pid,
                parent_pid: p.parent_pid,
                args: p.args.clone(),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        let alive = state.processes.get(&pid).is_some_and(|p| !p.exited);
        if alive {
            state.terminated.push(pid);
            state.exit(pid);
        }
        alive
    }
}

struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<WorldState>>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.state
            .lock()
            .unwrap()
            .processes
            .get(&self.pid)
            .map_or(true, |p| p.exited)
    }

    fn signal_terminate(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.ignore_sigterm {
            state.exit(self.pid);
        }
        Ok(())
    }

    async fn wait_for_exit(&mut self, _grace: Duration) -> bool {
        self.has_exited()
    }

    async fn kill(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(self.pid);
        state.exit(self.pid);
        Ok(())
    }
}

pub fn fast_probe_config() -> ProbeConfig {
    ProbeConfig {
        interval: Duration::from_millis(5),
        startup_timeout: Duration::from_millis(100),
        sweep_timeout: Duration::from_millis(50),
    }
}

pub fn test_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        launch: LaunchTemplate::default(),
        stop_grace: Duration::from_millis(50),
        idle_timeout: None,
        metrics_window: 10,
    }
}

pub fn test_allocator_config(start: u16, end: u16) -> AllocatorConfig {
    AllocatorConfig {
        range_start: start,
        range_end: end,
        preferences_file: None,
        stale_grace: Duration::from_secs(10),
    }
}

pub async fn build_supervisor(
    world: &Arc<FakeWorld>,
    allocator_config: AllocatorConfig,
    probe_config: ProbeConfig,
    config: SupervisorConfig,
) -> Arc<WorkerSupervisor> {
    let allocator = PortAllocator::open(allocator_config, world.clone())
        .await
        .expect("Failed to open allocator");
    let probe = ReadinessProbe::new(probe_config, world.clone());
    WorkerSupervisor::new(config, allocator, probe, world.platform())
}

pub async fn supervisor_with(
    world: &Arc<FakeWorld>,
    range: (u16, u16),
    config: SupervisorConfig,
) -> Arc<WorkerSupervisor> {
    build_supervisor(
        world,
        test_allocator_config(range.0, range.1),
        fast_probe_config(),
        config,
    )
    .await
}

pub async fn supervisor(world: &Arc<FakeWorld>, range: (u16, u16)) -> Arc<WorkerSupervisor> {
    supervisor_with(world, range, test_supervisor_config()).await
}
