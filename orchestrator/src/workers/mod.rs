//! Worker supervisor.
//!
//! One worker process per (canonical task, tenant) identity. Every lifecycle
//! operation for an identity runs under that identity's gate, so a second
//! `ensure_running` for the same identity waits for the first and then reuses
//! its worker. Different identities never wait on each other.
//!
//! Instance state lives in a `DashMap` that is only touched synchronously;
//! process handles sit behind their own async mutex so status snapshots never
//! block on a spawn, probe or stop in flight.

pub mod launch;
pub mod metrics;
pub mod processes;

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use shared_types::{
    RestartReason, StartOutcome, TeardownReport, TenantContext, TenantWorkers, WorkerHealth,
    WorkerStatus,
};
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::{
    identity::WorkerIdentity,
    ports::{AllocatorError, PortAllocator},
    readiness::ReadinessProbe,
};

use launch::{CommandLauncher, LaunchSpec, LaunchTemplate, WorkerLauncher, WorkerProcess};
use metrics::WorkerMetrics;
use processes::{
    terminate_untracked, MarkerArgMatcher, ProcessTable, SweepFilter, SystemProcessTable,
    WorkerMatcher,
};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchTemplate,
    /// How long a worker gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
    /// Stop workers with no activity for this long. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
    /// Response-time samples kept per identity.
    pub metrics_window: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchTemplate::default(),
            stop_grace: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(1800)),
            metrics_window: 100,
        }
    }
}

/// Platform seams: how workers are spawned and how stray ones are found.
#[derive(Clone)]
pub struct WorkerPlatform {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub processes: Arc<dyn ProcessTable>,
    pub matcher: Arc<dyn WorkerMatcher>,
}

impl WorkerPlatform {
    /// OS child processes, `sysinfo` enumeration, marker-argument matching.
    pub fn system() -> Self {
        Self {
            launcher: Arc::new(CommandLauncher),
            processes: Arc::new(SystemProcessTable),
            matcher: Arc::new(MarkerArgMatcher::default()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no port available for worker {identity}: {source}")]
    Exhausted {
        identity: String,
        #[source]
        source: AllocatorError,
    },
    #[error("failed to spawn worker {identity} on port {port}: {source}")]
    WorkerSpawnFailed {
        identity: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {identity} on port {port} not ready within {timeout_ms}ms")]
    WorkerUnresponsive {
        identity: String,
        port: u16,
        timeout_ms: u64,
    },
}

/// Where a caller can reach the worker, and what it took to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub identity: WorkerIdentity,
    pub port: u16,
    pub outcome: StartOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub restarted: Vec<WorkerIdentity>,
    pub failed: Vec<WorkerIdentity>,
}

#[derive(Clone)]
struct WorkerInstance {
    identity: WorkerIdentity,
    instance_id: Ulid,
    task_name: String,
    tenant: TenantContext,
    port: u16,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    health: WorkerHealth,
    last_activity: Instant,
    process: Arc<Mutex<Box<dyn WorkerProcess>>>,
}

enum Assessment {
    Reuse,
    Replace(RestartReason),
}

enum SweepResult {
    Skipped,
    Healthy,
    Restarted,
    Failed,
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    allocator: Arc<PortAllocator>,
    probe: ReadinessProbe,
    platform: WorkerPlatform,
    instances: DashMap<WorkerIdentity, WorkerInstance>,
    metrics: DashMap<WorkerIdentity, WorkerMetrics>,
    gates: DashMap<WorkerIdentity, Arc<Mutex<()>>>,
}

impl WorkerSupervisor {
    pub fn new(
        config: SupervisorConfig,
        allocator: Arc<PortAllocator>,
        probe: ReadinessProbe,
        platform: WorkerPlatform,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            allocator,
            probe,
            platform,
            instances: DashMap::new(),
            metrics: DashMap::new(),
            gates: DashMap::new(),
        })
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Return the port of a ready worker for `task_name` + `tenant`, starting
    /// or replacing the worker when needed.
    pub async fn ensure_running(
        &self,
        task_name: &str,
        tenant: &TenantContext,
    ) -> Result<WorkerEndpoint, SupervisorError> {
        let identity = WorkerIdentity::derive(task_name, &tenant.tenant_id);
        let gate = self.gate(&identity);
        let _serial = gate.lock().await;

        let mut restart_reason = None;
        if let Some(existing) = self.instance(&identity) {
            match self.assess(&existing, tenant).await {
                Assessment::Reuse => {
                    self.touch(&identity);
                    debug!(%identity, port = existing.port, "reusing worker");
                    return Ok(WorkerEndpoint {
                        identity,
                        port: existing.port,
                        outcome: StartOutcome::Reused,
                    });
                }
                Assessment::Replace(reason) => {
                    self.teardown(&existing).await;
                    restart_reason = Some(reason);
                }
            }
        }

        let port = self.start(&identity, task_name, tenant).await?;
        Ok(WorkerEndpoint {
            identity,
            port,
            outcome: match restart_reason {
                Some(reason) => StartOutcome::Restarted { reason },
                None => StartOutcome::Started,
            },
        })
    }

    /// Stop one worker and forget its instance and metrics.
    pub async fn stop(&self, identity: &WorkerIdentity) -> bool {
        let gate = self.gate(identity);
        let stopped = {
            let _serial = gate.lock().await;
            self.metrics.remove(identity);
            match self.instance(identity) {
                Some(instance) => {
                    self.teardown(&instance).await;
                    info!(%identity, "worker stopped");
                    true
                }
                None => false,
            }
        };
        // Two references: ours and the table's. Anyone else is still waiting.
        self.gates
            .remove_if(identity, |_, g| Arc::strong_count(g) == 2);
        stopped
    }

    /// Stop every worker of `tenant_id`, release all of its ports and kill any
    /// untracked worker process started for it.
    pub async fn stop_all_for_tenant(&self, tenant_id: &str) -> TeardownReport {
        let identities: Vec<WorkerIdentity> = self
            .instances
            .iter()
            .filter(|entry| entry.tenant.tenant_id == tenant_id)
            .map(|entry| entry.key().clone())
            .collect();

        let workers_stopped = self.stop_each(&identities).await;
        self.metrics.retain(|identity, _| identity.tenant_id() != tenant_id);
        let ports_released = self.allocator.release_tenant(tenant_id).await.len();
        let orphans_terminated = self
            .sweep_untracked(SweepFilter {
                tenant_id: Some(tenant_id.to_string()),
                ..SweepFilter::default()
            })
            .await;

        let report = TeardownReport {
            workers_stopped,
            ports_released,
            orphans_terminated,
        };
        info!(tenant_id, ?report, "tenant workers stopped");
        report
    }

    pub async fn stop_all(&self) -> TeardownReport {
        let identities: Vec<WorkerIdentity> =
            self.instances.iter().map(|entry| entry.key().clone()).collect();

        let workers_stopped = self.stop_each(&identities).await;
        self.instances.clear();
        self.metrics.clear();
        let ports_released = self.allocator.release_all().await;
        let orphans_terminated = self.sweep_untracked(SweepFilter::default()).await;

        let report = TeardownReport {
            workers_stopped,
            ports_released,
            orphans_terminated,
        };
        info!(?report, "all workers stopped");
        report
    }

    /// Kill worker processes left behind by a previous orchestrator run.
    pub async fn cleanup_orphans(&self) -> usize {
        let terminated = self
            .sweep_untracked(SweepFilter {
                skip_children: true,
                ..SweepFilter::default()
            })
            .await;
        if terminated > 0 {
            warn!(terminated, "terminated orphaned worker processes");
        }
        terminated
    }

    /// Record one served request. Ignored (false) for identities with no
    /// tracked worker.
    pub fn record_request(
        &self,
        identity: &WorkerIdentity,
        response_time_ms: u64,
        is_error: bool,
    ) -> bool {
        if !self.instances.contains_key(identity) {
            debug!(%identity, "request sample for unknown worker ignored");
            return false;
        }
        self.metrics
            .entry(identity.clone())
            .or_insert_with(|| WorkerMetrics::new(self.config.metrics_window))
            .record(response_time_ms, is_error);
        self.touch(identity);
        true
    }

    pub fn metrics_of(&self, identity: &WorkerIdentity) -> Option<WorkerMetrics> {
        self.metrics.get(identity).map(|m| m.value().clone())
    }

    pub fn health_of(&self, identity: &WorkerIdentity) -> Option<WorkerHealth> {
        self.instances.get(identity).map(|entry| entry.health)
    }

    /// Identities with a lifecycle gate currently in the table.
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Probe every ready worker and restart the ones that stopped answering.
    pub async fn health_sweep(&self) -> SweepReport {
        let ready: Vec<WorkerIdentity> = self
            .instances
            .iter()
            .filter(|entry| entry.health == WorkerHealth::Ready)
            .map(|entry| entry.key().clone())
            .collect();

        let results = join_all(ready.iter().map(|identity| self.sweep_one(identity))).await;

        let mut report = SweepReport::default();
        for (identity, result) in ready.into_iter().zip(results) {
            match result {
                SweepResult::Skipped => continue,
                SweepResult::Healthy => report.healthy += 1,
                SweepResult::Restarted => report.restarted.push(identity),
                SweepResult::Failed => report.failed.push(identity),
            }
            report.checked += 1;
        }
        report
    }

    /// Stop workers that have seen no activity within the idle timeout.
    pub async fn reap_idle(&self) -> Vec<WorkerIdentity> {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return Vec::new();
        };

        let idle: Vec<WorkerIdentity> = self
            .instances
            .iter()
            .filter(|entry| entry.last_activity.elapsed() >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for identity in &idle {
            warn!(%identity, "worker idle timeout, stopping");
            self.stop(identity).await;
        }
        idle
    }

    /// Workers grouped by tenant, for the status endpoint.
    pub fn status(&self) -> Vec<TenantWorkers> {
        let instances: Vec<WorkerInstance> =
            self.instances.iter().map(|entry| entry.value().clone()).collect();

        let mut by_tenant: BTreeMap<String, Vec<WorkerStatus>> = BTreeMap::new();
        for instance in instances {
            let metrics = self.metrics_of(&instance.identity);
            by_tenant
                .entry(instance.tenant.tenant_id.clone())
                .or_default()
                .push(status_row(&instance, metrics.as_ref()));
        }

        by_tenant
            .into_iter()
            .map(|(tenant_id, mut workers)| {
                workers.sort_by(|a, b| a.identity.cmp(&b.identity));
                TenantWorkers { tenant_id, workers }
            })
            .collect()
    }

    /// Background task: health sweep followed by idle reaping, every `period`.
    pub async fn run_health_monitor(self: Arc<Self>, period: Duration) {
        loop {
            sleep(period).await;
            let report = self.health_sweep().await;
            if !report.restarted.is_empty() || !report.failed.is_empty() {
                warn!(
                    checked = report.checked,
                    restarted = report.restarted.len(),
                    failed = report.failed.len(),
                    "health sweep found unhealthy workers"
                );
            }
            self.reap_idle().await;
        }
    }

    fn gate(&self, identity: &WorkerIdentity) -> Arc<Mutex<()>> {
        self.gates.entry(identity.clone()).or_default().clone()
    }

    fn instance(&self, identity: &WorkerIdentity) -> Option<WorkerInstance> {
        self.instances.get(identity).map(|entry| entry.value().clone())
    }

    fn touch(&self, identity: &WorkerIdentity) {
        if let Some(mut entry) = self.instances.get_mut(identity) {
            entry.last_activity = Instant::now();
        }
    }

    fn set_health(&self, identity: &WorkerIdentity, health: WorkerHealth) {
        if let Some(mut entry) = self.instances.get_mut(identity) {
            entry.health = health;
        }
        self.metrics
            .entry(identity.clone())
            .or_insert_with(|| WorkerMetrics::new(self.config.metrics_window))
            .record_probe(health);
    }

    async fn owns_port(&self, identity: &WorkerIdentity, port: u16) -> bool {
        self.allocator.owner_of(port).await.as_deref() == Some(identity.as_str())
    }

    async fn assess(&self, existing: &WorkerInstance, tenant: &TenantContext) -> Assessment {
        let identity = &existing.identity;

        if !existing.tenant.same_classification(tenant) {
            info!(
                %identity,
                event = "tenant_mismatch_restart",
                old = ?existing.tenant,
                new = ?tenant,
                "tenant context changed, replacing worker"
            );
            return Assessment::Replace(RestartReason::TenantMismatch);
        }

        if existing.process.lock().await.has_exited() {
            warn!(%identity, port = existing.port, "worker process exited, restarting");
            return Assessment::Replace(RestartReason::ProcessExited);
        }

        if !self.owns_port(identity, existing.port).await {
            warn!(%identity, port = existing.port, "worker port no longer allocated to it, restarting");
            return Assessment::Replace(RestartReason::PortReclaimed);
        }

        if existing.health == WorkerHealth::Ready {
            return Assessment::Reuse;
        }

        if self.probe.check_once(existing.port).await {
            self.allocator
                .set_pinned(existing.port, identity.as_str(), false)
                .await;
            self.set_health(identity, WorkerHealth::Ready);
            info!(%identity, port = existing.port, "worker recovered");
            return Assessment::Reuse;
        }

        warn!(%identity, port = existing.port, health = %existing.health, "worker unhealthy, restarting");
        Assessment::Replace(RestartReason::Unhealthy)
    }

    /// allocate → spawn → wait for readiness. Caller holds the identity gate.
    async fn start(
        &self,
        identity: &WorkerIdentity,
        task_name: &str,
        tenant: &TenantContext,
    ) -> Result<u16, SupervisorError> {
        let port = self
            .allocator
            .allocate(identity.as_str(), &tenant.tenant_id)
            .await
            .map_err(|source| {
                error!(%identity, "port allocation failed: {source}");
                SupervisorError::Exhausted {
                    identity: identity.to_string(),
                    source,
                }
            })?;

        // Not yet bound, so keep stale sweeps away until it is ready.
        self.allocator
            .set_pinned(port, identity.as_str(), true)
            .await;

        let instance_id = Ulid::new();
        let spec = LaunchSpec::for_worker(
            &self.config.launch,
            identity,
            instance_id,
            task_name,
            tenant,
            port,
        );

        let process = match self.platform.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(source) => {
                error!(
                    %identity,
                    port,
                    program = %spec.program.display(),
                    "failed to spawn worker: {source}"
                );
                self.allocator.release(port, Some(identity.as_str())).await;
                return Err(SupervisorError::WorkerSpawnFailed {
                    identity: identity.to_string(),
                    port,
                    source,
                });
            }
        };

        let pid = process.pid();
        let now = Instant::now();
        self.instances.insert(
            identity.clone(),
            WorkerInstance {
                identity: identity.clone(),
                instance_id,
                task_name: task_name.to_string(),
                tenant: tenant.clone(),
                port,
                pid,
                started_at: Utc::now(),
                started: now,
                health: WorkerHealth::Starting,
                last_activity: now,
                process: Arc::new(Mutex::new(process)),
            },
        );
        info!(%identity, port, ?pid, %instance_id, "worker spawned");

        if self.probe.wait_until_ready(port).await && self.owns_port(identity, port).await {
            self.allocator
                .set_pinned(port, identity.as_str(), false)
                .await;
            self.set_health(identity, WorkerHealth::Ready);
            info!(%identity, port, "worker ready");
            Ok(port)
        } else {
            self.set_health(identity, WorkerHealth::Degraded);
            let timeout_ms = self.probe.config().startup_timeout.as_millis() as u64;
            error!(%identity, port, timeout_ms, "worker did not become ready");
            Err(SupervisorError::WorkerUnresponsive {
                identity: identity.to_string(),
                port,
                timeout_ms,
            })
        }
    }

    /// Signal the process, give its port back, then wait out the grace period
    /// and force-kill if it is still running. Caller holds the identity gate.
    async fn teardown(&self, instance: &WorkerInstance) {
        let identity = &instance.identity;
        self.instances.remove(identity);

        let mut process = instance.process.lock().await;
        if let Err(e) = process.signal_terminate() {
            debug!(%identity, "graceful stop signal failed: {e}");
        }
        self.allocator
            .release(instance.port, Some(identity.as_str()))
            .await;

        if !process.wait_for_exit(self.config.stop_grace).await {
            warn!(%identity, pid = ?instance.pid, "worker ignored graceful stop, killing");
            if let Err(e) = process.kill().await {
                debug!(%identity, "force kill failed: {e}");
            }
        }
    }

    async fn stop_each(&self, identities: &[WorkerIdentity]) -> usize {
        join_all(identities.iter().map(|identity| self.stop(identity)))
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count()
    }

    async fn sweep_one(&self, identity: &WorkerIdentity) -> SweepResult {
        let gate = self.gate(identity);
        let _serial = gate.lock().await;

        let Some(instance) = self.instance(identity) else {
            return SweepResult::Skipped;
        };
        if instance.health != WorkerHealth::Ready {
            return SweepResult::Skipped;
        }

        let exited = instance.process.lock().await.has_exited();
        if !exited
            && self.owns_port(identity, instance.port).await
            && self.probe.check_health(instance.port).await
        {
            self.set_health(identity, WorkerHealth::Ready);
            return SweepResult::Healthy;
        }

        warn!(%identity, port = instance.port, exited, "worker failed health probe, restarting");
        self.set_health(identity, WorkerHealth::Degraded);
        self.teardown(&instance).await;

        match self
            .start(identity, &instance.task_name, &instance.tenant)
            .await
        {
            Ok(port) => {
                info!(%identity, port, "worker restarted after failed health probe");
                SweepResult::Restarted
            }
            Err(e) => {
                error!(%identity, "restart after failed health probe failed: {e}");
                // A failed spawn or allocation leaves no instance behind.
                self.instances
                    .entry(identity.clone())
                    .or_insert_with(|| WorkerInstance {
                        pid: None,
                        health: WorkerHealth::Degraded,
                        ..instance.clone()
                    });
                SweepResult::Failed
            }
        }
    }

    async fn sweep_untracked(&self, mut filter: SweepFilter) -> usize {
        filter.tracked = self
            .instances
            .iter()
            .filter_map(|entry| entry.pid)
            .collect::<HashSet<u32>>();

        let processes = Arc::clone(&self.platform.processes);
        let matcher = Arc::clone(&self.platform.matcher);
        let sweep = tokio::task::spawn_blocking(move || {
            terminate_untracked(processes.as_ref(), matcher.as_ref(), &filter)
        });

        match sweep.await {
            Ok(terminated) => terminated,
            Err(e) => {
                warn!("process sweep task failed: {e}");
                0
            }
        }
    }
}

fn status_row(instance: &WorkerInstance, metrics: Option<&WorkerMetrics>) -> WorkerStatus {
    WorkerStatus {
        identity: instance.identity.to_string(),
        instance_id: instance.instance_id.to_string(),
        task_name: instance.task_name.clone(),
        port: instance.port,
        pid: instance.pid,
        health: instance.health,
        started_at: instance.started_at,
        uptime_secs: instance.started.elapsed().as_secs(),
        request_count: metrics.map(|m| m.request_count).unwrap_or(0),
        error_count: metrics.map(|m| m.error_count).unwrap_or(0),
        avg_response_time_ms: metrics.and_then(WorkerMetrics::avg_response_time_ms),
        last_probe_at: metrics.and_then(|m| m.last_probe_at),
    }
}
