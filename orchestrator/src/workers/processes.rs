//! Process enumeration and worker matching for orphan sweeps.
//!
//! Which processes count as "ours" is decided by a [`WorkerMatcher`], so the
//! rule can differ per platform without touching the sweep itself.

use std::collections::HashSet;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::{debug, info};

use super::launch::{TENANT_ARG, WORKER_MARKER_ARG};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub args: Vec<String>,
}

pub trait ProcessTable: Send + Sync {
    fn current_pid(&self) -> u32;

    fn list(&self) -> Vec<ProcessInfo>;

    /// Best-effort graceful termination. True if a signal was delivered.
    fn terminate(&self, pid: u32) -> bool;
}

pub trait WorkerMatcher: Send + Sync {
    fn is_worker(&self, process: &ProcessInfo) -> bool;

    fn tenant_of(&self, process: &ProcessInfo) -> Option<String>;
}

/// Matches processes launched with [`WORKER_MARKER_ARG`] and reads the tenant
/// from [`TENANT_ARG`].
#[derive(Debug, Clone)]
pub struct MarkerArgMatcher {
    marker: String,
    tenant_flag: String,
}

impl MarkerArgMatcher {
    pub fn new(marker: impl Into<String>, tenant_flag: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            tenant_flag: tenant_flag.into(),
        }
    }
}

impl Default for MarkerArgMatcher {
    fn default() -> Self {
        Self::new(WORKER_MARKER_ARG, TENANT_ARG)
    }
}

impl WorkerMatcher for MarkerArgMatcher {
    fn is_worker(&self, process: &ProcessInfo) -> bool {
        process.args.iter().any(|arg| arg == &self.marker)
    }

    fn tenant_of(&self, process: &ProcessInfo) -> Option<String> {
        process
            .args
            .windows(2)
            .find(|pair| pair[0] == self.tenant_flag)
            .map(|pair| pair[1].clone())
    }
}

/// Host process table backed by `sysinfo`.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn list(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                args: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            None => false,
        }
    }
}

/// Which worker processes a sweep should terminate.
#[derive(Debug, Clone, Default)]
pub struct SweepFilter {
    /// Pids the supervisor still tracks; never touched.
    pub tracked: HashSet<u32>,
    /// Restrict to one tenant.
    pub tenant_id: Option<String>,
    /// Leave direct children of this process alone (startup orphan sweep).
    pub skip_children: bool,
}

/// Terminate every worker-like process selected by `filter`. Failures are
/// logged and skipped.
pub fn terminate_untracked(
    table: &dyn ProcessTable,
    matcher: &dyn WorkerMatcher,
    filter: &SweepFilter,
) -> usize {
    let me = table.current_pid();
    let victims: Vec<ProcessInfo> = table
        .list()
        .into_iter()
        .filter(|p| p.pid != me && !filter.tracked.contains(&p.pid))
        .filter(|p| matcher.is_worker(p))
        .filter(|p| !(filter.skip_children && p.parent_pid == Some(me)))
        .filter(|p| match &filter.tenant_id {
            Some(tenant) => matcher.tenant_of(p).as_deref() == Some(tenant.as_str()),
            None => true,
        })
        .collect();

    let mut terminated = 0;
    for process in victims {
        if table.terminate(process.pid) {
            info!(pid = process.pid, args = ?process.args, "terminated untracked worker process");
            terminated += 1;
        } else {
            debug!(pid = process.pid, "untracked worker already gone");
        }
    }
    terminated
}
