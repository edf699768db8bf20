//! Typed launch specification and the process-spawn seam.

use std::{collections::BTreeMap, io, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use shared_types::TenantContext;
use tokio::process::{Child, Command};
use ulid::Ulid;

use crate::identity::WorkerIdentity;

/// Argument that marks a process as a journey worker. Followed by the identity.
pub const WORKER_MARKER_ARG: &str = "--journey-worker";
/// Argument carrying the tenant id, used to scope orphan sweeps.
pub const TENANT_ARG: &str = "--tenant";

/// Static part of every worker launch, taken from configuration.
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self {
            program: PathBuf::from("step-worker"),
            args: Vec::new(),
            working_dir: None,
            extra_env: BTreeMap::new(),
        }
    }
}

/// Everything needed to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn for_worker(
        template: &LaunchTemplate,
        identity: &WorkerIdentity,
        instance_id: Ulid,
        task_name: &str,
        tenant: &TenantContext,
        port: u16,
    ) -> Self {
        let mut args = template.args.clone();
        args.extend([
            WORKER_MARKER_ARG.to_string(),
            identity.to_string(),
            TENANT_ARG.to_string(),
            tenant.tenant_id.clone(),
        ]);

        let mut env = template.extra_env.clone();
        env.insert("PORT".into(), port.to_string());
        env.insert("WORKER_IDENTITY".into(), identity.to_string());
        env.insert("WORKER_INSTANCE_ID".into(), instance_id.to_string());
        env.insert("WORKER_TASK".into(), task_name.to_string());
        env.insert("TENANT_ID".into(), tenant.tenant_id.clone());
        if let Some(domain) = &tenant.domain {
            env.insert("TENANT_DOMAIN".into(), domain.clone());
        }
        if let Some(category) = &tenant.category {
            env.insert("TENANT_CATEGORY".into(), category.clone());
        }

        Self {
            program: template.program.clone(),
            args,
            env,
            working_dir: template.working_dir.clone(),
        }
    }
}

/// Handle to a spawned worker.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn has_exited(&mut self) -> bool;

    /// Ask the process to shut down (SIGTERM on unix).
    fn signal_terminate(&mut self) -> io::Result<()>;

    /// Wait up to `grace` for the process to exit. True if it did.
    async fn wait_for_exit(&mut self, grace: Duration) -> bool;

    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>>;
}

/// Spawns workers as OS child processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher;

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn signal_terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            self.child.start_kill()
        }
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.child.wait()).await.is_ok()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}
