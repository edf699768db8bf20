use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{
    ports::AllocatorConfig,
    readiness::ProbeConfig,
    workers::{launch::LaunchTemplate, SupervisorConfig},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// `GET <path>` must return 2xx.
    Http { path: String },
    /// A TCP connect must succeed.
    Tcp,
}

impl ProbeKind {
    fn from_env(kind: &str, path: String) -> anyhow::Result<Self> {
        match kind {
            "http" => Ok(Self::Http { path }),
            "tcp" => Ok(Self::Tcp),
            other => Err(anyhow::anyhow!(
                "Invalid HEALTH_PROBE_KIND '{other}'. Expected 'http' or 'tcp'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the admin API listens on
    pub port: u16,
    /// Host workers bind to and are probed on
    pub worker_host: IpAddr,
    /// First port handed to workers
    pub worker_port_start: u16,
    /// Last port handed to workers (inclusive)
    pub worker_port_end: u16,
    /// Path to the worker binary
    pub worker_binary: String,
    /// Extra arguments passed to every worker before the identity marker
    pub worker_args: Vec<String>,
    /// Working directory for spawned workers
    pub worker_workdir: Option<PathBuf>,
    /// Extra environment passed to every worker
    pub worker_extra_env: BTreeMap<String, String>,
    /// Where preferred ports survive restarts
    pub port_preferences_file: Option<PathBuf>,
    /// How long a new worker has to pass its readiness probe
    pub readiness_timeout: Duration,
    /// Delay between readiness attempts
    pub readiness_interval: Duration,
    /// Budget for one health-sweep probe
    pub health_probe_timeout: Duration,
    pub health_probe: ProbeKind,
    /// Period of the health sweep + idle reaper
    pub health_sweep_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub worker_stop_grace: Duration,
    /// How long a worker can be idle before it is stopped (`None` = never)
    pub worker_idle_timeout: Option<Duration>,
    /// Response-time samples kept per worker
    pub metrics_window: usize,
    /// Minimum age before an allocation may be reclaimed as stale
    pub stale_allocation_grace: Duration,
    /// Period of the background stale-port sweep
    pub stale_sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let worker_port_start = env_parse("WORKER_PORT_RANGE_START", 8081)?;
        let worker_port_end = env_parse("WORKER_PORT_RANGE_END", 8199)?;
        if worker_port_start > worker_port_end {
            return Err(anyhow::anyhow!(
                "WORKER_PORT_RANGE_START ({worker_port_start}) is above WORKER_PORT_RANGE_END ({worker_port_end})"
            ));
        }

        let idle_secs: u64 = env_parse("WORKER_IDLE_TIMEOUT_SECS", 1800)?;
        let preferences = env_str("PORT_PREFERENCES_FILE", "./data/port-preferences.json");

        Ok(Self {
            port: env_parse("ORCHESTRATOR_PORT", 9090)?,
            worker_host: env_parse("WORKER_BIND_HOST", IpAddr::from([127, 0, 0, 1]))?,
            worker_port_start,
            worker_port_end,
            worker_binary: {
                // Default: workspace root /target/debug/step-worker (resolved at compile time).
                // Override with WORKER_BINARY env var.
                if let Ok(v) = std::env::var("WORKER_BINARY") {
                    v
                } else {
                    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| PathBuf::from("."));
                    workspace_root
                        .join("target/debug/step-worker")
                        .to_string_lossy()
                        .to_string()
                }
            },
            worker_args: env_csv("WORKER_ARGS", &[]),
            worker_workdir: std::env::var("WORKER_WORKDIR").ok().map(PathBuf::from),
            worker_extra_env: parse_env_pairs(&env_csv("WORKER_EXTRA_ENV", &[]))?,
            // An empty value keeps preferences in memory only.
            port_preferences_file: (!preferences.is_empty()).then(|| PathBuf::from(preferences)),
            readiness_timeout: Duration::from_millis(env_parse("READINESS_TIMEOUT_MS", 15_000)?),
            readiness_interval: Duration::from_millis(env_parse("READINESS_INTERVAL_MS", 100)?),
            health_probe_timeout: Duration::from_millis(env_parse(
                "HEALTH_PROBE_TIMEOUT_MS",
                2_000,
            )?),
            health_probe: ProbeKind::from_env(
                &env_str("HEALTH_PROBE_KIND", "http"),
                env_str("HEALTH_PROBE_PATH", "/health"),
            )?,
            health_sweep_interval: Duration::from_secs(env_parse(
                "HEALTH_SWEEP_INTERVAL_SECS",
                30,
            )?),
            worker_stop_grace: Duration::from_millis(env_parse("WORKER_STOP_GRACE_MS", 5_000)?),
            worker_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            metrics_window: env_parse("METRICS_WINDOW", 100)?,
            stale_allocation_grace: Duration::from_secs(env_parse(
                "STALE_ALLOCATION_GRACE_SECS",
                10,
            )?),
            stale_sweep_interval: Duration::from_secs(env_parse("STALE_SWEEP_INTERVAL_SECS", 60)?),
        })
    }

    pub fn allocator(&self) -> AllocatorConfig {
        AllocatorConfig {
            range_start: self.worker_port_start,
            range_end: self.worker_port_end,
            preferences_file: self.port_preferences_file.clone(),
            stale_grace: self.stale_allocation_grace,
        }
    }

    pub fn probe(&self) -> ProbeConfig {
        ProbeConfig {
            interval: self.readiness_interval,
            startup_timeout: self.readiness_timeout,
            sweep_timeout: self.health_probe_timeout,
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            launch: LaunchTemplate {
                program: PathBuf::from(&self.worker_binary),
                args: self.worker_args.clone(),
                working_dir: self.worker_workdir.clone(),
                extra_env: self.worker_extra_env.clone(),
            },
            stop_grace: self.worker_stop_grace,
            idle_timeout: self.worker_idle_timeout,
            metrics_window: self.metrics_window,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| anyhow::anyhow!("Invalid WORKER_EXTRA_ENV entry '{pair}'. Expected KEY=VALUE"))
        })
        .collect()
}
