//! Shared types between the orchestrator and operator tooling
//!
//! These types are used by both:
//! - The orchestrator admin API (native Rust)
//! - Dashboards and scripts that read worker status (TypeScript bindings)
//!
//! Serializable with serde for JSON over HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Tenant Context
// ============================================================================

/// Classification attributes a caller associates with a worker request.
///
/// Only `domain` and `category` take part in the restart policy; see
/// [`TenantContext::same_classification`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct TenantContext {
    /// Tenant (company) the worker runs on behalf of
    pub tenant_id: String,

    /// Business domain, e.g. "retail" or "www.bt.com"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Industry or journey category, e.g. "telecom"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            domain: None,
            category: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// True when a worker started with `self` can serve a request made with
    /// `other` without a restart.
    pub fn same_classification(&self, other: &TenantContext) -> bool {
        self.tenant_id == other.tenant_id
            && self.domain == other.domain
            && self.category == other.category
    }
}

// ============================================================================
// Worker Lifecycle
// ============================================================================

/// Health of a tracked worker instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "orchestrator.ts")]
pub enum WorkerHealth {
    /// Spawned, readiness probe not yet passed
    Starting,
    /// Readiness probe passed
    Ready,
    /// Readiness timed out or a health probe failed
    Degraded,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Starting => write!(f, "starting"),
            WorkerHealth::Ready => write!(f, "ready"),
            WorkerHealth::Degraded => write!(f, "degraded"),
        }
    }
}

/// Why an existing worker was replaced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "orchestrator.ts")]
pub enum RestartReason {
    /// Same task and tenant, different classification tags
    TenantMismatch,
    /// The process exited on its own
    ProcessExited,
    /// The worker stopped answering its liveness probe
    Unhealthy,
    /// The allocator no longer records the worker's port as its own
    PortReclaimed,
}

/// What `ensure_running` had to do to satisfy a request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export, export_to = "orchestrator.ts")]
pub enum StartOutcome {
    Reused,
    Started,
    Restarted { reason: RestartReason },
}

// ============================================================================
// Admin API Bodies
// ============================================================================

/// POST /admin/workers/ensure
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct EnsureWorkerRequest {
    pub task_name: String,
    pub tenant: TenantContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct EnsureWorkerResponse {
    pub identity: String,
    pub port: u16,
    pub outcome: StartOutcome,
}

/// POST /admin/workers/{identity}/requests
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct RecordRequestBody {
    pub response_time_ms: u64,
    #[serde(default)]
    pub is_error: bool,
}

/// Result of a bulk teardown
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct TeardownReport {
    /// Tracked instances that were stopped
    pub workers_stopped: usize,
    /// Allocator records released after the instances were gone
    pub ports_released: usize,
    /// Untracked worker processes that were signalled
    pub orphans_terminated: usize,
}

// ============================================================================
// Status / Diagnostics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct WorkerStatus {
    pub identity: String,
    pub instance_id: String,
    pub task_name: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub health: WorkerHealth,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub request_count: u64,
    pub error_count: u64,
    /// Mean over the recent sample window; `None` before the first sample
    pub avg_response_time_ms: Option<f64>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct TenantWorkers {
    pub tenant_id: String,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct PortAllocationInfo {
    pub port: u16,
    pub owner_key: String,
    pub tenant_id: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct AllocatorStatus {
    pub range_start: u16,
    pub range_end: u16,
    pub total: usize,
    pub allocated: usize,
    pub pending: usize,
    pub free: usize,
    pub allocations: Vec<PortAllocationInfo>,
}

// ============================================================================
// Tests
// ============================================================================
