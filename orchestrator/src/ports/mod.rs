//! Port allocator for worker processes.
//!
//! Owns a fixed inclusive port range. Bookkeeping (allocations, pending
//! reservations, preferred ports) sits behind one async mutex that is never
//! held across a bind check; a port is marked pending before it is probed so
//! concurrent scans skip it. Calls for the same owner key are serialized by a
//! per-owner gate, so a second caller sees the first caller's result.

pub mod availability;
pub mod preferences;

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::RangeInclusive,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared_types::{AllocatorStatus, PortAllocationInfo};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

pub use availability::{PortProbe, TcpBindProbe};
pub use preferences::{PreferenceStore, PreferenceStoreError};

/// Owner recorded for ports found bound by a process we did not start.
pub const UNKNOWN_OWNER: &str = "unknown";

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub range_start: u16,
    /// Inclusive.
    pub range_end: u16,
    /// Where preferred ports are persisted. `None` keeps them in memory only.
    pub preferences_file: Option<PathBuf>,
    /// Allocations younger than this are never reclaimed by a stale sweep.
    pub stale_grace: Duration,
}

impl AllocatorConfig {
    pub fn range(&self) -> RangeInclusive<u16> {
        self.range_start..=self.range_end
    }

    pub fn total(&self) -> usize {
        if self.range_start > self.range_end {
            0
        } else {
            usize::from(self.range_end - self.range_start) + 1
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            range_start: 8081,
            range_end: 8199,
            preferences_file: None,
            stale_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("no free port in {range_start}-{range_end} ({allocated} allocated, {pending} pending)")]
    Exhausted {
        range_start: u16,
        range_end: u16,
        allocated: usize,
        pending: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    #[error("port {0} is not allocated")]
    NotAllocated(u16),
    #[error("port {port} is owned by {actual}, refusing release by {expected}")]
    OwnershipMismatch {
        port: u16,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    pub owner_key: String,
    pub tenant_id: String,
    pub allocated_at: DateTime<Utc>,
    since: Instant,
    /// Exempt from stale cleanup regardless of age.
    pinned: bool,
}

impl PortAllocation {
    fn new(port: u16, owner_key: &str, tenant_id: &str) -> Self {
        Self {
            port,
            owner_key: owner_key.to_string(),
            tenant_id: tenant_id.to_string(),
            allocated_at: Utc::now(),
            since: Instant::now(),
            pinned: false,
        }
    }

    fn info(&self) -> PortAllocationInfo {
        PortAllocationInfo {
            port: self.port,
            owner_key: self.owner_key.clone(),
            tenant_id: self.tenant_id.clone(),
            allocated_at: self.allocated_at,
        }
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    allocations: BTreeMap<u16, PortAllocation>,
    pending: BTreeSet<u16>,
    preferred: BTreeMap<String, u16>,
}

impl AllocatorState {
    fn is_tracked(&self, port: u16) -> bool {
        self.allocations.contains_key(&port) || self.pending.contains(&port)
    }

    fn port_of(&self, owner_key: &str) -> Option<u16> {
        if owner_key == UNKNOWN_OWNER {
            return None;
        }
        self.allocations
            .values()
            .find(|a| a.owner_key == owner_key)
            .map(|a| a.port)
    }

    /// Persisted hints overlaid with every live, attributable allocation.
    fn merged_preferences(&self) -> BTreeMap<String, u16> {
        let mut merged = self.preferred.clone();
        for allocation in self.allocations.values() {
            if allocation.owner_key != UNKNOWN_OWNER {
                merged.insert(allocation.owner_key.clone(), allocation.port);
            }
        }
        merged
    }
}

pub struct PortAllocator {
    config: AllocatorConfig,
    probe: Arc<dyn PortProbe>,
    store: Option<PreferenceStore>,
    state: Mutex<AllocatorState>,
    owner_gates: DashMap<String, Arc<Mutex<()>>>,
    persist_lock: Mutex<()>,
}

impl PortAllocator {
    /// Build an allocator, loading persisted port preferences if configured.
    pub async fn open(
        config: AllocatorConfig,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Arc<Self>, PreferenceStoreError> {
        let store = config.preferences_file.clone().map(PreferenceStore::new);
        let preferred = match &store {
            Some(store) => store.load().await?,
            None => BTreeMap::new(),
        };

        info!(
            range_start = config.range_start,
            range_end = config.range_end,
            preferred = preferred.len(),
            "port allocator ready"
        );

        Ok(Arc::new(Self {
            config,
            probe,
            store,
            state: Mutex::new(AllocatorState {
                preferred,
                ..AllocatorState::default()
            }),
            owner_gates: DashMap::new(),
            persist_lock: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub async fn is_available(&self, port: u16) -> bool {
        self.probe.is_available(port).await
    }

    /// Lowest port that is untracked and passes the bind check. Does not
    /// reserve it.
    pub async fn find_free(&self) -> Result<u16, AllocatorError> {
        let port = self.claim_with_cleanup().await?;
        self.state.lock().await.pending.remove(&port);
        Ok(port)
    }

    /// Return the port owned by `owner_key`, allocating one if needed.
    pub async fn allocate(&self, owner_key: &str, tenant_id: &str) -> Result<u16, AllocatorError> {
        let gate = self.owner_gate(owner_key);
        let result = {
            let _serial = gate.lock().await;
            self.allocate_serialized(owner_key, tenant_id).await
        };
        // Two references: ours and the table's. Anyone else is still waiting.
        self.owner_gates
            .remove_if(owner_key, |_, g| Arc::strong_count(g) == 2);
        result
    }

    async fn allocate_serialized(
        &self,
        owner_key: &str,
        tenant_id: &str,
    ) -> Result<u16, AllocatorError> {
        let preferred = {
            let state = self.state.lock().await;
            if let Some(port) = state.port_of(owner_key) {
                debug!(owner_key, port, "owner already holds a port");
                return Ok(port);
            }
            state.preferred.get(owner_key).copied()
        };

        let reserved = match preferred {
            Some(port) => self.try_reserve(port).await,
            None => None,
        };
        let port = match reserved {
            Some(port) => port,
            None => self.claim_with_cleanup().await?,
        };

        {
            let mut state = self.state.lock().await;
            state.pending.remove(&port);
            state
                .allocations
                .insert(port, PortAllocation::new(port, owner_key, tenant_id));
            state.preferred.insert(owner_key.to_string(), port);
        }
        info!(
            owner_key,
            tenant_id,
            port,
            preferred = reserved.is_some(),
            "port allocated"
        );

        self.persist().await;
        Ok(port)
    }

    /// Release `port`. With `expected_owner`, the release is refused unless
    /// the record belongs to that owner. The owner's preferred port is kept.
    pub async fn try_release(
        &self,
        port: u16,
        expected_owner: Option<&str>,
    ) -> Result<PortAllocation, ReleaseError> {
        let mut state = self.state.lock().await;
        let current = state
            .allocations
            .get(&port)
            .ok_or(ReleaseError::NotAllocated(port))?;

        if let Some(expected) = expected_owner {
            if current.owner_key != expected {
                return Err(ReleaseError::OwnershipMismatch {
                    port,
                    expected: expected.to_string(),
                    actual: current.owner_key.clone(),
                });
            }
        }

        state
            .allocations
            .remove(&port)
            .ok_or(ReleaseError::NotAllocated(port))
    }

    /// Exempt `port` from stale cleanup (or lift the exemption). Only the
    /// recorded owner may change it. True if the record was updated.
    pub async fn set_pinned(&self, port: u16, owner_key: &str, pinned: bool) -> bool {
        let mut state = self.state.lock().await;
        match state.allocations.get_mut(&port) {
            Some(allocation) if allocation.owner_key == owner_key => {
                allocation.pinned = pinned;
                true
            }
            _ => false,
        }
    }

    pub async fn release(&self, port: u16, expected_owner: Option<&str>) -> bool {
        match self.try_release(port, expected_owner).await {
            Ok(allocation) => {
                info!(port, owner_key = %allocation.owner_key, "port released");
                true
            }
            Err(ReleaseError::NotAllocated(_)) => {
                debug!(port, "release of untracked port ignored");
                false
            }
            Err(e) => {
                warn!(port, "{e}");
                false
            }
        }
    }

    /// Release every allocation recorded for `tenant_id`.
    pub async fn release_tenant(&self, tenant_id: &str) -> Vec<u16> {
        let mut state = self.state.lock().await;
        let ports: Vec<u16> = state
            .allocations
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .map(|a| a.port)
            .collect();
        for port in &ports {
            state.allocations.remove(port);
        }
        if !ports.is_empty() {
            info!(tenant_id, ports = ?ports, "released tenant ports");
        }
        ports
    }

    pub async fn release_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let count = state.allocations.len();
        state.allocations.clear();
        if count > 0 {
            info!(count, "released all ports");
        }
        count
    }

    /// Release tracked allocations whose port is actually free.
    pub async fn cleanup_stale(&self) -> usize {
        let candidates: Vec<PortAllocation> = {
            let state = self.state.lock().await;
            state
                .allocations
                .values()
                .filter(|a| !a.pinned && a.since.elapsed() >= self.config.stale_grace)
                .cloned()
                .collect()
        };

        let mut reclaimed = 0;
        for allocation in candidates {
            if !self.probe.is_available(allocation.port).await {
                continue;
            }
            let mut state = self.state.lock().await;
            // Skip if the port changed hands while we were probing.
            if state.allocations.get(&allocation.port) == Some(&allocation) {
                state.allocations.remove(&allocation.port);
                reclaimed += 1;
                info!(
                    port = allocation.port,
                    owner_key = %allocation.owner_key,
                    "reclaimed stale port allocation"
                );
            }
        }
        reclaimed
    }

    pub async fn status(&self) -> AllocatorStatus {
        let state = self.state.lock().await;
        let total = self.config.total();
        let allocated = state.allocations.len();
        let pending = state.pending.len();
        AllocatorStatus {
            range_start: self.config.range_start,
            range_end: self.config.range_end,
            total,
            allocated,
            pending,
            free: total.saturating_sub(allocated + pending),
            allocations: state.allocations.values().map(PortAllocation::info).collect(),
        }
    }

    pub async fn owner_of(&self, port: u16) -> Option<String> {
        let state = self.state.lock().await;
        state.allocations.get(&port).map(|a| a.owner_key.clone())
    }

    pub async fn preferred_port(&self, owner_key: &str) -> Option<u16> {
        self.state.lock().await.preferred.get(owner_key).copied()
    }

    /// Background task: reclaim stale allocations every `period`.
    pub async fn run_stale_sweeper(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            let reclaimed = self.cleanup_stale().await;
            if reclaimed > 0 {
                info!(reclaimed, "stale port sweep reclaimed allocations");
            }
        }
    }

    fn owner_gate(&self, owner_key: &str) -> Arc<Mutex<()>> {
        self.owner_gates
            .entry(owner_key.to_string())
            .or_default()
            .clone()
    }

    /// Mark `port` pending if untracked, then confirm it can be bound.
    async fn try_reserve(&self, port: u16) -> Option<u16> {
        if !self.config.range().contains(&port) {
            return None;
        }
        {
            let mut state = self.state.lock().await;
            if state.is_tracked(port) {
                return None;
            }
            state.pending.insert(port);
        }
        if self.probe.is_available(port).await {
            return Some(port);
        }
        self.state.lock().await.pending.remove(&port);
        debug!(port, "preferred port is busy");
        None
    }

    /// Scan for the lowest untracked port and leave it marked pending. Ports
    /// that fail the bind check are adopted as [`UNKNOWN_OWNER`], so every
    /// iteration shrinks the candidate set.
    async fn claim_free_port(&self) -> Option<u16> {
        loop {
            let port = {
                let mut state = self.state.lock().await;
                let next = self.config.range().find(|p| !state.is_tracked(*p))?;
                state.pending.insert(next);
                next
            };

            if self.probe.is_available(port).await {
                return Some(port);
            }

            let mut state = self.state.lock().await;
            state.pending.remove(&port);
            state
                .allocations
                .insert(port, PortAllocation::new(port, UNKNOWN_OWNER, UNKNOWN_OWNER));
            warn!(port, "port held by an untracked process, adopting as unknown");
        }
    }

    async fn claim_with_cleanup(&self) -> Result<u16, AllocatorError> {
        if let Some(port) = self.claim_free_port().await {
            return Ok(port);
        }

        let reclaimed = self.cleanup_stale().await;
        warn!(reclaimed, "port range exhausted, rescanning after stale cleanup");
        if let Some(port) = self.claim_free_port().await {
            return Ok(port);
        }

        let state = self.state.lock().await;
        Err(AllocatorError::Exhausted {
            range_start: self.config.range_start,
            range_end: self.config.range_end,
            allocated: state.allocations.len(),
            pending: state.pending.len(),
        })
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _write = self.persist_lock.lock().await;
        let snapshot = self.state.lock().await.merged_preferences();
        if let Err(e) = store.save(&snapshot).await {
            warn!("failed to persist port preferences: {e}");
        }
    }
}
