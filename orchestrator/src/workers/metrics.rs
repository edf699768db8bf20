use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared_types::WorkerHealth;

/// Per-identity request counters and a bounded window of response times.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_health: Option<WorkerHealth>,
    samples: VecDeque<u64>,
    capacity: usize,
}

impl WorkerMetrics {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            request_count: 0,
            error_count: 0,
            last_probe_at: None,
            last_health: None,
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, response_time_ms: u64, is_error: bool) {
        self.request_count += 1;
        if is_error {
            self.error_count += 1;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(response_time_ms);
    }

    pub fn record_probe(&mut self, health: WorkerHealth) {
        self.last_probe_at = Some(Utc::now());
        self.last_health = Some(health);
    }

    pub fn avg_response_time_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: u128 = self.samples.iter().map(|&ms| u128::from(ms)).sum();
        Some(total as f64 / self.samples.len() as f64)
    }

    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }
}
