// Endpoint health tracking
// Per-URL circuit breaker with exponential backoff plus a round-robin
// cursor for pool selection. All record/query operations are O(1) under a
// single mutex; the cursor is a bare atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            reset_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EndpointHealth {
    failures: u32,
    consecutive_failures: u32,
    circuit_open: bool,
    next_retry_at: Option<Instant>,
    last_success_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

/// Shared health table. One instance per process; clones of the Arc are
/// handed to request handlers.
pub struct EndpointHealthManager {
    settings: CircuitBreakerSettings,
    endpoints: Mutex<HashMap<String, EndpointHealth>>,
    cursor: AtomicUsize,
}

impl EndpointHealthManager {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            endpoints: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Register a pool's endpoints. Idempotent; existing state is kept.
    pub fn initialize_endpoints(&self, urls: &[String]) {
        let mut table = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        for url in urls {
            table.entry(url.clone()).or_default();
        }
    }

    pub fn record_success(&self, url: &str) {
        let mut table = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        let entry = table.entry(url.to_string()).or_default();
        entry.failures = 0;
        entry.consecutive_failures = 0;
        entry.circuit_open = false;
        entry.next_retry_at = None;
        entry.last_success_at = Some(Instant::now());
    }

    pub fn record_failure(&self, url: &str) {
        let now = Instant::now();
        let mut table = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        let entry = table.entry(url.to_string()).or_default();
        entry.failures += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(now);

        if entry.failures >= self.settings.failure_threshold {
            entry.circuit_open = true;
            let exceeded = entry.failures - self.settings.failure_threshold;
            let backoff = exponential_backoff(
                self.settings.backoff,
                self.settings.max_backoff,
                exceeded,
            );
            entry.next_retry_at = Some(now + backoff);
            log::warn!(
                "circuit open for {} after {} failures; retry in {:?}",
                url,
                entry.failures,
                backoff
            );
        }
    }

    /// Healthy means the circuit is closed, or the backoff window elapsed
    /// (the endpoint is then offered as a probe).
    pub fn is_healthy(&self, url: &str) -> bool {
        let now = Instant::now();
        let mut table = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        let entry = table.entry(url.to_string()).or_default();

        // Quiet endpoints decay back to a clean slate.
        if !entry.circuit_open && entry.failures > 0 {
            let last_failure_stale = entry
                .last_failure_at
                .map(|t| now.duration_since(t) > self.settings.reset_timeout)
                .unwrap_or(true);
            let success_stale = entry
                .last_success_at
                .map(|t| now.duration_since(t) > self.settings.reset_timeout)
                .unwrap_or(true);
            if last_failure_stale && success_stale {
                entry.failures = 0;
                entry.consecutive_failures = 0;
            }
        }

        if !entry.circuit_open {
            return true;
        }
        match entry.next_retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Round-robin selection of the first healthy endpoint. When nothing is
    /// healthy the cursor's endpoint is returned anyway so callers always
    /// get a URL to try.
    pub fn healthy_endpoint(&self, pool: &[String]) -> Option<String> {
        if pool.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..pool.len() {
            let candidate = &pool[(start + offset) % pool.len()];
            if self.is_healthy(candidate) {
                return Some(candidate.clone());
            }
        }
        Some(pool[start % pool.len()].clone())
    }

    /// Snapshot for diagnostics: (failures, circuit_open).
    pub fn snapshot(&self, url: &str) -> (u32, bool) {
        let table = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        table
            .get(url)
            .map(|e| (e.failures, e.circuit_open))
            .unwrap_or((0, false))
    }
}

fn exponential_backoff(base: Duration, max: Duration, exceeded: u32) -> Duration {
    // Cap the shift so the multiplication cannot overflow.
    let shift = exceeded.min(16);
    let scaled = base.saturating_mul(1u32 << shift);
    scaled.min(max)
}
