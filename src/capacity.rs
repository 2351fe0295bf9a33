//! # Capacity Manager
//!
//! Per-node accountant of CPU / memory / GPU reservations. Requested and
//! configured resources arrive as strings (`"500m"`, `"2"`, `"1Gb"`) and
//! are parsed once into canonical units; reservations are keyed by
//! `(job, shard)` so replaying an acceptance after a crash never charges
//! the same shard twice.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::job::ResourceUsageConfig;
use crate::types::{FlotillaError, FlotillaResult, JobId, ShardIndex};

/// Canonical resource units: fractional cores, bytes, whole GPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
}

impl ResourceUsage {
    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0.0 && self.memory_bytes == 0 && self.gpu_count == 0
    }

    fn add(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            gpu_count: self.gpu_count + other.gpu_count,
        }
    }

    /// Component-wise `self <= limit`, where a zero limit component means
    /// "no limit" on that axis.
    fn fits_within(&self, limit: &ResourceUsage) -> bool {
        (limit.cpu_cores == 0.0 || self.cpu_cores <= limit.cpu_cores)
            && (limit.memory_bytes == 0 || self.memory_bytes <= limit.memory_bytes)
            && (limit.gpu_count == 0 || self.gpu_count <= limit.gpu_count)
    }
}

/// Parse a CPU request: bare floats (`"2"`, `"0.5"`) or Kubernetes-style
/// millicores (`"500m"`). Empty means no claim.
pub fn parse_cpu(raw: &str) -> FlotillaResult<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0.0);
    }
    if let Some(millis) = s.strip_suffix(['m', 'M']) {
        let n: f64 = millis
            .parse()
            .map_err(|_| FlotillaError::BadResourceSpec(format!("invalid cpu value {:?}", raw)))?;
        return Ok(n / 1000.0);
    }
    s.parse()
        .map_err(|_| FlotillaError::BadResourceSpec(format!("invalid cpu value {:?}", raw)))
}

/// Parse a memory request: bare bytes or SI / IEC suffixed values
/// (`Kb/Mb/Gb` are decimal, `Ki/Mi/Gi` binary, case-insensitive).
pub fn parse_memory(raw: &str) -> FlotillaResult<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let lower = s.to_lowercase();
    let (number, multiplier): (&str, u64) = if let Some(n) = lower.strip_suffix("kb") {
        (n, 1000)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1000 * 1000)
    } else if let Some(n) = lower.strip_suffix("gb") {
        (n, 1000 * 1000 * 1000)
    } else if let Some(n) = lower.strip_suffix("ki") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix("mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("gi") {
        (n, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    let n: f64 = number.trim().parse().map_err(|_| {
        FlotillaError::BadResourceSpec(format!("invalid memory value {:?}", raw))
    })?;
    if n < 0.0 {
        return Err(FlotillaError::BadResourceSpec(format!(
            "negative memory value {:?}",
            raw
        )));
    }
    Ok((n * multiplier as f64) as u64)
}

/// Parse a GPU request: a whole device count.
pub fn parse_gpu(raw: &str) -> FlotillaResult<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0);
    }
    s.parse()
        .map_err(|_| FlotillaError::BadResourceSpec(format!("invalid gpu value {:?}", raw)))
}

/// Parse a whole `ResourceUsageConfig` into canonical units.
pub fn parse_resource_usage_config(config: &ResourceUsageConfig) -> FlotillaResult<ResourceUsage> {
    Ok(ResourceUsage {
        cpu_cores: parse_cpu(&config.cpu)?,
        memory_bytes: parse_memory(&config.memory)?,
        gpu_count: parse_gpu(&config.gpu)?,
    })
}

/// Ceilings for the capacity manager, as configured (unparsed).
#[derive(Debug, Clone, Default)]
pub struct CapacityManagerConfig {
    /// Total resources all running shards may consume together.
    pub resource_limit_total: ResourceUsageConfig,
    /// Ceiling for any single job's request.
    pub resource_limit_job: ResourceUsageConfig,
}

#[derive(Debug, Default)]
struct CapacityLedger {
    in_flight: ResourceUsage,
    reservations: HashMap<(JobId, ShardIndex), ResourceUsage>,
}

/// Tracks what is running on this node and enforces the two ceilings.
/// `Notify` fires on every release so deferred work can re-check.
pub struct CapacityManager {
    total: ResourceUsage,
    per_job_max: ResourceUsage,
    ledger: Mutex<CapacityLedger>,
    released: Arc<Notify>,
}

impl CapacityManager {
    pub fn new(config: CapacityManagerConfig) -> FlotillaResult<Self> {
        Ok(Self {
            total: parse_resource_usage_config(&config.resource_limit_total)?,
            per_job_max: parse_resource_usage_config(&config.resource_limit_job)?,
            ledger: Mutex::new(CapacityLedger::default()),
            released: Arc::new(Notify::new()),
        })
    }

    /// Would this request fit right now? True iff it is under the per-job
    /// ceiling and, added to everything in flight, under the total.
    pub fn can_run(&self, req: &ResourceUsage) -> bool {
        if !req.fits_within(&self.per_job_max) {
            return false;
        }
        let ledger = self.ledger.lock();
        ledger.in_flight.add(req).fits_within(&self.total)
    }

    /// Atomic check-and-add. Re-reserving an already-held `(job, shard)`
    /// key succeeds without charging again.
    pub fn reserve(&self, job_id: JobId, shard: ShardIndex, req: &ResourceUsage) -> bool {
        let mut ledger = self.ledger.lock();
        if ledger.reservations.contains_key(&(job_id, shard)) {
            return true;
        }
        if !req.fits_within(&self.per_job_max) {
            return false;
        }
        let next = ledger.in_flight.add(req);
        if !next.fits_within(&self.total) {
            return false;
        }
        ledger.in_flight = next;
        ledger.reservations.insert((job_id, shard), *req);
        debug!(job_id = %job_id, shard, cpu = req.cpu_cores, "capacity reserved");
        true
    }

    /// Return a reservation to the pool; unknown keys are a no-op.
    pub fn release(&self, job_id: JobId, shard: ShardIndex) {
        let mut ledger = self.ledger.lock();
        if let Some(req) = ledger.reservations.remove(&(job_id, shard)) {
            ledger.in_flight.cpu_cores = (ledger.in_flight.cpu_cores - req.cpu_cores).max(0.0);
            ledger.in_flight.memory_bytes =
                ledger.in_flight.memory_bytes.saturating_sub(req.memory_bytes);
            ledger.in_flight.gpu_count = ledger.in_flight.gpu_count.saturating_sub(req.gpu_count);
            drop(ledger);
            debug!(job_id = %job_id, shard, "capacity released");
            self.released.notify_waiters();
        }
    }

    /// Current sum of reservations.
    pub fn in_flight(&self) -> ResourceUsage {
        self.ledger.lock().in_flight
    }

    /// Handle to await the next release (used by deferred-job retry).
    pub fn release_notifier(&self) -> Arc<Notify> {
        self.released.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f64, mem: u64, gpu: u64) -> ResourceUsage {
        ResourceUsage {
            cpu_cores: cpu,
            memory_bytes: mem,
            gpu_count: gpu,
        }
    }

    fn manager(total_cpu: &str, job_cpu: &str) -> CapacityManager {
        CapacityManager::new(CapacityManagerConfig {
            resource_limit_total: ResourceUsageConfig {
                cpu: total_cpu.to_string(),
                ..Default::default()
            },
            resource_limit_job: ResourceUsageConfig {
                cpu: job_cpu.to_string(),
                ..Default::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("").unwrap(), 0.0);
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
        assert_eq!(parse_cpu("0.5").unwrap(), 0.5);
        assert_eq!(parse_cpu("500m").unwrap(), 0.5);
        assert_eq!(parse_cpu("100m").unwrap(), 0.1);
        assert!(parse_cpu("two").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("").unwrap(), 0);
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert_eq!(parse_memory("1Kb").unwrap(), 1000);
        assert_eq!(parse_memory("1Ki").unwrap(), 1024);
        assert_eq!(parse_memory("2Mb").unwrap(), 2_000_000);
        assert_eq!(parse_memory("2Mi").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_memory("1gb").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory("1GI").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_memory("10 apples").is_err());
    }

    #[test]
    fn test_parse_gpu() {
        assert_eq!(parse_gpu("").unwrap(), 0);
        assert_eq!(parse_gpu("2").unwrap(), 2);
        assert!(parse_gpu("0.5").is_err());
    }

    #[test]
    fn test_empty_limits_mean_unlimited() {
        let m = manager("", "");
        assert!(m.can_run(&usage(128.0, u64::MAX / 2, 64)));
    }

    #[test]
    fn test_total_ceiling() {
        let m = manager("1", "");
        assert!(m.reserve(JobId::new(), 0, &usage(1.0, 0, 0)));
        assert!(!m.can_run(&usage(1.0, 0, 0)));
        assert!(!m.reserve(JobId::new(), 0, &usage(0.5, 0, 0)));
    }

    #[test]
    fn test_per_job_ceiling() {
        let m = manager("8", "2");
        assert!(!m.can_run(&usage(4.0, 0, 0)));
        assert!(m.can_run(&usage(2.0, 0, 0)));
    }

    #[test]
    fn test_release_frees_capacity() {
        let m = manager("1", "");
        let job = JobId::new();
        assert!(m.reserve(job, 0, &usage(1.0, 0, 0)));
        assert!(!m.can_run(&usage(1.0, 0, 0)));
        m.release(job, 0);
        assert!(m.can_run(&usage(1.0, 0, 0)));
        assert!(m.in_flight().is_zero());
    }

    #[test]
    fn test_reserve_is_idempotent_per_shard() {
        let m = manager("1", "");
        let job = JobId::new();
        assert!(m.reserve(job, 0, &usage(1.0, 0, 0)));
        // Replaying the same acceptance must not double-charge.
        assert!(m.reserve(job, 0, &usage(1.0, 0, 0)));
        assert_eq!(m.in_flight().cpu_cores, 1.0);
        m.release(job, 0);
        assert!(m.in_flight().is_zero());
    }

    #[test]
    fn test_release_unknown_key_is_noop() {
        let m = manager("1", "");
        m.release(JobId::new(), 3);
        assert!(m.in_flight().is_zero());
    }

    #[tokio::test]
    async fn test_release_wakes_waiters() {
        let m = std::sync::Arc::new(manager("1", ""));
        let job = JobId::new();
        assert!(m.reserve(job, 0, &usage(1.0, 0, 0)));
        let notify = m.release_notifier();
        let waiter = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;
        m.release(job, 0);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }
}
