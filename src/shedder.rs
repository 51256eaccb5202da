//! Admission control
//!
//! `LoadShedder::admit()` runs before routing. It rejects a request when
//! memory or CPU pressure is over its threshold (regardless of how many
//! requests are in flight) or when admitting it would exceed
//! `max_concurrent_requests`.
//!
//! Every admitted request holds an [`AdmissionToken`]. A request can signal
//! completion more than once (the response body being dropped, the streaming
//! relay finishing), so the token is cloneable and its release is guarded by
//! an `AtomicBool` swap: only the first release decrements the counter. The
//! last clone dropping releases too, through the same guarded path.

use crate::config::LoadSheddingConfig;
use crate::error::AppError;
use crate::metrics::{Metrics, log_recording_failure};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Resource readings as ratios in [0.0, 1.0]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub heap_ratio: f64,
    pub cpu_ratio: f64,
}

impl ResourceSample {
    pub const IDLE: ResourceSample = ResourceSample {
        heap_ratio: 0.0,
        cpu_ratio: 0.0,
    };
}

/// Source of resource readings for admission decisions
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Probe returning whatever was last set; used by tests and benchmarks
#[derive(Debug)]
pub struct FixedProbe {
    sample: RwLock<ResourceSample>,
}

impl FixedProbe {
    pub fn new(heap_ratio: f64, cpu_ratio: f64) -> Self {
        Self {
            sample: RwLock::new(ResourceSample {
                heap_ratio,
                cpu_ratio,
            }),
        }
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn set(&self, heap_ratio: f64, cpu_ratio: f64) {
        *self.sample.write().unwrap_or_else(PoisonError::into_inner) = ResourceSample {
            heap_ratio,
            cpu_ratio,
        };
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceSample {
        *self.sample.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Production probe backed by `sysinfo`
///
/// Readings are refreshed by a background sampler so `admit()` never touches
/// the OS. Heap ratio is this process's resident memory over
/// `memory_limit_mb` when configured, otherwise system used/total memory.
/// CPU ratio is global CPU usage.
pub struct SystemProbe {
    latest: RwLock<ResourceSample>,
    system: Mutex<System>,
    pid: Option<Pid>,
    memory_limit_bytes: Option<u64>,
}

impl SystemProbe {
    pub fn new(memory_limit_mb: Option<u64>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Could not determine own PID; heap ratio falls back to system memory"
                );
                None
            }
        };
        let probe = Self {
            latest: RwLock::new(ResourceSample::IDLE),
            system: Mutex::new(System::new()),
            pid,
            memory_limit_bytes: memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        };
        probe.refresh();
        probe
    }

    /// Take a fresh reading from the OS
    pub fn refresh(&self) {
        let sample = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_memory();
            system.refresh_cpu_usage();

            let process_memory = match (self.pid, self.memory_limit_bytes) {
                (Some(pid), Some(_)) => {
                    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    system.process(pid).map(|p| p.memory())
                }
                _ => None,
            };

            let heap_ratio = match (process_memory, self.memory_limit_bytes) {
                (Some(used), Some(limit)) if limit > 0 => used as f64 / limit as f64,
                _ => {
                    let total = system.total_memory();
                    if total == 0 {
                        0.0
                    } else {
                        system.used_memory() as f64 / total as f64
                    }
                }
            };
            let cpu_ratio = f64::from(system.global_cpu_usage()) / 100.0;

            ResourceSample {
                heap_ratio: sanitize_ratio(heap_ratio),
                cpu_ratio: sanitize_ratio(cpu_ratio),
            }
        };

        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = sample;
    }

    /// Refresh readings every `interval` until the returned task is aborted
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.refresh();
                let sample = self.sample();
                tracing::trace!(
                    heap_ratio = sample.heap_ratio,
                    cpu_ratio = sample.cpu_ratio,
                    "Resource sample refreshed"
                );
            }
        })
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() { ratio.max(0.0) } else { 0.0 }
}

/// Why a request was shed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedReason {
    HeapPressure,
    CpuPressure,
    ConcurrencyLimit,
}

impl ShedReason {
    /// Convert reason to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            ShedReason::HeapPressure => "heap_pressure",
            ShedReason::CpuPressure => "cpu_pressure",
            ShedReason::ConcurrencyLimit => "concurrency_limit",
        }
    }
}

/// Admission rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overload {
    pub reason: ShedReason,
    pub retry_after_secs: u64,
}

impl From<Overload> for AppError {
    fn from(overload: Overload) -> Self {
        AppError::Overloaded {
            reason: overload.reason.as_str().replace('_', " "),
            retry_after_seconds: overload.retry_after_secs,
        }
    }
}

struct Shared {
    active: AtomicUsize,
    max_concurrent: usize,
    metrics: Metrics,
}

struct TokenInner {
    id: Uuid,
    admitted_at: Instant,
    released: AtomicBool,
    shared: Arc<Shared>,
}

impl TokenInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        self.shared.metrics.active_request_released();
        tracing::trace!(
            token_id = %self.id,
            held_ms = self.admitted_at.elapsed().as_millis() as u64,
            "Admission token released"
        );
        true
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle for one admitted request
///
/// Clones share one release flag.
#[derive(Clone)]
pub struct AdmissionToken {
    inner: Arc<TokenInner>,
}

impl AdmissionToken {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn admitted_at(&self) -> Instant {
        self.inner.admitted_at
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Release the admission; returns true only for the call that had effect
    pub fn release(&self) -> bool {
        self.inner.release()
    }
}

impl std::fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionToken")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}

pub struct LoadShedder {
    shared: Arc<Shared>,
    probe: Arc<dyn ResourceProbe>,
    max_heap_ratio: f64,
    max_cpu_ratio: f64,
    retry_after_secs: u64,
}

impl LoadShedder {
    pub fn new(config: &LoadSheddingConfig, probe: Arc<dyn ResourceProbe>, metrics: Metrics) -> Self {
        Self {
            shared: Arc::new(Shared {
                active: AtomicUsize::new(0),
                max_concurrent: config.max_concurrent_requests,
                metrics,
            }),
            probe,
            max_heap_ratio: config.max_heap_ratio,
            max_cpu_ratio: config.max_cpu_ratio,
            retry_after_secs: config.retry_after_seconds.max(1),
        }
    }

    /// Admit one request or reject it with a retry hint
    pub fn admit(&self) -> Result<AdmissionToken, Overload> {
        if let Some(reason) = self.pressure() {
            return Err(self.reject(reason));
        }

        let max = self.shared.max_concurrent;
        let admitted = self
            .shared
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        if admitted.is_err() {
            return Err(self.reject(ShedReason::ConcurrencyLimit));
        }
        self.shared.metrics.active_request_admitted();

        Ok(AdmissionToken {
            inner: Arc::new(TokenInner {
                id: Uuid::new_v4(),
                admitted_at: Instant::now(),
                released: AtomicBool::new(false),
                shared: self.shared.clone(),
            }),
        })
    }

    /// Release an admission; idempotent
    pub fn release(&self, token: &AdmissionToken) -> bool {
        token.release()
    }

    pub fn active_requests(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Resource pressure over threshold, ignoring the in-flight count
    pub fn pressure(&self) -> Option<ShedReason> {
        let sample = self.probe.sample();
        if sample.heap_ratio >= self.max_heap_ratio {
            Some(ShedReason::HeapPressure)
        } else if sample.cpu_ratio >= self.max_cpu_ratio {
            Some(ShedReason::CpuPressure)
        } else {
            None
        }
    }

    pub fn sample(&self) -> ResourceSample {
        self.probe.sample()
    }

    fn reject(&self, reason: ShedReason) -> Overload {
        let sample = self.probe.sample();
        tracing::warn!(
            reason = reason.as_str(),
            heap_ratio = sample.heap_ratio,
            cpu_ratio = sample.cpu_ratio,
            active_requests = self.active_requests(),
            retry_after_secs = self.retry_after_secs,
            "Shedding request"
        );
        log_recording_failure(
            &self.shared.metrics,
            "record_load_shed",
            self.shared.metrics.record_load_shed(reason),
        );
        Overload {
            reason,
            retry_after_secs: self.retry_after_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shedder(max_concurrent: usize, probe: Arc<FixedProbe>) -> (LoadShedder, Metrics) {
        let metrics = Metrics::new().unwrap();
        let config = LoadSheddingConfig {
            max_concurrent_requests: max_concurrent,
            ..LoadSheddingConfig::default()
        };
        (LoadShedder::new(&config, probe, metrics.clone()), metrics)
    }

    #[test]
    fn test_admit_and_release_round_trip() {
        let (shedder, metrics) = shedder(4, Arc::new(FixedProbe::idle()));
        let token = shedder.admit().expect("should admit");
        assert_eq!(shedder.active_requests(), 1);
        assert_eq!(metrics.active_requests(), 1);
        assert!(shedder.release(&token));
        assert_eq!(shedder.active_requests(), 0);
        assert_eq!(metrics.active_requests(), 0);
    }

    #[test]
    fn test_release_is_idempotent_across_clones() {
        let (shedder, _) = shedder(4, Arc::new(FixedProbe::idle()));
        let token = shedder.admit().unwrap();
        let finish = token.clone();
        let close = token.clone();

        assert!(finish.release());
        assert!(!close.release());
        assert!(!shedder.release(&token));
        drop((token, finish, close));
        assert_eq!(shedder.active_requests(), 0);
    }

    #[test]
    fn test_last_drop_releases() {
        let (shedder, _) = shedder(4, Arc::new(FixedProbe::idle()));
        let token = shedder.admit().unwrap();
        let clone = token.clone();
        drop(token);
        assert_eq!(shedder.active_requests(), 1, "a live clone keeps the admission");
        drop(clone);
        assert_eq!(shedder.active_requests(), 0);
    }

    #[test]
    fn test_concurrency_ceiling() {
        let (shedder, metrics) = shedder(2, Arc::new(FixedProbe::idle()));
        let _a = shedder.admit().unwrap();
        let _b = shedder.admit().unwrap();
        let rejected = shedder.admit().unwrap_err();
        assert_eq!(rejected.reason, ShedReason::ConcurrencyLimit);
        assert_eq!(shedder.active_requests(), 2);
        assert_eq!(metrics.load_shed_count(ShedReason::ConcurrencyLimit), 1);
    }

    #[test]
    fn test_heap_pressure_rejects_with_zero_active() {
        let (shedder, _) = shedder(512, Arc::new(FixedProbe::new(0.92, 0.1)));
        let rejected = shedder.admit().unwrap_err();
        assert_eq!(rejected.reason, ShedReason::HeapPressure);
        assert!(rejected.retry_after_secs > 0);
        assert_eq!(shedder.active_requests(), 0);
    }

    #[test]
    fn test_cpu_pressure_rejects() {
        let probe = Arc::new(FixedProbe::idle());
        let (shedder, _) = shedder(512, probe.clone());
        assert!(shedder.admit().is_ok());
        probe.set(0.1, 0.85);
        assert_eq!(shedder.admit().unwrap_err().reason, ShedReason::CpuPressure);
        assert_eq!(shedder.pressure(), Some(ShedReason::CpuPressure));
        probe.set(0.1, 0.2);
        assert_eq!(shedder.pressure(), None);
    }

    #[test]
    fn test_overload_converts_to_app_error() {
        let err: AppError = Overload {
            reason: ShedReason::HeapPressure,
            retry_after_secs: 5,
        }
        .into();
        match err {
            AppError::Overloaded {
                reason,
                retry_after_seconds,
            } => {
                assert_eq!(reason, "heap pressure");
                assert_eq!(retry_after_seconds, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_racing_releases_decrement_once() {
        let (shedder, _) = shedder(64, Arc::new(FixedProbe::idle()));
        for _ in 0..50 {
            let token = shedder.admit().unwrap();
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let t = token.clone();
                    std::thread::spawn(move || t.release())
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert_eq!(shedder.active_requests(), 0);
        }
    }

    #[test]
    fn test_system_probe_reports_sane_ratios() {
        let probe = SystemProbe::new(None);
        let sample = probe.sample();
        assert!(sample.heap_ratio >= 0.0);
        assert!(sample.cpu_ratio >= 0.0);
    }
}
