//! Region-local control plumbing: the structural-status gate, the
//! disable-write barrier with in-flight draining, global concurrency
//! limiters, and the request-cost window feeding split decisions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use talon_common::error::RegionError;
use talon_common::types::RegionId;
use talon_proto::RegionStatus;

const STATUS_IDLE: u8 = 0;
const STATUS_DOING: u8 = 1;

/// Compare-and-set gate serializing structural operations
/// (split/merge/DDL/add-peer/snapshot-install/compact) per region.
pub struct StatusGate {
    region_id: u64,
    status: AtomicU8,
}

impl StatusGate {
    pub fn new(region_id: u64) -> Self {
        Self { region_id, status: AtomicU8::new(STATUS_IDLE) }
    }

    pub fn status(&self) -> RegionStatus {
        if self.status.load(Ordering::SeqCst) == STATUS_DOING {
            RegionStatus::Doing
        } else {
            RegionStatus::Idle
        }
    }

    /// Claim the gate. Losers get `RegionBusy` and retry later.
    pub fn acquire(&self) -> Result<StatusGuard<'_>, RegionError> {
        match self.status.compare_exchange(
            STATUS_IDLE,
            STATUS_DOING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(StatusGuard { gate: self, armed: true }),
            Err(_) => Err(RegionError::RegionBusy { region_id: RegionId(self.region_id) }),
        }
    }

    /// Force the gate open (split-child provisioning starts in DOING).
    pub fn force_doing(&self) {
        self.status.store(STATUS_DOING, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.status.store(STATUS_IDLE, Ordering::SeqCst);
    }
}

/// Releases the gate on drop unless disarmed (handed over to an apply-side
/// phase that resets it explicitly).
pub struct StatusGuard<'a> {
    gate: &'a StatusGate,
    armed: bool,
}

impl StatusGuard<'_> {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.reset();
        }
    }
}

/// The disable-write barrier plus the in-flight-writes counter.
///
/// Writers wait for the barrier, then hold a reference count for the
/// duration of the write. A structural operation raises the barrier and
/// drains the counter to get a quiescent window.
#[derive(Debug)]
pub struct WriteBarrier {
    region_id: u64,
    disabled: AtomicBool,
    in_flight: AtomicI64,
}

impl WriteBarrier {
    pub fn new(region_id: u64) -> Arc<Self> {
        Arc::new(Self { region_id, disabled: AtomicBool::new(false), in_flight: AtomicI64::new(0) })
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for writes to be allowed, then register as in-flight.
    pub fn enter_write(
        self: &Arc<Self>,
        wait_timeout: Duration,
    ) -> Result<WriteTicket, RegionError> {
        let deadline = Instant::now() + wait_timeout;
        while self.disabled.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return Err(RegionError::DisableWriteTimeout {
                    region_id: RegionId(self.region_id),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(WriteTicket { barrier: self.clone() })
    }

    /// Raise the barrier and drain in-flight writes.
    pub fn disable_and_drain(
        self: &Arc<Self>,
        drain_timeout: Duration,
    ) -> Result<BarrierGuard, RegionError> {
        self.disabled.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + drain_timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                self.disabled.store(false, Ordering::SeqCst);
                return Err(RegionError::DisableWriteTimeout {
                    region_id: RegionId(self.region_id),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(BarrierGuard { barrier: self.clone(), armed: true })
    }
}

/// One in-flight write.
pub struct WriteTicket {
    barrier: Arc<WriteBarrier>,
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        self.barrier.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds the barrier up; lowers it on drop unless disarmed.
#[derive(Debug)]
pub struct BarrierGuard {
    barrier: Arc<WriteBarrier>,
    armed: bool,
}

impl BarrierGuard {
    pub fn keep_disabled(mut self) {
        self.armed = false;
    }
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.disabled.store(false, Ordering::SeqCst);
        }
    }
}

/// Process-wide cap on concurrent heavy operations.
pub struct ConcurrencyLimiter {
    name: &'static str,
    current: AtomicUsize,
    max: usize,
}

impl ConcurrencyLimiter {
    pub fn new(name: &'static str, max: usize) -> Arc<Self> {
        Arc::new(Self { name, current: AtomicUsize::new(0), max: max.max(1) })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<LimiterTicket> {
        let mut cur = self.current.load(Ordering::SeqCst);
        loop {
            if cur >= self.max {
                tracing::debug!(limiter = self.name, cur, max = self.max, "limiter full");
                return None;
            }
            match self.current.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(LimiterTicket { limiter: self.clone() }),
                Err(actual) => cur = actual,
            }
        }
    }
}

pub struct LimiterTicket {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for LimiterTicket {
    fn drop(&mut self) {
        self.limiter.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sliding window of request costs, yielding the region's average cost and
/// QPS for split catch-up convergence checks.
pub struct StatWindow {
    samples: Mutex<VecDeque<(Instant, u64)>>,
    capacity: usize,
}

impl StatWindow {
    pub fn new(capacity: usize) -> Self {
        Self { samples: Mutex::new(VecDeque::new()), capacity: capacity.max(2) }
    }

    pub fn record(&self, cost_us: u64) {
        let mut samples = self.samples.lock();
        samples.push_back((Instant::now(), cost_us));
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn qps(&self) -> u64 {
        let samples = self.samples.lock();
        if samples.len() < 2 {
            return samples.len() as u64;
        }
        let span = samples
            .back()
            .map(|(t, _)| *t)
            .and_then(|newest| samples.front().map(|(t, _)| newest.duration_since(*t)))
            .unwrap_or_default();
        if span.is_zero() {
            return samples.len() as u64;
        }
        ((samples.len() as u128 - 1) * 1_000_000 / span.as_micros().max(1)) as u64
    }

    pub fn average_cost_us(&self) -> u64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0;
        }
        samples.iter().map(|(_, c)| *c).sum::<u64>() / samples.len() as u64
    }
}
