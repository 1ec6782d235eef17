use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use quanta::{Clock, Instant as QuantaInstant};

/// Point-in-time view of the mixer's counters and chunk timing.
#[derive(Debug, Clone)]
pub struct MixerStats {
    pub chunks_mixed: u64,
    pub frames_mixed: u64,
    pub sources_admitted: u64,
    pub sources_rejected: u64,
    /// Sources dropped because they misbehaved during chunk production.
    pub sources_failed: u64,
    pub min_chunk_nanos: Option<u64>,
    pub max_chunk_nanos: Option<u64>,
    pub ema_chunk_nanos: f64,
    /// Real time one chunk represents.
    pub chunk_budget_nanos: f64,
    /// EMA production time relative to the chunk budget.
    pub load_percent: f64,
    pub timestamp: Instant,
}

/// Lock-free counters updated from the chunk production path.
///
/// Everything except `snapshot` and `reset` is a handful of relaxed atomic
/// operations, so it is safe to call while producing audio.
pub struct PerformanceMonitor {
    clock: Clock,
    frames_per_chunk: usize,
    samplerate: u32,

    sources_admitted: AtomicU64,
    sources_rejected: AtomicU64,
    sources_failed: AtomicU64,

    min_chunk_nanos: AtomicU64,
    max_chunk_nanos: AtomicU64,
    /// f64 bits of the exponential moving average.
    ema_chunk_bits: AtomicU64,
    ema_alpha: f64,
}

impl PerformanceMonitor {
    /// `ema_alpha` is clamped into (0, 1]; around 0.1 follows load changes
    /// within a few dozen chunks.
    pub fn new(frames_per_chunk: usize, samplerate: u32, ema_alpha: f64) -> Self {
        Self {
            clock: Clock::new(),
            frames_per_chunk,
            samplerate,
            sources_admitted: AtomicU64::new(0),
            sources_rejected: AtomicU64::new(0),
            sources_failed: AtomicU64::new(0),
            min_chunk_nanos: AtomicU64::new(u64::MAX),
            max_chunk_nanos: AtomicU64::new(0),
            ema_chunk_bits: AtomicU64::new(0),
            ema_alpha: ema_alpha.clamp(f64::EPSILON, 1.0),
        }
    }

    #[inline(always)]
    pub fn record_admitted(&self) {
        self.sources_admitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_rejected(&self) {
        self.sources_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_failed(&self) {
        self.sources_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_chunk_duration_nanos(&self, nanos: u64) {
        self.min_chunk_nanos.fetch_min(nanos, Ordering::Relaxed);
        self.max_chunk_nanos.fetch_max(nanos, Ordering::Relaxed);

        // EMA_new = alpha * x + (1 - alpha) * EMA_old
        let alpha = self.ema_alpha;
        let mut old_bits = self.ema_chunk_bits.load(Ordering::Relaxed);
        loop {
            let old = f64::from_bits(old_bits);
            let new = alpha * nanos as f64 + (1.0 - alpha) * old;
            match self.ema_chunk_bits.compare_exchange_weak(
                old_bits,
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(found) => old_bits = found,
            }
        }
    }

    pub fn record_chunk_duration(&self, d: Duration) {
        self.record_chunk_duration_nanos(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Times one mixed chunk until the guard drops.
    #[inline(always)]
    pub fn scoped_chunk(&self) -> ChunkGuard<'_> {
        ChunkGuard {
            monitor: self,
            start: self.clock.now(),
        }
    }

    /// The chunk count comes from the mixer, which owns the chunk clock.
    pub fn snapshot(&self, chunks_mixed: u64) -> MixerStats {
        let min_raw = self.min_chunk_nanos.load(Ordering::Relaxed);
        let max_raw = self.max_chunk_nanos.load(Ordering::Relaxed);
        let ema = f64::from_bits(self.ema_chunk_bits.load(Ordering::Relaxed));
        let budget = self.frames_per_chunk as f64 / self.samplerate as f64 * 1_000_000_000.0;
        MixerStats {
            chunks_mixed,
            frames_mixed: chunks_mixed * self.frames_per_chunk as u64,
            sources_admitted: self.sources_admitted.load(Ordering::Relaxed),
            sources_rejected: self.sources_rejected.load(Ordering::Relaxed),
            sources_failed: self.sources_failed.load(Ordering::Relaxed),
            min_chunk_nanos: (min_raw != u64::MAX).then_some(min_raw),
            max_chunk_nanos: (max_raw != 0).then_some(max_raw),
            ema_chunk_nanos: ema,
            chunk_budget_nanos: budget,
            load_percent: if budget > 0.0 { ema / budget * 100.0 } else { 0.0 },
            timestamp: Instant::now(),
        }
    }

    /// Clears the timing peaks and the moving average; counters keep running.
    pub fn reset_peaks(&self) {
        self.min_chunk_nanos.store(u64::MAX, Ordering::Relaxed);
        self.max_chunk_nanos.store(0, Ordering::Relaxed);
        self.ema_chunk_bits.store(0, Ordering::Relaxed);
    }
}

/// Records the elapsed chunk production time on drop.
pub struct ChunkGuard<'a> {
    monitor: &'a PerformanceMonitor,
    start: QuantaInstant,
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.monitor.clock.now().saturating_duration_since(self.start);
        self.monitor.record_chunk_duration(elapsed);
    }
}
