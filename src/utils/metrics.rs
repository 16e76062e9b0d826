use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most recent page durations kept for the percentile
const DURATION_WINDOW: usize = 1024;

/// Metrics collector for the page analyzer.
///
/// Tracks pages, cache performance, fallbacks and per-stage durations.
/// Cloning yields another handle to the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Page Metrics
    pages_processed: AtomicUsize,
    pages_failed: AtomicUsize,
    empty_frames: AtomicUsize,
    detections_emitted: AtomicUsize,
    page_duration_total_ms: AtomicU64,
    page_duration_ms: RwLock<VecDeque<u64>>,

    // Cache Metrics
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_size: AtomicUsize,

    // ML Metrics
    ml_fallbacks: AtomicUsize,
    ml_timeouts: AtomicUsize,

    timeouts: AtomicUsize,
    batches_processed: AtomicUsize,

    // Per-stage running totals, keyed by stage name
    stage_durations: DashMap<&'static str, StageTotal>,

    start_time: Instant,
}

#[derive(Default)]
struct StageTotal {
    sum_ms: f64,
    count: u64,
}

impl StageTotal {
    fn add(&mut self, elapsed_ms: f64) {
        self.sum_ms += elapsed_ms;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                pages_processed: AtomicUsize::new(0),
                pages_failed: AtomicUsize::new(0),
                empty_frames: AtomicUsize::new(0),
                detections_emitted: AtomicUsize::new(0),
                page_duration_total_ms: AtomicU64::new(0),
                page_duration_ms: RwLock::new(VecDeque::with_capacity(DURATION_WINDOW)),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_size: AtomicUsize::new(0),
                ml_fallbacks: AtomicUsize::new(0),
                ml_timeouts: AtomicUsize::new(0),
                timeouts: AtomicUsize::new(0),
                batches_processed: AtomicUsize::new(0),
                stage_durations: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Page Metrics
    pub fn record_page(&self, duration: Duration, detections: usize) {
        self.inner.pages_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.detections_emitted.fetch_add(detections, Ordering::Relaxed);
        let ms = duration.as_millis() as u64;
        self.inner.page_duration_total_ms.fetch_add(ms, Ordering::Relaxed);

        let mut window = self.inner.page_duration_ms.write();
        if window.len() == DURATION_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
    }

    pub fn record_page_failed(&self) {
        self.inner.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_frame(&self) {
        self.inner.empty_frames.fetch_add(1, Ordering::Relaxed);
    }

    // Cache Metrics
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_cache_size(&self, size: usize) {
        self.inner.cache_size.store(size, Ordering::Relaxed);
    }

    // ML Metrics
    pub fn record_ml_fallback(&self) {
        self.inner.ml_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ml_timeout(&self) {
        self.inner.ml_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_processed(&self) {
        self.inner.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage(&self, stage: &'static str, elapsed_ms: f64) {
        self.inner
            .stage_durations
            .entry(stage)
            .or_default()
            .add(elapsed_ms);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let pages_processed = self.inner.pages_processed.load(Ordering::Relaxed);
        let page_avg = match pages_processed {
            0 => 0,
            n => self.inner.page_duration_total_ms.load(Ordering::Relaxed) / n as u64,
        };
        let page_p95 = {
            let window = self.inner.page_duration_ms.read();
            let samples: Vec<u64> = window.iter().copied().collect();
            percentile(&samples, 0.95)
        };

        let stage_avg_ms = self
            .inner
            .stage_durations
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().mean()))
            .collect();

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            pages_processed,
            pages_failed: self.inner.pages_failed.load(Ordering::Relaxed),
            empty_frames: self.inner.empty_frames.load(Ordering::Relaxed),
            detections_emitted: self.inner.detections_emitted.load(Ordering::Relaxed),
            page_avg_ms: page_avg,
            page_p95_ms: page_p95,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
            ml_fallbacks: self.inner.ml_fallbacks.load(Ordering::Relaxed),
            ml_timeouts: self.inner.ml_timeouts.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            batches_processed: self.inner.batches_processed.load(Ordering::Relaxed),
            stage_avg_ms,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pages_processed: usize,
    pub pages_failed: usize,
    pub empty_frames: usize,
    pub detections_emitted: usize,
    pub page_avg_ms: u64,
    pub page_p95_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub ml_fallbacks: usize,
    pub ml_timeouts: usize,
    pub timeouts: usize,
    pub batches_processed: usize,
    pub stage_avg_ms: BTreeMap<String, f64>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}
