//! Cumulative and windowed run counters.
//!
//! One attempt is recorded exactly once: 304 counts as a cache skip, 2xx as
//! ok, everything else (including transport failures with no status) as an
//! error. 429 and 5xx maintain their own buckets on top of that split. The
//! window is what the tuner consumes; reading a snapshot resets it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Clone, Debug, Default)]
pub struct Totals {
    pub done: u64,
    pub ok: u64,
    pub skipped_304: u64,
    pub errors: u64,
    pub http_429: u64,
    pub http_5xx: u64,
    pub bytes: u64,
}

struct Window {
    ok: u64,
    err: u64,
    http_429: u64,
    http_5xx: u64,
    timeouts: u64,
    latencies: Vec<f64>,
    started: Instant,
}

impl Window {
    fn fresh() -> Self {
        Window {
            ok: 0,
            err: 0,
            http_429: 0,
            http_5xx: 0,
            timeouts: 0,
            latencies: Vec::new(),
            started: Instant::now(),
        }
    }
}

/// Metrics for one tuner window. Produced by `snapshot_window`, which also
/// resets the window.
#[derive(Clone, Debug, Default)]
pub struct WindowSnapshot {
    pub duration_s: f64,
    pub ok: u64,
    pub err: u64,
    pub http_429: u64,
    pub http_5xx: u64,
    pub timeouts: u64,
    pub avg_latency_s: f64,
    pub rps: f64,
}

struct StatsInner {
    totals: Totals,
    window: Window,
}

pub struct RunStats {
    inner: Mutex<StatsInner>,
    max_concurrency_configured: AtomicUsize,
    max_concurrency_reached: AtomicUsize,
}

impl RunStats {
    pub fn new(max_concurrency_configured: usize) -> Self {
        RunStats {
            inner: Mutex::new(StatsInner {
                totals: Totals::default(),
                window: Window::fresh(),
            }),
            max_concurrency_configured: AtomicUsize::new(max_concurrency_configured),
            max_concurrency_reached: AtomicUsize::new(0),
        }
    }

    /// Record one completed attempt.
    pub async fn record(&self, status: Option<u16>, latency_s: f64, nbytes: u64, timeout: bool) {
        let mut inner = self.inner.lock().await;
        inner.totals.done += 1;
        match status {
            Some(304) => inner.totals.skipped_304 += 1,
            Some(s) if (200..300).contains(&s) => {
                inner.totals.ok += 1;
                inner.window.ok += 1;
            }
            _ => {
                inner.totals.errors += 1;
                inner.window.err += 1;
            }
        }
        if status == Some(429) {
            inner.totals.http_429 += 1;
            inner.window.http_429 += 1;
        }
        if matches!(status, Some(s) if s >= 500) {
            inner.totals.http_5xx += 1;
            inner.window.http_5xx += 1;
        }
        if timeout {
            inner.window.timeouts += 1;
        }
        inner.totals.bytes += nbytes;
        inner.window.latencies.push(latency_s.max(0.0));
    }

    /// Current window metrics; resets the window atomically.
    pub async fn snapshot_window(&self) -> WindowSnapshot {
        let mut inner = self.inner.lock().await;
        let window = std::mem::replace(&mut inner.window, Window::fresh());
        let duration_s = window.started.elapsed().as_secs_f64().max(0.001);
        let avg_latency_s = if window.latencies.is_empty() {
            0.0
        } else {
            window.latencies.iter().sum::<f64>() / window.latencies.len() as f64
        };
        WindowSnapshot {
            duration_s,
            ok: window.ok,
            err: window.err,
            http_429: window.http_429,
            http_5xx: window.http_5xx,
            timeouts: window.timeouts,
            avg_latency_s,
            rps: (window.ok + window.err) as f64 / duration_s,
        }
    }

    pub async fn totals(&self) -> Totals {
        self.inner.lock().await.totals.clone()
    }

    pub fn max_concurrency_configured(&self) -> usize {
        self.max_concurrency_configured.load(Ordering::Relaxed)
    }

    pub fn max_concurrency_reached(&self) -> usize {
        self.max_concurrency_reached.load(Ordering::Relaxed)
    }

    /// Ratchet the highest target ever observed.
    pub fn note_concurrency(&self, target: usize) {
        self.max_concurrency_reached
            .fetch_max(target, Ordering::Relaxed);
    }
}
