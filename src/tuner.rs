//! AIMD concurrency tuner.
//!
//! Every tick the tuner drains the stats window and decides: multiplicative
//! decrease (x0.7) on any congestion signal, additive increase (+1) when the
//! process CPU is comfortable, hold otherwise. Congestion is any 429/5xx/
//! timeout in the window, CPU above the high-water mark, or latency at twice
//! the baseline while errors are present. The latency baseline is captured
//! once, on the first non-empty window, and never re-captured.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::limiter::AdaptiveLimiter;
use crate::stats::{RunStats, WindowSnapshot};

pub const DEFAULT_TUNER_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct TunerConfig {
    pub start: usize,
    pub max_limit: usize,
    pub cpu_high: f32,
    pub cpu_low: f32,
    pub interval: Duration,
}

#[derive(Debug, Default)]
pub struct TunerState {
    baseline_latency_s: Option<f64>,
}

/// One AIMD step. Pure so the reaction rules are testable without a clock.
pub fn next_target(
    snap: &WindowSnapshot,
    cpu: Option<f32>,
    current: usize,
    cfg: &TunerConfig,
    state: &mut TunerState,
) -> usize {
    if state.baseline_latency_s.is_none() && snap.rps > 0.0 && snap.avg_latency_s > 0.0 {
        state.baseline_latency_s = Some(snap.avg_latency_s);
    }

    let mut congested = snap.http_429 > 0 || snap.http_5xx > 0 || snap.timeouts > 0;
    if let Some(cpu) = cpu {
        if cpu >= cfg.cpu_high {
            congested = true;
        }
    }
    if let Some(baseline) = state.baseline_latency_s {
        if snap.err > 0 && snap.avg_latency_s > 0.0 && snap.avg_latency_s >= 2.0 * baseline {
            congested = true;
        }
    }

    if congested {
        return ((current as f64 * 0.7).floor() as usize).max(1);
    }
    match cpu {
        Some(cpu) if cpu > cfg.cpu_low => current,
        _ => (current + 1).min(cfg.max_limit),
    }
}

/// Periodic adjustment loop. Runs until the pipeline cancels it.
pub async fn autotune(
    limiter: Arc<AdaptiveLimiter>,
    stats: Arc<RunStats>,
    cfg: TunerConfig,
    mut sampler: SystemSampler,
) {
    let mut state = TunerState::default();
    limiter.set_target(cfg.start).await;
    stats.note_concurrency(cfg.start);
    // Prime the CPU counter so the first real sample has a reference point.
    let _ = sampler.cpu_percent();

    loop {
        tokio::time::sleep(cfg.interval).await;
        let snap = stats.snapshot_window().await;
        let current = limiter.get_target().await;
        let cpu = sampler.cpu_percent();
        let target = next_target(&snap, cpu, current, &cfg, &mut state);
        if target != current {
            debug!(
                "concurrency {current} -> {target} (win={:.1}s 429={} 5xx={} timeouts={} err={} avg_lat={:.3}s cpu={:?})",
                snap.duration_s, snap.http_429, snap.http_5xx, snap.timeouts, snap.err, snap.avg_latency_s, cpu
            );
            limiter.set_target(target).await;
        }
        stats.note_concurrency(limiter.get_target().await);
    }
}

/// Process CPU / RSS sampler. Each consumer owns its own instance because
/// CPU percentages are deltas between successive refreshes.
pub struct SystemSampler {
    sys: System,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        SystemSampler {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// CPU usage of this process, in percent. None when the process table
    /// cannot be read.
    pub fn cpu_percent(&mut self) -> Option<f32> {
        let pid = self.pid?;
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        self.sys.process(pid).map(|p| p.cpu_usage())
    }

    /// Resident set size in bytes and as a share of total memory. Relies on
    /// the process refresh performed by `cpu_percent`.
    pub fn memory(&mut self) -> Option<(u64, f32)> {
        let pid = self.pid?;
        self.sys.refresh_memory();
        let rss = self.sys.process(pid)?.memory();
        let total = self.sys.total_memory();
        let pct = if total > 0 {
            rss as f32 / total as f32 * 100.0
        } else {
            0.0
        };
        Some((rss, pct))
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TunerConfig {
        TunerConfig {
            start: 10,
            max_limit: 25,
            cpu_high: 85.0,
            cpu_low: 70.0,
            interval: DEFAULT_TUNER_INTERVAL,
        }
    }

    fn window(ok: u64, err: u64) -> WindowSnapshot {
        WindowSnapshot {
            duration_s: 5.0,
            ok,
            err,
            rps: (ok + err) as f64 / 5.0,
            ..Default::default()
        }
    }

    #[test]
    fn congestion_applies_multiplicative_decrease_then_recovers() {
        let cfg = cfg();
        let mut state = TunerState::default();

        let mut congested = window(5, 3);
        congested.http_429 = 3;
        congested.avg_latency_s = 0.4;
        let after_decrease = next_target(&congested, Some(20.0), 10, &cfg, &mut state);
        assert_eq!(after_decrease, 7);

        let mut calm = window(8, 0);
        calm.avg_latency_s = 0.4;
        let after_increase = next_target(&calm, Some(20.0), after_decrease, &cfg, &mut state);
        assert_eq!(after_increase, 8);
    }

    #[test]
    fn decrease_never_goes_below_one() {
        let cfg = cfg();
        let mut state = TunerState::default();
        let mut snap = window(0, 1);
        snap.timeouts = 1;
        assert_eq!(next_target(&snap, None, 1, &cfg, &mut state), 1);
    }

    #[test]
    fn high_cpu_alone_counts_as_congestion() {
        let cfg = cfg();
        let mut state = TunerState::default();
        let snap = window(10, 0);
        assert_eq!(next_target(&snap, Some(90.0), 10, &cfg, &mut state), 7);
    }

    #[test]
    fn mid_range_cpu_holds_steady() {
        let cfg = cfg();
        let mut state = TunerState::default();
        let snap = window(10, 0);
        assert_eq!(next_target(&snap, Some(75.0), 10, &cfg, &mut state), 10);
    }

    #[test]
    fn increase_is_capped_at_max_limit() {
        let cfg = cfg();
        let mut state = TunerState::default();
        let snap = window(10, 0);
        assert_eq!(next_target(&snap, Some(10.0), 25, &cfg, &mut state), 25);
    }

    #[test]
    fn latency_degradation_requires_errors_and_a_held_baseline() {
        let cfg = cfg();
        let mut state = TunerState::default();

        // First non-empty window captures the baseline and is not judged
        // against itself.
        let mut first = window(10, 0);
        first.avg_latency_s = 0.2;
        assert_eq!(next_target(&first, Some(10.0), 10, &cfg, &mut state), 11);

        // Doubled latency without errors is not congestion.
        let mut slow_clean = window(10, 0);
        slow_clean.avg_latency_s = 0.5;
        assert_eq!(next_target(&slow_clean, Some(10.0), 11, &cfg, &mut state), 12);

        // Doubled latency with errors is.
        let mut slow_dirty = window(8, 2);
        slow_dirty.avg_latency_s = 0.5;
        assert_eq!(next_target(&slow_dirty, Some(10.0), 12, &cfg, &mut state), 8);

        // The baseline was captured once and held, not replaced by the
        // slower windows.
        assert_eq!(state.baseline_latency_s, Some(0.2));
    }
}
