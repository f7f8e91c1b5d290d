//! Render-thread tick timing and the counters published to callers

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::frame::RingBufferStats;

/// Scheduler tick timing over the profiler window, in milliseconds
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
}

/// Ticks kept for statistics
const WINDOW: usize = 300;

/// Work time and start times of the last [`WINDOW`] scheduler ticks.
///
/// Work time excludes the pacing sleep, so `avg_ms` against the tick
/// interval shows how much headroom the render thread has.
pub struct FrameProfiler {
    tick_work: VecDeque<Duration>,
    tick_starts: VecDeque<Instant>,
}

impl Default for FrameProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProfiler {
    pub fn new() -> Self {
        Self {
            tick_work: VecDeque::with_capacity(WINDOW),
            tick_starts: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Mark a tick start; pass the result to `end_tick`
    pub fn begin_tick(&mut self) -> Instant {
        let now = Instant::now();
        if self.tick_starts.len() == WINDOW {
            self.tick_starts.pop_front();
        }
        self.tick_starts.push_back(now);
        now
    }

    /// Record the work of the tick started at `start` and return it
    pub fn end_tick(&mut self, start: Instant) -> Duration {
        let work = start.elapsed();
        self.record(work);
        work
    }

    pub fn record(&mut self, work: Duration) {
        if self.tick_work.len() == WINDOW {
            self.tick_work.pop_front();
        }
        self.tick_work.push_back(work);
    }

    pub fn stats(&self) -> FrameStats {
        if self.tick_work.is_empty() {
            return FrameStats::default();
        }
        let mut ms: Vec<f64> = self.tick_work.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        ms.sort_by(f64::total_cmp);

        FrameStats {
            avg_ms: ms.iter().sum::<f64>() / ms.len() as f64,
            min_ms: ms[0],
            max_ms: ms[ms.len() - 1],
            p50_ms: percentile(&ms, 0.50),
            p95_ms: percentile(&ms, 0.95),
            p99_ms: percentile(&ms, 0.99),
            sample_count: ms.len(),
        }
    }

    /// Achieved tick rate, including pacing
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.tick_starts.front(), self.tick_starts.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if self.tick_starts.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.tick_starts.len() - 1) as f64 / span
    }

    pub fn last_tick_ms(&self) -> f64 {
        self.tick_work.back().map_or(0.0, |d| d.as_secs_f64() * 1000.0)
    }
}

/// Percentile from a sorted array
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}

/// Renderer counters published by the scheduler thread
#[derive(Debug, Clone, Default)]
pub struct RenderStats {
    /// Tick timing statistics
    pub frame_stats: FrameStats,
    /// Measured tick rate
    pub fps: f64,
    /// Configured tick rate
    pub target_fps: u32,
    /// Ticks executed
    pub ticks: u64,
    /// Scene (re)builds
    pub scene_builds: u64,
    /// Patches in the current scene, including the uncovered one
    pub patch_count: usize,
    /// Camera frames uploaded to textures
    pub frames_uploaded: u64,
    /// Output frames delivered to callbacks or snapshot receivers
    pub frames_delivered: u64,
    /// Cameras currently deliver differing pixel formats; nothing renders
    pub mixed_formats: bool,
    /// Per-camera ring buffer counters
    pub ring_buffers: Vec<RingBufferStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_profiler() {
        let mut profiler = FrameProfiler::new();
        for ms in [4u64, 8, 12] {
            profiler.begin_tick();
            profiler.record(Duration::from_millis(ms));
        }
        let stats = profiler.stats();
        assert!((stats.avg_ms - 8.0).abs() < 1e-9);
        assert_eq!(stats.sample_count, 3);
        assert!((profiler.last_tick_ms() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut profiler = FrameProfiler::new();
        for _ in 0..400 {
            profiler.record(Duration::from_millis(1));
        }
        assert_eq!(profiler.stats().sample_count, 300);
    }

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&values, 0.5), 5.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 10.0);
    }
}
