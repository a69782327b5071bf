//! Per-step resource accounting for the sampling loop.
//!
//! Metrics are owned values threaded through the loop driver instead of
//! process-wide counters, so runs stay independent and tests can assert
//! on them directly.

use std::time::Duration;

/// Samples the process' current memory footprint.
///
/// Sampling is unsynchronized; the sampling loop is single-threaded so a
/// plain read after each step is sufficient.
pub trait MemoryProbe {
    fn current_bytes(&self) -> u64;
}

/// Resident-set-size probe backed by `/proc/self/statm`.
///
/// Reports 0 on platforms without procfs.
#[derive(Debug, Default)]
pub struct ProcessRss;

impl MemoryProbe for ProcessRss {
    #[cfg(target_os = "linux")]
    fn current_bytes(&self) -> u64 {
        let statm = match std::fs::read_to_string("/proc/self/statm") {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let resident_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        resident_pages * 4096
    }

    #[cfg(not(target_os = "linux"))]
    fn current_bytes(&self) -> u64 {
        0
    }
}

/// Probe that always reports 0, for tests.
#[derive(Debug, Default)]
pub struct NullProbe;

impl MemoryProbe for NullProbe {
    fn current_bytes(&self) -> u64 {
        0
    }
}

/// One sampling step's cost.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Index into the timestep subsequence (descending during sampling).
    pub index: usize,
    /// The diffusion timestep this step denoised at.
    pub timestep: usize,
    pub elapsed: Duration,
    pub mem_bytes: u64,
}

/// Accumulated metrics for one generation run.
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    pub steps: Vec<StepMetrics>,
}

impl RunMetrics {
    pub fn record(&mut self, step: StepMetrics) {
        self.steps.push(step);
    }

    /// Peak memory observed across all steps.
    pub fn peak_mem_bytes(&self) -> u64 {
        self.steps.iter().map(|s| s.mem_bytes).max().unwrap_or(0)
    }

    pub fn total_elapsed(&self) -> Duration {
        self.steps.iter().map(|s| s.elapsed).sum()
    }

    pub fn iterations_per_second(&self) -> f64 {
        let secs = self.total_elapsed().as_secs_f64();
        if secs > 0.0 {
            self.steps.len() as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, millis: u64, mem: u64) -> StepMetrics {
        StepMetrics {
            index,
            timestep: index,
            elapsed: Duration::from_millis(millis),
            mem_bytes: mem,
        }
    }

    #[test]
    fn peak_memory_is_max_over_steps() {
        let mut m = RunMetrics::default();
        m.record(step(2, 10, 100));
        m.record(step(1, 10, 300));
        m.record(step(0, 10, 200));
        assert_eq!(m.peak_mem_bytes(), 300);
    }

    #[test]
    fn empty_run_has_zero_peak() {
        assert_eq!(RunMetrics::default().peak_mem_bytes(), 0);
        assert_eq!(RunMetrics::default().iterations_per_second(), 0.0);
    }

    #[test]
    fn iterations_per_second_from_total() {
        let mut m = RunMetrics::default();
        m.record(step(1, 500, 0));
        m.record(step(0, 500, 0));
        assert!((m.iterations_per_second() - 2.0).abs() < 1e-9);
    }
}
