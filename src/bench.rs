//! Multi-prompt benchmark harness.
//!
//! Runs the full generation pipeline once per prompt, timing the
//! sampling loop and tracking peak memory. The first run is reported
//! separately from the rest: compilation and cache warm-up make it
//! unrepresentative.

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::InferenceConfig;
use crate::error::{Result, SdError};
use crate::metrics::{ProcessRss, RunMetrics};
use crate::pipeline::StableDiffusion;
use crate::sampler::Denoiser;
use crate::text_encoder::PromptEncoder;

/// Load prompts from a CSV file with a `Prompt` header column.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path).map_err(|source| SdError::PromptSource {
        path: path.to_path_buf(),
        source,
    })?;
    let headers = reader
        .headers()
        .map_err(|source| SdError::PromptSource {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let column = headers
        .iter()
        .position(|h| h == "Prompt")
        .ok_or_else(|| SdError::EmptyPromptSource {
            path: path.to_path_buf(),
        })?;
    let mut prompts = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| SdError::PromptSource {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(prompt) = record.get(column) {
            if !prompt.trim().is_empty() {
                prompts.push(prompt.to_string());
            }
        }
    }
    if prompts.is_empty() {
        return Err(SdError::EmptyPromptSource {
            path: path.to_path_buf(),
        });
    }
    Ok(prompts)
}

/// Filename-safe rendition of a prompt: alphanumerics kept, everything
/// else replaced by underscores, truncated to 50 characters.
pub fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .take(50)
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Timing and memory statistics for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub time_seconds: f64,
    pub peak_vram_gb: f64,
    pub iterations_per_second: f64,
}

impl RunRecord {
    pub fn from_metrics(metrics: &RunMetrics) -> Self {
        Self {
            time_seconds: metrics.total_elapsed().as_secs_f64(),
            peak_vram_gb: metrics.peak_mem_bytes() as f64 / 1e9,
            iterations_per_second: metrics.iterations_per_second(),
        }
    }

    fn rounded(&self) -> Self {
        Self {
            time_seconds: round2(self.time_seconds),
            peak_vram_gb: round2(self.peak_vram_gb),
            iterations_per_second: round2(self.iterations_per_second),
        }
    }
}

/// Aggregate over runs 2..N.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsequentRuns {
    pub average: RunRecord,
    pub min: RunRecord,
    pub max: RunRecord,
    pub num_runs: usize,
}

/// Final benchmark report: the warm-up run kept apart from the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub first_run: RunRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsequent_runs: Option<SubsequentRuns>,
}

/// Aggregate per-run records into the final summary. Each statistic is
/// reduced independently (the min record is not any single run).
pub fn summarize(records: &[RunRecord]) -> Result<BenchmarkSummary> {
    let (first, rest) = match records.split_first() {
        Some(split) => split,
        None => {
            return Err(SdError::Config(
                "benchmark produced no run records".to_string(),
            ))
        }
    };
    let subsequent_runs = if rest.is_empty() {
        None
    } else {
        let n = rest.len() as f64;
        let fold = |f: fn(&RunRecord) -> f64| {
            let values: Vec<f64> = rest.iter().map(f).collect();
            let sum: f64 = values.iter().sum();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (sum / n, min, max)
        };
        let time = fold(|r| r.time_seconds);
        let vram = fold(|r| r.peak_vram_gb);
        let ips = fold(|r| r.iterations_per_second);
        let record = |t: f64, v: f64, i: f64| {
            RunRecord {
                time_seconds: t,
                peak_vram_gb: v,
                iterations_per_second: i,
            }
            .rounded()
        };
        Some(SubsequentRuns {
            average: record(time.0, vram.0, ips.0),
            min: record(time.1, vram.1, ips.1),
            max: record(time.2, vram.2, ips.2),
            num_runs: rest.len(),
        })
    };
    Ok(BenchmarkSummary {
        first_run: first.rounded(),
        subsequent_runs,
    })
}

/// Write a decoded HWC u8 tensor as a PNG named after the prompt.
pub fn save_image(image: &Tensor, dir: &Path, prompt: &str) -> Result<PathBuf> {
    let (height, width, channels) = image.dims3()?;
    if channels != 3 {
        return Err(SdError::Config(format!(
            "expected a 3-channel image, got {channels}"
        )));
    }
    let data = image.flatten_all()?.to_vec1::<u8>()?;
    let buffer = image::RgbImage::from_raw(width as u32, height as u32, data).ok_or_else(|| {
        SdError::Config(format!("image buffer mismatch for {width}x{height}"))
    })?;
    let path = dir.join(format!("{}.png", sanitize_prompt(prompt)));
    buffer.save(&path)?;
    Ok(path)
}

fn open_viewer(path: &Path) {
    let program = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    if let Err(e) = std::process::Command::new(program).arg(path).spawn() {
        warn!(path = %path.display(), error = %e, "could not open image viewer");
    }
}

/// Run the benchmark over every prompt in order.
///
/// Per-prompt failures are not isolated: the first error aborts the
/// remaining prompts, and records for completed prompts are dropped
/// with it.
pub fn run_benchmark<D: Denoiser, E: PromptEncoder>(
    pipeline: &StableDiffusion<D>,
    encoder: &mut E,
    prompts: &[String],
    config: &InferenceConfig,
) -> Result<BenchmarkSummary> {
    if prompts.is_empty() {
        return Err(SdError::Config("no prompts to benchmark".to_string()));
    }
    let schedule = pipeline.schedule(config.steps)?;
    let probe = ProcessRss;
    let out_dir = match &config.out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => std::env::temp_dir(),
    };

    let mut records = Vec::with_capacity(prompts.len());
    for (idx, prompt) in prompts.iter().enumerate() {
        let run = idx + 1;
        info!(run, total = prompts.len(), prompt, "generating");

        let context = encoder.encode(prompt)?;
        let uncond = encoder.encode_uncond()?;
        let latent = pipeline.init_latent(config.seed.map(|s| s + run as u64))?;

        let (latent, metrics) = pipeline.generate(
            &uncond,
            &context,
            latent,
            &schedule,
            config.guidance_scale,
            &probe,
        )?;
        if config.timing {
            for step in &metrics.steps {
                info!(
                    index = step.index,
                    timestep = step.timestep,
                    elapsed_ms = step.elapsed.as_secs_f64() * 1e3,
                    "step timing"
                );
            }
        }
        let record = RunRecord::from_metrics(&metrics);
        info!(
            run,
            time_s = format!("{:.2}", record.time_seconds),
            peak_gb = format!("{:.2}", record.peak_vram_gb),
            iters_per_s = format!("{:.2}", record.iterations_per_second),
            "run complete"
        );

        let image = pipeline.decode_latent(&latent)?;
        let path = save_image(&image, &out_dir, prompt)?;
        info!(path = %path.display(), "image saved");
        if config.show {
            open_viewer(&path);
        }

        records.push(record);
    }

    let summary = summarize(&records)?;
    log_summary(&summary);
    let stats_path = out_dir.join("benchmark_stats.json");
    std::fs::write(&stats_path, serde_json::to_string_pretty(&summary)?)?;
    info!(path = %stats_path.display(), "benchmark results saved");
    Ok(summary)
}

fn log_summary(summary: &BenchmarkSummary) {
    let f = &summary.first_run;
    info!(
        time_s = f.time_seconds,
        peak_gb = f.peak_vram_gb,
        iters_per_s = f.iterations_per_second,
        "first run (warm-up)"
    );
    if let Some(rest) = &summary.subsequent_runs {
        info!(
            num_runs = rest.num_runs,
            avg_time_s = rest.average.time_seconds,
            min_time_s = rest.min.time_seconds,
            max_time_s = rest.max.time_seconds,
            avg_iters_per_s = rest.average.iterations_per_second,
            "subsequent runs"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(t: f64, v: f64, i: f64) -> RunRecord {
        RunRecord {
            time_seconds: t,
            peak_vram_gb: v,
            iterations_per_second: i,
        }
    }

    #[test]
    fn sanitize_keeps_alphanumerics() {
        assert_eq!(
            sanitize_prompt("a red cube, on white!"),
            "a_red_cube__on_white_"
        );
    }

    #[test]
    fn sanitize_truncates_to_fifty() {
        let long = "x".repeat(80);
        assert_eq!(sanitize_prompt(&long).chars().count(), 50);
    }

    #[test]
    fn summary_separates_first_run() {
        let records = vec![
            record(1.0, 0.5, 6.0),
            record(2.0, 1.0, 3.0),
            record(3.0, 2.0, 2.0),
        ];
        let summary = summarize(&records).unwrap();
        assert_eq!(summary.first_run.time_seconds, 1.0);
        let rest = summary.subsequent_runs.unwrap();
        assert_eq!(rest.average.time_seconds, 2.5);
        assert_eq!(rest.min.time_seconds, 2.0);
        assert_eq!(rest.max.time_seconds, 3.0);
        assert_eq!(rest.num_runs, 2);
    }

    #[test]
    fn single_run_has_no_subsequent_block() {
        let summary = summarize(&[record(1.0, 0.5, 6.0)]).unwrap();
        assert!(summary.subsequent_runs.is_none());
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("subsequent_runs").is_none());
        assert_eq!(json["first_run"]["time_seconds"], 1.0);
    }

    #[test]
    fn summary_rounds_to_two_decimals() {
        let records = vec![record(1.0, 0.5, 6.0), record(2.3456, 1.2345, 3.9876)];
        let summary = summarize(&records).unwrap();
        let rest = summary.subsequent_runs.unwrap();
        assert_eq!(rest.average.time_seconds, 2.35);
        assert_eq!(rest.average.peak_vram_gb, 1.23);
        assert_eq!(rest.average.iterations_per_second, 3.99);
    }

    #[test]
    fn empty_records_error() {
        assert!(summarize(&[]).is_err());
    }

    #[test]
    fn summary_json_field_names() {
        let records = vec![record(1.0, 0.5, 6.0), record(2.0, 1.0, 3.0)];
        let summary = summarize(&records).unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["first_run"]["peak_vram_gb"].is_number());
        assert!(json["subsequent_runs"]["average"]["iterations_per_second"].is_number());
        assert_eq!(json["subsequent_runs"]["num_runs"], 2);
    }
}
