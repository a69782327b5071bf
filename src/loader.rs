//! Checkpoint loading: safetensors files, tensor-name mapping between
//! checkpoint layouts, optional half-precision downcast.
//!
//! Loading is lenient: modules pull the subset of keys they need from
//! the tensor map, and unknown keys in the checkpoint are ignored.
//! Missing files are fatal before any sampling begins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, info};

use crate::error::{Result, SdError};

/// Name rewriting applied to every checkpoint tensor before lookup.
#[derive(Debug, Clone)]
pub enum MappingRule {
    Exact { from: String, to: String },
    Prefix { from: String, to: String },
    Suffix { from: String, to: String },
}

impl MappingRule {
    fn apply(&self, name: &str) -> Option<String> {
        match self {
            MappingRule::Exact { from, to } => (name == from).then(|| to.clone()),
            MappingRule::Prefix { from, to } => name
                .strip_prefix(from.as_str())
                .map(|rest| format!("{to}{rest}")),
            MappingRule::Suffix { from, to } => name
                .strip_suffix(from.as_str())
                .map(|head| format!("{head}{to}")),
        }
    }
}

/// Ordered set of mapping rules; each rule's output feeds the next.
#[derive(Debug, Clone, Default)]
pub struct NameMapping {
    rules: Vec<MappingRule>,
}

impl NameMapping {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }

    pub fn strip_prefix(prefix: impl Into<String>) -> Self {
        Self::new(vec![MappingRule::Prefix {
            from: prefix.into(),
            to: String::new(),
        }])
    }

    pub fn map_name(&self, name: &str) -> String {
        let mut current = name.to_string();
        for rule in &self.rules {
            if let Some(mapped) = rule.apply(&current) {
                current = mapped;
            }
        }
        current
    }

    pub fn apply(&self, tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
        tensors
            .into_iter()
            .map(|(name, tensor)| (self.map_name(&name), tensor))
            .collect()
    }
}

/// Load a single safetensors file into a tensor map.
pub fn load_file(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SdError::WeightsNotFound {
            path: path.to_path_buf(),
        });
    }
    info!(path = %path.display(), "loading weights");
    let tensors = candle_core::safetensors::load(path, device)?;
    debug!(count = tensors.len(), "loaded tensors");
    Ok(tensors)
}

/// Load and merge every `.safetensors` file in a directory, for
/// checkpoints sharded across multiple files. Later files win on
/// duplicate names.
pub fn load_dir(dir: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    if paths.is_empty() {
        return Err(SdError::WeightsNotFound {
            path: dir.to_path_buf(),
        });
    }
    paths.sort();
    let mut merged = HashMap::new();
    for path in paths {
        merged.extend(load_file(&path, device)?);
    }
    Ok(merged)
}

/// Downcast every tensor whose name starts with `prefix` to F16.
/// The diffusion model is the usual target; VAE and text encoder
/// weights stay in full precision.
pub fn downcast_to_f16(
    tensors: HashMap<String, Tensor>,
    prefix: &str,
) -> Result<HashMap<String, Tensor>> {
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let tensor = if name.starts_with(prefix) {
                tensor.to_dtype(DType::F16)?
            } else {
                tensor
            };
            Ok((name, tensor))
        })
        .collect()
}

/// Build a VarBuilder over an in-memory tensor map.
pub fn var_builder(
    tensors: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> VarBuilder<'static> {
    VarBuilder::from_tensors(tensors, dtype, device)
}

/// Translate a diffusers-layout VAE tensor name to the CompVis layout
/// used by this crate's modules.
///
/// Covers the resnet/attention renames, the `down_blocks`/`up_blocks`
/// restructuring (diffusers indexes up blocks in processing order, the
/// CompVis checkpoint fine-to-coarse), and the mid-block flattening.
pub fn map_diffusers_vae_name(name: &str, num_stages: usize) -> String {
    let segments: Vec<&str> = name.split('.').collect();
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    let mut i = 0;
    while i < segments.len() {
        match segments[i] {
            "down_blocks" if i + 1 < segments.len() => {
                out.push("down".to_string());
                out.push(segments[i + 1].to_string());
                i += 2;
            }
            "up_blocks" if i + 1 < segments.len() => {
                out.push("up".to_string());
                let idx: usize = segments[i + 1].parse().unwrap_or(0);
                out.push((num_stages - 1 - idx).to_string());
                i += 2;
            }
            "resnets" if i + 1 < segments.len() && out.last().map(String::as_str) == Some("mid") => {
                // mid_block.resnets.{0,1} -> mid.{block_1,block_2}
                let idx: usize = segments[i + 1].parse().unwrap_or(0);
                out.push(format!("block_{}", idx + 1));
                i += 2;
            }
            "resnets" if i + 1 < segments.len() => {
                out.push("block".to_string());
                out.push(segments[i + 1].to_string());
                i += 2;
            }
            "attentions" if i + 1 < segments.len() => {
                out.push("attn_1".to_string());
                i += 2;
            }
            "downsamplers" if i + 1 < segments.len() => {
                out.push("downsample".to_string());
                i += 2;
            }
            "upsamplers" if i + 1 < segments.len() => {
                out.push("upsample".to_string());
                i += 2;
            }
            "to_out" if i + 1 < segments.len() => {
                out.push("proj_out".to_string());
                i += 2;
            }
            "mid_block" => {
                out.push("mid".to_string());
                i += 1;
            }
            "conv_norm_out" => {
                out.push("norm_out".to_string());
                i += 1;
            }
            "group_norm" => {
                out.push("norm".to_string());
                i += 1;
            }
            "to_q" => {
                out.push("q".to_string());
                i += 1;
            }
            "to_k" => {
                out.push("k".to_string());
                i += 1;
            }
            "to_v" => {
                out.push("v".to_string());
                i += 1;
            }
            "conv_shortcut" => {
                out.push("nin_shortcut".to_string());
                i += 1;
            }
            other => {
                out.push(other.to_string());
                i += 1;
            }
        }
    }
    out.join(".")
}

/// Remap a diffusers VAE tensor map to this crate's layout, reshaping
/// the rank-2 attention projection weights into 1x1 conv kernels.
pub fn remap_diffusers_vae(
    tensors: HashMap<String, Tensor>,
    num_stages: usize,
) -> Result<HashMap<String, Tensor>> {
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let name = map_diffusers_vae_name(&name, num_stages);
            let is_attn_proj = name.contains(".attn_1.")
                && name.ends_with(".weight")
                && tensor.rank() == 2;
            let tensor = if is_attn_proj {
                tensor.unsqueeze(2)?.unsqueeze(3)?
            } else {
                tensor
            };
            Ok((name, tensor))
        })
        .collect()
}

/// Fetch a file from the Hugging Face hub, reusing the local cache.
pub fn fetch_hf(repo: &str, filename: &str) -> Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new().map_err(|e| SdError::WeightFetch(e.to_string()))?;
    api.model(repo.to_string())
        .get(filename)
        .map_err(|e| SdError::WeightFetch(e.to_string()))
}
