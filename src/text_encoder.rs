//! CLIP text conditioning.
//!
//! Thin wrapper over the CLIP text transformer from candle-transformers
//! plus the BPE tokenizer. The transformer internals are opaque to the
//! sampling core; this module only produces context embeddings.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip::{ClipTextTransformer, Config};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::error::{Result, SdError};

/// Produces context embeddings for prompts. The unconditional embedding
/// is prompt-invariant and may be cached by implementations.
pub trait PromptEncoder {
    fn encode(&mut self, prompt: &str) -> Result<Tensor>;

    /// Embedding of the empty string, used as the unconditional branch
    /// of classifier-free guidance.
    fn encode_uncond(&mut self) -> Result<Tensor>;
}

/// CLIP tokenizer + text transformer for SD v1 checkpoints.
pub struct ClipTextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    config: Config,
    pad_id: u32,
    device: Device,
    uncond_cache: Option<Tensor>,
}

impl ClipTextEncoder {
    pub fn new(
        tokenizer_path: impl AsRef<Path>,
        vb: VarBuilder,
        config: Config,
        device: Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref())
            .map_err(|e| SdError::Tokenizer(e.to_string()))?;
        let pad_token = match &config.pad_with {
            Some(token) => token.clone(),
            None => "<|endoftext|>".to_string(),
        };
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .copied()
            .ok_or_else(|| SdError::Tokenizer(format!("missing pad token {pad_token:?}")))?;
        let model = ClipTextTransformer::new(vb, &config)?;
        Ok(Self {
            tokenizer,
            model,
            config,
            pad_id,
            device,
            uncond_cache: None,
        })
    }

    fn tokenize(&self, text: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| SdError::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        let max = self.config.max_position_embeddings;
        if tokens.len() > max {
            return Err(SdError::PromptTooLong {
                len: tokens.len(),
                max,
            });
        }
        tokens.resize(max, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    fn embed(&self, text: &str) -> Result<Tensor> {
        let tokens = self.tokenize(text)?;
        let embedding = self.model.forward(&tokens)?;
        Ok(embedding.to_dtype(DType::F32)?)
    }
}

impl PromptEncoder for ClipTextEncoder {
    fn encode(&mut self, prompt: &str) -> Result<Tensor> {
        debug!(prompt, "encoding prompt");
        self.embed(prompt)
    }

    fn encode_uncond(&mut self) -> Result<Tensor> {
        if let Some(cached) = &self.uncond_cache {
            return Ok(cached.clone());
        }
        let embedding = self.embed("")?;
        self.uncond_cache = Some(embedding.clone());
        Ok(embedding)
    }
}
