//! Crate-wide error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not read prompts from {path}: {source}")]
    PromptSource {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("no usable prompts in {path} (expected a `Prompt` column with at least one row)")]
    EmptyPromptSource { path: PathBuf },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("prompt tokenizes to {len} tokens, the text encoder accepts at most {max}")]
    PromptTooLong { len: usize, max: usize },

    #[error("weights file not found: {path}")]
    WeightsNotFound { path: PathBuf },

    #[error("could not fetch weights: {0}")]
    WeightFetch(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SdError>;
