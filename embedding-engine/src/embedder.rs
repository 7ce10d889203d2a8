//! Text embedders.
//!
//! Both implementations return one L2-normalized vector per input text, so cosine
//! similarity reduces to a dot product downstream.

use crate::similarity::l2_normalize;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use personasim_core::{CoreError, EmbeddingError};
use std::path::Path;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
}

/// Feature-hashed term frequencies over lowercased alphanumeric tokens.
///
/// Texts sharing vocabulary land close together; needs no model files.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let bucket = (fnv1a(token.as_bytes()) % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ *byte as u64).wrapping_mul(PRIME))
}

/// BERT-family sentence-transformer run locally on CPU.
///
/// Expects `config.json`, `tokenizer.json` and `model.safetensors` in the model
/// directory. Token embeddings are mean-pooled under the attention mask.
pub struct SentenceEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl SentenceEmbedder {
    pub fn load(model_dir: &Path) -> Result<Self, CoreError> {
        let config_path = model_dir.join("config.json");
        let tokenizer_path = model_dir.join("tokenizer.json");
        let weights_path = model_dir.join("model.safetensors");

        for path in [&config_path, &tokenizer_path, &weights_path] {
            if !path.exists() {
                return Err(EmbeddingError::ModelLoadingFailed {
                    model_path: path.display().to_string(),
                }
                .into());
            }
        }

        let load_failed = |_: candle_core::Error| EmbeddingError::ModelLoadingFailed {
            model_path: model_dir.display().to_string(),
        };

        let config_text = std::fs::read_to_string(&config_path)?;
        let config: BertConfig = serde_json::from_str(&config_text)?;
        let raw_config = serde_json::from_str::<serde_json::Value>(&config_text)?;
        let dimension = raw_config
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| EmbeddingError::ModelLoadingFailed {
                model_path: config_path.display().to_string(),
            })? as usize;
        let max_tokens = raw_config
            .get("max_position_embeddings")
            .and_then(|v| v.as_u64())
            .map_or(DEFAULT_MAX_TOKENS, |v| v as usize);

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            EmbeddingError::TokenizationFailed {
                reason: e.to_string(),
            }
        })?;
        configure_tokenizer(&mut tokenizer, max_tokens)?;

        let device = Device::Cpu;
        // Safety: the weights file is memory-mapped read-only and not modified while loaded.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                .map_err(load_failed)?
        };
        let model = BertModel::load(vb, &config).map_err(load_failed)?;

        info!(
            "Loaded sentence embedding model from {} (dimension {}, {} tokens max)",
            model_dir.display(),
            dimension,
            max_tokens
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension,
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbeddingError::TokenizationFailed {
                reason: e.to_string(),
            })?;

        let inference = |e: candle_core::Error| EmbeddingError::InferenceFailed {
            reason: e.to_string(),
        };

        let ids = encodings
            .iter()
            .map(|enc| Tensor::new(enc.get_ids(), &self.device))
            .collect::<Result<Vec<_>, _>>()
            .map_err(inference)?;
        let masks = encodings
            .iter()
            .map(|enc| Tensor::new(enc.get_attention_mask(), &self.device))
            .collect::<Result<Vec<_>, _>>()
            .map_err(inference)?;

        let input_ids = Tensor::stack(&ids, 0).map_err(inference)?;
        let token_type_ids = input_ids.zeros_like().map_err(inference)?;
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids)
            .map_err(inference)?;

        // [batch, tokens] -> [batch, tokens, 1]
        let mask = Tensor::stack(&masks, 0)
            .and_then(|m| m.to_dtype(DType::F32))
            .and_then(|m| m.unsqueeze(2))
            .map_err(inference)?;
        let summed = hidden
            .broadcast_mul(&mask)
            .and_then(|t| t.sum(1))
            .map_err(inference)?;
        // Every encoding carries at least its special tokens, so counts are non-zero.
        let counts = mask.sum(1).map_err(inference)?;
        let pooled = summed.broadcast_div(&counts).map_err(inference)?;

        let mut vectors = pooled.to_vec2::<f32>().map_err(inference)?;
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

/// BERT position embeddings cover this many tokens unless `config.json` says otherwise.
const DEFAULT_MAX_TOKENS: usize = 512;

/// Pads each batch to its longest encoding and cuts encodings at `max_tokens`, special
/// tokens included. Longer inputs would index past the position embeddings.
fn configure_tokenizer(tokenizer: &mut Tokenizer, max_tokens: usize) -> Result<(), EmbeddingError> {
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_tokens,
            ..Default::default()
        }))
        .map_err(|e| EmbeddingError::TokenizationFailed {
            reason: e.to_string(),
        })?;
    Ok(())
}

impl Embedder for SentenceEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embed_batch(texts)?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            }
            .into());
        }
        debug!(batch_size = texts.len(), "Computed sentence embeddings");
        Ok(vectors)
    }
}
