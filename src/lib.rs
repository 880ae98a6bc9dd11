//! lmlens: an inspection API for causal language models.
//!
//! Exposes what a model does with a piece of text at every stage that is
//! interesting to look at: the token breakdown, the embedding matrices, the
//! per-layer attention maps, the next-token probability distribution, and a
//! streaming view of autoregressive generation. The model itself sits behind
//! the [`models::CausalLm`] trait; the built-in [`models::ToyLm`] backend
//! exercises everything deterministically without weights.

pub mod generation;
pub mod models;
pub mod tokenizer;

use anyhow::{bail, Result};
use candle_core::Device;
use serde::Serialize;

use generation::{
    sample_from_logits, softmax_probs, GenerationStream, SamplingContext, SamplingParams,
};
use models::CausalLm;
use tokenizer::TextTokenizer;

/// Model identity and dimensions.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub device: String,
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
}

/// One position in a tokenization breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub position: usize,
    /// Raw vocabulary entry (byte-level markers intact).
    pub token: String,
    pub token_id: u32,
    /// The token decoded back to readable text.
    pub decoded: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenizationReport {
    pub original_text: String,
    pub tokens: Vec<String>,
    pub token_ids: Vec<u32>,
    pub token_info: Vec<TokenInfo>,
    pub vocab_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingReport {
    pub tokens: Vec<String>,
    pub token_embeddings: Vec<Vec<f32>>,
    pub positional_embeddings: Vec<Vec<f32>>,
    /// Element-wise sum of token and positional rows.
    pub combined_embeddings: Vec<Vec<f32>>,
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttentionLayer {
    pub layer: usize,
    pub num_heads: usize,
    /// `[head][query][key]` weights, rows summing to 1.
    pub attention_weights: Vec<Vec<Vec<f32>>>,
    /// Head-averaged `[query][key]` map.
    pub average_attention: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttentionReport {
    pub tokens: Vec<String>,
    pub attention_layers: Vec<AttentionLayer>,
    pub num_layers: usize,
}

/// One candidate in a next-token ranking.
#[derive(Debug, Clone, Serialize)]
pub struct TokenProb {
    pub token: String,
    pub token_id: u32,
    pub probability: f32,
    pub logit: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextTokenReport {
    pub input_text: String,
    pub next_token: String,
    pub next_token_id: u32,
    /// Highest-probability candidates under the temperature-scaled but
    /// otherwise unfiltered distribution, descending.
    pub top_tokens: Vec<TokenProb>,
    pub temperature: f32,
    pub vocab_size: usize,
}

/// Inspection facade: one model plus its tokenizer.
pub struct Inspector {
    model: Box<dyn CausalLm>,
    tokenizer: TextTokenizer,
    model_name: String,
}

impl Inspector {
    /// Pair a model with its tokenizer.
    ///
    /// Fails when the two disagree on vocabulary size, since every logit
    /// vector would then be un-decodable.
    pub fn new(
        model: Box<dyn CausalLm>,
        tokenizer: TextTokenizer,
        model_name: impl Into<String>,
    ) -> Result<Self> {
        if model.vocab_size() != tokenizer.vocab_size() {
            bail!(
                "model vocab size {} does not match tokenizer vocab size {}",
                model.vocab_size(),
                tokenizer.vocab_size()
            );
        }
        Ok(Self {
            model,
            tokenizer,
            model_name: model_name.into(),
        })
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    pub fn info(&self) -> ModelInfo {
        let device = match self.model.device() {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        };
        ModelInfo {
            model_name: self.model_name.clone(),
            device: device.to_string(),
            vocab_size: self.model.vocab_size(),
            n_layer: self.model.num_layers(),
            n_head: self.model.num_heads(),
            n_embd: self.model.hidden_size(),
        }
    }

    /// Per-token breakdown of `text`.
    pub fn tokenize(&self, text: &str) -> Result<TokenizationReport> {
        let token_ids = self.tokenizer.encode(text)?;
        let tokens: Vec<String> = token_ids
            .iter()
            .map(|&id| self.tokenizer.id_to_token(id).unwrap_or_default())
            .collect();

        let mut token_info = Vec::with_capacity(token_ids.len());
        for (position, (&token_id, token)) in token_ids.iter().zip(&tokens).enumerate() {
            token_info.push(TokenInfo {
                position,
                token: token.clone(),
                token_id,
                decoded: self.tokenizer.decode_token(token_id)?,
            });
        }

        Ok(TokenizationReport {
            original_text: text.to_string(),
            tokens,
            token_ids,
            token_info,
            vocab_size: self.tokenizer.vocab_size(),
        })
    }

    /// Token, positional, and combined embedding matrices for `text`.
    pub fn embeddings(&self, text: &str) -> Result<EmbeddingReport> {
        let token_ids = self.tokenizer.encode(text)?;
        if token_ids.is_empty() {
            bail!("text encodes to zero tokens");
        }

        let token_emb = self.model.token_embeddings(&token_ids)?;
        let pos_emb = self.model.position_embeddings(token_ids.len())?;
        let combined = (&token_emb + &pos_emb)?;

        Ok(EmbeddingReport {
            tokens: self.token_strings(&token_ids),
            token_embeddings: token_emb.to_vec2::<f32>()?,
            positional_embeddings: pos_emb.to_vec2::<f32>()?,
            combined_embeddings: combined.to_vec2::<f32>()?,
            embedding_dim: self.model.hidden_size(),
        })
    }

    /// Per-layer attention maps for `text`, with head averages.
    pub fn attention(&self, text: &str) -> Result<AttentionReport> {
        let token_ids = self.tokenizer.encode(text)?;
        if token_ids.is_empty() {
            bail!("text encodes to zero tokens");
        }

        let maps = self.model.attention_maps(&token_ids)?;
        let mut attention_layers = Vec::with_capacity(maps.len());
        for (layer, attn) in maps.iter().enumerate() {
            attention_layers.push(AttentionLayer {
                layer,
                num_heads: self.model.num_heads(),
                attention_weights: attn.to_vec3::<f32>()?,
                average_attention: attn.mean(0)?.to_vec2::<f32>()?,
            });
        }

        Ok(AttentionReport {
            tokens: self.token_strings(&token_ids),
            num_layers: attention_layers.len(),
            attention_layers,
        })
    }

    /// One-shot next-token prediction for `text`.
    ///
    /// The `top_tokens` ranking shows the temperature-scaled distribution
    /// before top-k/top-p truncation, so the visualization reflects what the
    /// model actually believes; the chosen token goes through the full
    /// sampling pipeline.
    pub fn next_token(
        &self,
        text: &str,
        params: &SamplingParams,
        top_n: usize,
        seed: Option<u64>,
    ) -> Result<NextTokenReport> {
        let token_ids = self.tokenizer.encode(text)?;
        if token_ids.is_empty() {
            bail!("text encodes to zero tokens");
        }

        let mut cache = self.model.new_cache(token_ids.len() + 1);
        let logits = self.model.forward(&token_ids, cache.as_mut())?;
        let logits = logits.to_vec1::<f32>()?;
        if logits.len() != self.model.vocab_size() {
            bail!(
                "model returned {} logits, expected vocab size {}",
                logits.len(),
                self.model.vocab_size()
            );
        }

        let display_probs = softmax_probs(&logits, params.temperature)?;
        let mut order: Vec<usize> = (0..display_probs.len()).collect();
        order.sort_unstable_by(|&a, &b| {
            display_probs[b]
                .partial_cmp(&display_probs[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut top_tokens = Vec::with_capacity(top_n.min(order.len()));
        for &idx in order.iter().take(top_n) {
            top_tokens.push(TokenProb {
                token: self.tokenizer.decode_token(idx as u32)?,
                token_id: idx as u32,
                probability: display_probs[idx],
                logit: logits[idx],
            });
        }

        let mut ctx = SamplingContext::new(seed);
        let (next_token_id, _) = sample_from_logits(&logits, params, &mut ctx)?;

        Ok(NextTokenReport {
            input_text: text.to_string(),
            next_token: self.tokenizer.decode_token(next_token_id)?,
            next_token_id,
            top_tokens,
            temperature: params.temperature,
            vocab_size: self.model.vocab_size(),
        })
    }

    /// Start a streaming generation session over `prompt`.
    pub fn stream_generation(
        &self,
        prompt: &str,
        params: SamplingParams,
        max_new_tokens: usize,
        seed: Option<u64>,
    ) -> Result<GenerationStream<'_>> {
        GenerationStream::new(
            self.model.as_ref(),
            &self.tokenizer,
            prompt,
            params,
            max_new_tokens,
            seed,
        )
    }

    fn token_strings(&self, token_ids: &[u32]) -> Vec<String> {
        token_ids
            .iter()
            .map(|&id| self.tokenizer.id_to_token(id).unwrap_or_default())
            .collect()
    }
}
