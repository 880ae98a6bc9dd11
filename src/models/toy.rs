//! Deterministic built-in backend for exercising the API without weights.
//!
//! `ToyLm` is a tied-embedding bigram scorer: a seeded embedding table scores
//! the next token by similarity to the last token's embedding. Positional
//! embeddings are sinusoidal and attention maps are synthesized with a
//! distance-decay causal pattern. It is not a transformer and makes no
//! attempt to be one; it exists so tokenization, embedding, attention, and
//! generation endpoints all return well-formed data deterministically.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use std::any::Any;

use super::{CausalLm, DecoderCache};

/// Configuration for [`ToyLm`].
#[derive(Debug, Clone)]
pub struct ToyConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Seed for the embedding table; same seed, same model.
    pub seed: u64,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 64,
            num_layers: 4,
            num_heads: 4,
            seed: 0,
        }
    }
}

/// Incremental state: the toy model only ever looks at the last token, so the
/// cache is just the absorbed token history.
struct ToyCache {
    tokens: Vec<u32>,
}

impl DecoderCache for ToyCache {
    fn seq_len(&self) -> usize {
        self.tokens.len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Deterministic CPU-only backend.
pub struct ToyLm {
    config: ToyConfig,
    device: Device,
    /// Tied embedding table, `[vocab, hidden]`, values in [-1, 1].
    embeddings: Tensor,
}

impl ToyLm {
    pub fn new(config: ToyConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("vocab_size must be > 0");
        }
        if config.hidden_size == 0 || config.num_layers == 0 || config.num_heads == 0 {
            bail!("hidden_size, num_layers, and num_heads must all be > 0");
        }

        let device = Device::Cpu;
        // LCG-filled table so the same seed always builds the same model.
        let mut state = config
            .seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let n = config.vocab_size * config.hidden_size;
        let mut data = Vec::with_capacity(n);
        for _ in 0..n {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = ((state >> 33) as f32) / ((1u64 << 31) as f32);
            data.push(unit * 2.0 - 1.0);
        }
        let embeddings =
            Tensor::from_vec(data, (config.vocab_size, config.hidden_size), &device)?;

        Ok(Self {
            config,
            device,
            embeddings,
        })
    }

    fn check_ids(&self, tokens: &[u32]) -> Result<()> {
        if let Some(&id) = tokens.iter().find(|&&id| id as usize >= self.config.vocab_size) {
            bail!(
                "token id {id} out of range for vocab size {}",
                self.config.vocab_size
            );
        }
        Ok(())
    }
}

impl CausalLm for ToyLm {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn new_cache(&self, capacity: usize) -> Box<dyn DecoderCache> {
        Box::new(ToyCache {
            tokens: Vec::with_capacity(capacity),
        })
    }

    fn forward(&self, tokens: &[u32], cache: &mut dyn DecoderCache) -> Result<Tensor> {
        self.check_ids(tokens)?;
        if tokens.is_empty() {
            bail!("forward pass requires at least one token");
        }
        let cache = match cache.as_any_mut().downcast_mut::<ToyCache>() {
            Some(c) => c,
            None => bail!("decoder cache type mismatch: expected a ToyLm cache"),
        };
        cache.tokens.extend_from_slice(tokens);

        // Bigram scoring: similarity of the last token's embedding to every
        // row of the tied table.
        let last = *cache.tokens.last().unwrap() as usize;
        let row = self.embeddings.narrow(0, last, 1)?; // [1, hidden]
        let logits = row.matmul(&self.embeddings.t()?)?.squeeze(0)?; // [vocab]
        let scale = 1.0 / (self.config.hidden_size as f64).sqrt();
        Ok(logits.affine(scale, 0.0)?)
    }

    fn token_embeddings(&self, tokens: &[u32]) -> Result<Tensor> {
        self.check_ids(tokens)?;
        let ids = Tensor::from_vec(tokens.to_vec(), tokens.len(), &self.device)?;
        Ok(self.embeddings.index_select(&ids, 0)?)
    }

    fn position_embeddings(&self, len: usize) -> Result<Tensor> {
        let hidden = self.config.hidden_size;
        let mut data = Vec::with_capacity(len * hidden);
        for pos in 0..len {
            for i in 0..hidden {
                let freq_exp = (i - i % 2) as f32 / hidden as f32;
                let angle = pos as f32 / 10000f32.powf(freq_exp);
                data.push(if i % 2 == 0 { angle.sin() } else { angle.cos() });
            }
        }
        Ok(Tensor::from_vec(data, (len, hidden), &self.device)?)
    }

    fn attention_maps(&self, tokens: &[u32]) -> Result<Vec<Tensor>> {
        self.check_ids(tokens)?;
        let seq = tokens.len();
        if seq == 0 {
            bail!("attention maps require at least one token");
        }

        let mut layers = Vec::with_capacity(self.config.num_layers);
        for layer in 0..self.config.num_layers {
            let mut scores = Vec::with_capacity(self.config.num_heads * seq * seq);
            for head in 0..self.config.num_heads {
                // Each head attends with its own distance decay; future
                // positions are masked out.
                let decay = 0.3 * (head + 1) as f32 / (layer + 1) as f32;
                for i in 0..seq {
                    for j in 0..seq {
                        let score = if j <= i {
                            -((i - j) as f32) * decay
                        } else {
                            f32::NEG_INFINITY
                        };
                        scores.push(score);
                    }
                }
            }
            let scores = Tensor::from_vec(
                scores,
                (self.config.num_heads, seq, seq),
                &self.device,
            )?;
            layers.push(candle_nn::ops::softmax(&scores, 2)?);
        }
        Ok(layers)
    }
}
