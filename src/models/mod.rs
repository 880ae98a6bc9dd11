//! Model backend interface and the built-in deterministic backend.
//!
//! The inspection API never implements a transformer itself; it talks to any
//! causal language model through [`CausalLm`]. Each in-flight generation owns
//! one [`DecoderCache`] created by the backend, never shared across requests.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::any::Any;

mod toy;

pub use toy::{ToyConfig, ToyLm};

/// Opaque incremental decoding state ("past") owned by one generation stream.
///
/// Backends downcast through [`DecoderCache::as_any_mut`] to their own
/// concrete cache type.
pub trait DecoderCache: Send {
    /// Number of token positions already absorbed into the cache.
    fn seq_len(&self) -> usize;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A causal language model exposed for inspection and generation.
///
/// All methods are synchronous; the serving layer moves calls onto blocking
/// workers. Implementations must be safe to share across threads (`&self`
/// forward passes), with per-request mutability confined to the cache.
pub trait CausalLm: Send + Sync {
    /// Vocabulary size the logit vectors are defined over.
    fn vocab_size(&self) -> usize;

    /// Number of decoder layers reported by [`CausalLm::attention_maps`].
    fn num_layers(&self) -> usize;

    /// Attention heads per layer.
    fn num_heads(&self) -> usize;

    /// Embedding / hidden dimension.
    fn hidden_size(&self) -> usize;

    fn device(&self) -> &Device;

    /// Create a fresh decoder cache sized for at most `capacity` positions.
    fn new_cache(&self, capacity: usize) -> Box<dyn DecoderCache>;

    /// Absorb `tokens` into `cache` and return the next-position logits as a
    /// 1-D tensor of length [`CausalLm::vocab_size`].
    fn forward(&self, tokens: &[u32], cache: &mut dyn DecoderCache) -> Result<Tensor>;

    /// Token embedding rows, `[seq, hidden]`.
    fn token_embeddings(&self, tokens: &[u32]) -> Result<Tensor>;

    /// Positional embedding rows for positions `0..len`, `[len, hidden]`.
    fn position_embeddings(&self, len: usize) -> Result<Tensor>;

    /// Per-layer attention maps over `tokens`, each `[heads, seq, seq]` with
    /// rows summing to 1 and zeros above the diagonal.
    fn attention_maps(&self, tokens: &[u32]) -> Result<Vec<Tensor>>;
}
