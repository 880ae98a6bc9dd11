//! Next-token sampling and autoregressive generation.

mod sampling;
pub mod stream;

pub use sampling::{
    sample_from_logits, softmax_probs, top_k_filter, top_p_filter, SamplingContext,
    SamplingParams, TEMPERATURE_FLOOR,
};
pub use stream::{GenerationStream, StopReason, StreamEvent};
