//! Streaming autoregressive generation.
//!
//! [`GenerationStream`] drives one generation session as an iterator over
//! [`StreamEvent`]s: the echoed prompt first, then one event per generated
//! token, then exactly one `Done` event. The decoder cache is created with
//! the stream, owned exclusively by it, and dropped with it.

use anyhow::{bail, Context, Result};

use crate::generation::{sample_from_logits, SamplingContext, SamplingParams};
use crate::models::{CausalLm, DecoderCache};
use crate::tokenizer::TextTokenizer;

/// Why a generation stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced the end-of-sequence token.
    EosToken,
    /// The `max_new_tokens` budget was exhausted.
    MaxTokens,
}

/// One event in a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Emitted once at the start, echoing the decoded prompt.
    Prompt { text: String },
    /// One generated token and the accumulated text so far. The
    /// end-of-sequence token is emitted like any other token before the
    /// stream finishes.
    Token { token: String, text: String },
    /// Emitted exactly once at the end.
    Done {
        final_text: String,
        reason: StopReason,
    },
}

enum State {
    Priming,
    Stepping,
    Done,
}

/// Iterator over the events of one generation session.
///
/// Yields `Result<StreamEvent>`; any error transitions the stream to its
/// terminal state, so iteration ends after the error is observed.
pub struct GenerationStream<'a> {
    model: &'a dyn CausalLm,
    tokenizer: &'a TextTokenizer,
    params: SamplingParams,
    max_new_tokens: usize,
    ctx: SamplingContext,
    cache: Box<dyn DecoderCache>,
    state: State,
    prompt_ids: Vec<u32>,
    last_token: u32,
    text: String,
    steps: usize,
    stop: Option<StopReason>,
}

impl<'a> GenerationStream<'a> {
    /// Set up a generation session over `prompt`.
    ///
    /// The prompt is encoded eagerly; an empty prompt (or one that encodes to
    /// zero tokens) is rejected here rather than mid-stream. The forward
    /// passes themselves run lazily as the stream is driven.
    pub fn new(
        model: &'a dyn CausalLm,
        tokenizer: &'a TextTokenizer,
        prompt: &str,
        params: SamplingParams,
        max_new_tokens: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        let prompt_ids = tokenizer.encode(prompt)?;
        if prompt_ids.is_empty() {
            bail!("prompt encodes to zero tokens");
        }
        let cache = model.new_cache(prompt_ids.len() + max_new_tokens);
        let last_token = *prompt_ids.last().unwrap();

        Ok(Self {
            model,
            tokenizer,
            params,
            max_new_tokens,
            ctx: SamplingContext::new(seed),
            cache,
            state: State::Priming,
            prompt_ids,
            last_token,
            text: String::new(),
            steps: 0,
            stop: None,
        })
    }

    /// Full-prompt forward pass to establish the cache, then echo the prompt.
    fn prime(&mut self) -> Result<StreamEvent> {
        self.model
            .forward(&self.prompt_ids, self.cache.as_mut())
            .context("prompt forward pass failed")?;
        self.text = self.tokenizer.decode(&self.prompt_ids)?;
        Ok(StreamEvent::Prompt {
            text: self.text.clone(),
        })
    }

    /// One incremental step: forward the previous token, sample, decode.
    fn step(&mut self) -> Result<StreamEvent> {
        if let Some(reason) = self.stop.take() {
            self.state = State::Done;
            return Ok(StreamEvent::Done {
                final_text: self.text.clone(),
                reason,
            });
        }
        if self.steps >= self.max_new_tokens {
            self.state = State::Done;
            return Ok(StreamEvent::Done {
                final_text: self.text.clone(),
                reason: StopReason::MaxTokens,
            });
        }

        let logits = self
            .model
            .forward(&[self.last_token], self.cache.as_mut())
            .context("incremental forward pass failed")?;
        let logits = logits.to_vec1::<f32>()?;
        if logits.len() != self.model.vocab_size() {
            bail!(
                "model returned {} logits, expected vocab size {}",
                logits.len(),
                self.model.vocab_size()
            );
        }

        let (token_id, _) = sample_from_logits(&logits, &self.params, &mut self.ctx)?;
        let token = self.tokenizer.decode_token(token_id)?;
        self.text.push_str(&token);
        self.last_token = token_id;
        self.steps += 1;

        if token_id == self.tokenizer.eos_token_id {
            self.stop = Some(StopReason::EosToken);
        }

        Ok(StreamEvent::Token {
            token,
            text: self.text.clone(),
        })
    }
}

impl Iterator for GenerationStream<'_> {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match self.state {
            State::Priming => self.prime().inspect(|_| self.state = State::Stepping),
            State::Stepping => self.step(),
            State::Done => return None,
        };
        if result.is_err() {
            self.state = State::Done;
        }
        Some(result)
    }
}
