//! Text tokenizer wrapper over HuggingFace `tokenizers`.

use anyhow::{anyhow, Result};
use std::path::Path;
use tokenizers::Tokenizer;

/// GPT-2 family end-of-text id, used when the vocabulary carries none of the
/// known end-of-sequence tokens.
const GPT2_EOS_TOKEN_ID: u32 = 50256;

/// Text tokenizer wrapping HuggingFace tokenizers
#[derive(Debug)]
pub struct TextTokenizer {
    tokenizer: Tokenizer,
    /// End of sequence token ID
    pub eos_token_id: u32,
}

impl TextTokenizer {
    /// Load tokenizer from a local path or HuggingFace model ID.
    ///
    /// Resolution order:
    /// 1. Direct file path to `tokenizer.json`
    /// 2. Directory containing `tokenizer.json`
    /// 3. HuggingFace Hub download (if `hub` feature enabled)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let path = Path::new(model_id);

        // 1. Direct file path
        if path.is_file() {
            return Self::from_file(path);
        }

        // 2. Directory containing tokenizer.json
        if path.join("tokenizer.json").exists() {
            return Self::from_file(path.join("tokenizer.json"));
        }

        // 3. Local dir exists but has no tokenizer → clear error
        if path.is_dir() {
            anyhow::bail!(
                "No tokenizer files found in '{}'. Expected tokenizer.json.",
                model_id
            );
        }

        // 4. Treat as HF Hub repo ID
        #[cfg(feature = "hub")]
        {
            tracing::info!("Downloading tokenizer from HuggingFace Hub: {}", model_id);
            let api = hf_hub::api::sync::Api::new()
                .map_err(|e| anyhow!("Failed to create HuggingFace API: {}", e))?;
            let repo = api.model(model_id.to_string());
            let file = repo
                .get("tokenizer.json")
                .map_err(|e| anyhow!("Failed to download tokenizer from '{}': {}", model_id, e))?;
            Self::from_file(&file)
        }

        #[cfg(not(feature = "hub"))]
        Err(anyhow!(
            "No tokenizer found at '{}' and hub feature is disabled",
            model_id
        ))
    }

    /// Load tokenizer from a local file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;

        Self::from_tokenizer(tokenizer)
    }

    /// Create from a tokenizers::Tokenizer instance
    ///
    /// This is useful for creating tokenizers from custom configurations in tests.
    pub fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self> {
        // Resolve the end-of-sequence id from the vocabulary; fall back to
        // the GPT-2 id when none of the known EOS tokens exist.
        let eos_token_id = tokenizer
            .token_to_id("<|endoftext|>")
            .or_else(|| tokenizer.token_to_id("</s>"))
            .or_else(|| tokenizer.token_to_id("<|im_end|>"))
            .unwrap_or(GPT2_EOS_TOKEN_ID);

        Ok(Self {
            tokenizer,
            eos_token_id,
        })
    }

    /// Encode text to token IDs
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;

        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow!("Failed to decode tokens: {}", e))?;

        Ok(text)
    }

    /// Decode a single token ID, keeping special tokens visible
    pub fn decode_token(&self, id: u32) -> Result<String> {
        let text = self
            .tokenizer
            .decode(&[id], false)
            .map_err(|e| anyhow!("Failed to decode token {}: {}", id, e))?;

        Ok(text)
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Convert token to ID
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Convert ID to token
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }
}

/// Create a simple mock tokenizer for testing
#[cfg(test)]
pub(crate) fn create_mock_tokenizer() -> Tokenizer {
    use ahash::AHashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    // Word-level model so whole words map straight to their ids
    let vocab: AHashMap<String, u32> = [
        ("hello", 0),
        ("world", 1),
        ("test", 2),
        ("the", 3),
        ("quick", 4),
        ("<|endoftext|>", 5),
        ("fox", 6),
        ("jumps", 7),
        ("over", 8),
        ("[UNK]", 9),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("[UNK]".to_string())
        .build()
        .unwrap();

    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace));
    tokenizer
}
