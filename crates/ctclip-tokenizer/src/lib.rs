//! BPE tokenizer for the CT-CLIP text encoder
//!
//! This crate provides:
//! - BPE training and `tokenizer.json` persistence
//! - Token encoding and decoding
//! - Fixed-length prompt encoding (pad/truncate with an attention mask)
//!
//! # Example
//!
//! ```no_run
//! use ctclip_tokenizer::Tokenizer;
//!
//! let corpus = ["no acute findings", "bilateral pleural effusion"];
//! let tokenizer = Tokenizer::train_from_iterator(corpus.iter(), 500)?;
//!
//! // The fine-tuning loop always encodes the empty string
//! let prompt = tokenizer.encode_padded("", 200)?;
//! assert_eq!(prompt.input_ids.len(), 200);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod prompt;

pub use aprender::text::tokenize::BpeTokenizer;
pub use prompt::{TokenizedPrompt, PAD_TOKEN};

use anyhow::{Context, Result};
use std::path::Path;

/// Serialized form of `tokenizer.json`: vocabulary and merge rules only
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TokenizerData {
    /// Token to ID mapping
    pub vocabulary: std::collections::HashMap<String, u32>,
    /// BPE merge rules
    pub merges: Vec<(String, String)>,
}

/// Tokenizer for radiology report text
///
/// Uses `aprender::text::tokenize::BpeTokenizer` internally.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    bpe: BpeTokenizer,
}

impl Tokenizer {
    /// Train a new tokenizer from an iterator of text
    ///
    /// # Arguments
    /// * `text_iterator` - Iterator over training text
    /// * `vocab_size` - Target vocabulary size
    pub fn train_from_iterator<I, S>(text_iterator: I, vocab_size: usize) -> Result<Self>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        let corpus_owned: Vec<String> = text_iterator.map(|s| s.as_ref().to_string()).collect();
        let corpus: Vec<&str> = corpus_owned.iter().map(|s| s.as_str()).collect();

        let bpe = BpeTokenizer::train(&corpus, vocab_size)
            .map_err(|e| anyhow::anyhow!("Failed to train BPE tokenizer: {}", e))?;

        Ok(Self { bpe })
    }

    /// Encode text to token IDs
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        self.bpe.encode(text).map_err(|e| anyhow::anyhow!("Encoding failed: {}", e))
    }

    /// Encode text into a prompt of exactly `max_length` tokens
    ///
    /// Longer inputs are truncated; shorter ones are right-padded with
    /// [`Tokenizer::pad_id`] and masked out.
    pub fn encode_padded(&self, text: &str, max_length: usize) -> Result<TokenizedPrompt> {
        let ids = self.encode(text)?;
        Ok(TokenizedPrompt::from_ids(ids, max_length, self.pad_id()))
    }

    /// Decode token IDs to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.bpe.decode(ids).map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// ID of the padding token, or 0 when the vocabulary has none
    pub fn pad_id(&self) -> u32 {
        self.bpe.token_to_id(PAD_TOKEN).unwrap_or(0)
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.bpe.vocab_size()
    }

    /// Load tokenizer from a directory containing `tokenizer.json`
    ///
    /// # Errors
    /// Returns an error if the tokenizer file is missing, unreadable or malformed
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer_file = path.join("tokenizer.json");

        if !tokenizer_file.exists() {
            anyhow::bail!("Tokenizer file not found: {}", tokenizer_file.display());
        }

        let content = std::fs::read_to_string(&tokenizer_file).with_context(|| {
            format!(
                "Failed to read tokenizer file: {}",
                tokenizer_file.display()
            )
        })?;

        let data: TokenizerData =
            serde_json::from_str(&content).context("Failed to parse tokenizer JSON")?;

        let bpe = BpeTokenizer::from_vocab(data.vocabulary, data.merges);

        Ok(Self { bpe })
    }

    /// Save tokenizer to `<path>/tokenizer.json`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        let tokenizer_file = path.join("tokenizer.json");
        let data = TokenizerData {
            vocabulary: self.bpe.vocab().clone(),
            merges: self.bpe.merges().to_vec(),
        };

        let content = serde_json::to_string(&data).context("Failed to serialize tokenizer")?;
        std::fs::write(&tokenizer_file, content).with_context(|| {
            format!(
                "Failed to write tokenizer file: {}",
                tokenizer_file.display()
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_tokenizer() -> Tokenizer {
        let corpus = [
            "no acute cardiopulmonary findings",
            "bilateral pleural effusion",
            "mild emphysema in the upper lobes",
        ];
        Tokenizer::train_from_iterator(corpus.iter(), 500).expect("Failed to train tokenizer")
    }

    #[test]
    fn test_empty_text_encodes_to_nothing() {
        let tokenizer = report_tokenizer();
        assert!(tokenizer.encode("").unwrap().is_empty());
    }

    #[test]
    fn test_encode_padded_has_fixed_length() {
        let tokenizer = report_tokenizer();
        let prompt = tokenizer.encode_padded("", 200).unwrap();
        assert_eq!(prompt.len(), 200);
        assert_eq!(prompt.num_tokens(), 0);

        let prompt = tokenizer.encode_padded("pleural effusion", 200).unwrap();
        assert_eq!(prompt.len(), 200);
        assert!(prompt.num_tokens() > 0);
    }
}
