//! Fixed-length prompt encoding for the text encoder

use serde::{Deserialize, Serialize};

/// Padding token looked up in the vocabulary before falling back to id 0
pub const PAD_TOKEN: &str = "<|pad|>";

/// Token IDs padded or truncated to a fixed context length
///
/// `attention_mask[i]` is 1 for real tokens and 0 for padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedPrompt {
    /// Token IDs, exactly `max_length` entries
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u8>,
}

impl TokenizedPrompt {
    /// Build a prompt from raw IDs: truncate to `max_length`, right-pad with `pad_id`
    pub fn from_ids(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> Self {
        ids.truncate(max_length);
        let real = ids.len();

        let mut attention_mask = vec![1u8; real];
        attention_mask.resize(max_length, 0);
        ids.resize(max_length, pad_id);

        Self {
            input_ids: ids,
            attention_mask,
        }
    }

    /// Context length of the prompt
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// True for a zero-length context
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of non-padding tokens
    pub fn num_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_prompt_is_all_padding() {
        let prompt = TokenizedPrompt::from_ids(Vec::new(), 200, 7);
        assert_eq!(prompt.len(), 200);
        assert_eq!(prompt.num_tokens(), 0);
        assert!(prompt.input_ids.iter().all(|&id| id == 7));
    }

    #[test]
    fn test_truncation() {
        let prompt = TokenizedPrompt::from_ids((0..10).collect(), 4, 0);
        assert_eq!(prompt.input_ids, vec![0, 1, 2, 3]);
        assert_eq!(prompt.attention_mask, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_padding_mask() {
        let prompt = TokenizedPrompt::from_ids(vec![5, 6], 4, 0);
        assert_eq!(prompt.input_ids, vec![5, 6, 0, 0]);
        assert_eq!(prompt.attention_mask, vec![1, 1, 0, 0]);
    }
}
