//! Token accounting for agent turns.
//!
//! The encoding is picked once when the counter is built: the preferred
//! model's BPE, else `cl100k_base`, else a chars/4 estimate. The choice
//! never changes afterwards, so a given text always counts the same.

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Name of the baseline encoding used when the model has no known BPE.
pub const BASELINE_ENCODING: &str = "cl100k_base";

enum Encoding {
    Bpe(CoreBPE),
    Estimate,
}

/// Deterministic token counter.
pub struct TokenCounter {
    encoding: Encoding,
    encoding_name: String,
}

impl TokenCounter {
    /// Build a counter for `model`, falling back to the baseline encoding.
    pub fn for_model(model: &str) -> Self {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => {
                return Self {
                    encoding: Encoding::Bpe(bpe),
                    encoding_name: model.to_string(),
                };
            }
            Err(e) => {
                warn!(model, error = %e, "No tokenizer for model, using {BASELINE_ENCODING}");
            }
        }

        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Self {
                encoding: Encoding::Bpe(bpe),
                encoding_name: BASELINE_ENCODING.to_string(),
            },
            Err(e) => {
                warn!(error = %e, "Baseline encoding unavailable, estimating tokens");
                Self::estimate()
            }
        }
    }

    /// Character-based estimate, ceil(chars / 4).
    pub fn estimate() -> Self {
        Self {
            encoding: Encoding::Estimate,
            encoding_name: "chars/4".to_string(),
        }
    }

    /// Name of the encoding in use.
    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    pub fn count(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        match &self.encoding {
            Encoding::Bpe(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            Encoding::Estimate => (text.chars().count() as u64).div_ceil(4),
        }
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &self.encoding_name)
            .finish()
    }
}

/// Token usage for one completed turn. `total_tokens` is always
/// `input_tokens + output_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTokenUsage")]
pub struct TokenUsage {
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }
}

#[derive(Deserialize)]
struct RawTokenUsage {
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: Option<u64>,
}

impl TryFrom<RawTokenUsage> for TokenUsage {
    type Error = String;

    fn try_from(raw: RawTokenUsage) -> Result<Self, Self::Error> {
        let usage = TokenUsage::new(raw.input_tokens, raw.output_tokens);
        match raw.total_tokens {
            Some(total) if total != usage.total_tokens => Err(format!(
                "total_tokens {total} != {} + {}",
                raw.input_tokens, raw.output_tokens
            )),
            _ => Ok(usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(TokenCounter::for_model("gpt-4").count(""), 0);
        assert_eq!(TokenCounter::estimate().count(""), 0);
    }

    #[test]
    fn preferred_model_uses_its_encoding() {
        let counter = TokenCounter::for_model("gpt-4");
        assert_eq!(counter.encoding_name(), "gpt-4");
        assert!(counter.count("Summarize my last 3 emails") > 0);
    }

    #[test]
    fn unknown_model_falls_back_to_baseline() {
        let counter = TokenCounter::for_model("definitely-not-a-model");
        assert_eq!(counter.encoding_name(), BASELINE_ENCODING);
        let baseline = TokenCounter::for_model("gpt-4");
        let text = "The quick brown fox jumps over the lazy dog.";
        // gpt-4 is cl100k_base, so both counters agree.
        assert_eq!(counter.count(text), baseline.count(text));
    }

    #[test]
    fn counts_are_reproducible() {
        let a = TokenCounter::for_model("unknown-model");
        let b = TokenCounter::for_model("unknown-model");
        let text = "Find the spreadsheet named Q3 budget and share it with finance.";
        assert_eq!(a.count(text), b.count(text));
        assert_eq!(a.count(text), a.count(text));
    }

    #[test]
    fn estimate_rounds_up() {
        let counter = TokenCounter::estimate();
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[test]
    fn usage_total_is_sum() {
        let usage = TokenUsage::new(12, 30);
        assert_eq!(usage.total_tokens(), 42);
        let json = serde_json::to_value(usage).unwrap();
        assert_eq!(json["total_tokens"], 42);
    }

    #[test]
    fn usage_rejects_inconsistent_total() {
        let bad = r#"{"input_tokens":1,"output_tokens":2,"total_tokens":4}"#;
        assert!(serde_json::from_str::<TokenUsage>(bad).is_err());
        let good = r#"{"input_tokens":1,"output_tokens":2,"total_tokens":3}"#;
        assert_eq!(serde_json::from_str::<TokenUsage>(good).unwrap().total_tokens(), 3);
    }
}
