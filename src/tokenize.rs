//! Deterministic tokenization with source offsets.
//!
//! Tokens are maximal runs of non-whitespace characters. The splitter is
//! intentionally simple: span and frame indices refer to these tokens, and
//! veto proofs must be reproducible, so the tokenizer has no configuration
//! and no model dependency. Byte offsets into the original text are kept
//! so callers can map token spans back to source text.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").expect("invalid token regex"));

/// One token with its byte range in the source text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split text into whitespace-delimited tokens with byte offsets.
///
/// Empty or all-whitespace input yields an empty list, never an error.
pub fn tokenize(text: &str) -> Vec<Token> {
    TOKEN
        .find_iter(text)
        .map(|m| Token {
            text: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
        })
        .collect()
}

/// Join the covered source text for a token span `[start, end)`.
pub fn span_text(text: &str, tokens: &[Token], start: usize, end: usize) -> String {
    if start >= end || end > tokens.len() {
        return String::new();
    }
    text[tokens[start].start..tokens[end - 1].end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace_with_offsets() {
        let toks = tokenize("I will  help you");
        assert_eq!(toks.len(), 4);
        assert_eq!(toks[2].text, "help");
        assert_eq!(&"I will  help you"[toks[2].start..toks[2].end], "help");
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \n\t ").is_empty());
    }

    #[test]
    fn span_text_recovers_source_slice() {
        let text = "I will harm you badly";
        let toks = tokenize(text);
        assert_eq!(span_text(text, &toks, 2, 5), "harm you badly");
        assert_eq!(span_text(text, &toks, 3, 3), "");
    }
}
