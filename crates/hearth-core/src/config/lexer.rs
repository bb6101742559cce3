//! Line tokenizer for configuration files

use crate::{HearthError, Result};

/// Longest statement accepted, command included.
pub const MAX_TOKENS: usize = 16;

/// Token standing for an explicitly empty argument.
pub const EMPTY_TOKEN: &str = "_";

/// One non-blank, non-comment line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line<'a> {
    /// 1-based line number
    pub number: usize,
    /// Whitespace separated tokens, `_` already turned into `""`
    pub tokens: Vec<&'a str>,
}

impl<'a> Line<'a> {
    #[must_use]
    pub fn command(&self) -> &'a str {
        self.tokens.first().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn args(&self) -> &[&'a str] {
        self.tokens.get(1..).unwrap_or_default()
    }
}

/// Split `text` into statements. `origin` only labels errors.
pub fn tokenize<'a>(origin: &str, text: &'a str) -> Result<Vec<Line<'a>>> {
    let mut lines = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = trimmed
            .split_whitespace()
            .map(|t| if t == EMPTY_TOKEN { "" } else { t })
            .collect();
        if tokens.len() > MAX_TOKENS {
            return Err(HearthError::Compile {
                origin: origin.to_string(),
                line: idx + 1,
                message: format!(
                    "too many tokens ({}), at most {MAX_TOKENS} allowed",
                    tokens.len()
                ),
            });
        }
        lines.push(Line {
            number: idx + 1,
            tokens,
        });
    }
    Ok(lines)
}
