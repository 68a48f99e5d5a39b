//! Context budget configuration parsing.

use anyhow::{Context, Result};

/// Default hard cap on combined history + file characters.
pub const MAX_CONTEXT_CHARS: usize = 400_000;
/// Rough conversion used when a budget is expressed in tokens.
pub const CHARS_PER_TOKEN: usize = 4;
/// Share of an over-budget bundle reserved for conversation history.
pub const HISTORY_SHARE_PERCENT: usize = 40;

/// A context budget as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextLimit {
    /// Absolute character count
    Chars(usize),
    /// Token count, converted at `CHARS_PER_TOKEN`
    Tokens(usize),
}

impl ContextLimit {
    pub fn as_chars(&self) -> usize {
        match self {
            ContextLimit::Chars(chars) => *chars,
            ContextLimit::Tokens(tokens) => tokens.saturating_mul(CHARS_PER_TOKEN),
        }
    }
}

impl Default for ContextLimit {
    fn default() -> Self {
        ContextLimit::Chars(MAX_CONTEXT_CHARS)
    }
}

impl std::fmt::Display for ContextLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextLimit::Chars(chars) => write!(f, "{}", chars),
            ContextLimit::Tokens(tokens) => write!(f, "{} tokens", tokens),
        }
    }
}

/// Parse a context budget string.
///
/// Accepts:
/// - Character format: "400000"
/// - Token format: "100000t", "100k tokens", "100K"
pub fn parse_context_limit(s: &str) -> Result<ContextLimit> {
    let s = s.trim();

    if s.is_empty() {
        anyhow::bail!("Context limit cannot be empty");
    }

    let lower = s.to_ascii_lowercase();
    let token_body = lower
        .strip_suffix("tokens")
        .or_else(|| lower.strip_suffix("token"))
        .or_else(|| lower.strip_suffix('t'));

    let limit = match token_body {
        Some(body) => ContextLimit::Tokens(
            parse_count(body.trim())
                .with_context(|| format!("Invalid token context limit: {}", s))?,
        ),
        None if lower.ends_with('k') => ContextLimit::Tokens(
            parse_count(&lower).with_context(|| format!("Invalid token context limit: {}", s))?,
        ),
        None => ContextLimit::Chars(
            lower
                .parse()
                .with_context(|| format!("Invalid absolute context limit: {}", s))?,
        ),
    };

    if limit.as_chars() == 0 {
        anyhow::bail!("Context limit cannot be zero");
    }
    Ok(limit)
}

fn parse_count(s: &str) -> Result<usize> {
    match s.strip_suffix('k') {
        Some(thousands) => {
            let n: usize = thousands.trim().parse()?;
            Ok(n.saturating_mul(1000))
        }
        None => Ok(s.parse()?),
    }
}

/// Character allocation for one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_chars: usize,
}

impl ContextBudget {
    pub fn new(limit: ContextLimit) -> Self {
        Self {
            max_chars: limit.as_chars(),
        }
    }

    pub fn history_chars(&self) -> usize {
        self.max_chars * HISTORY_SHARE_PERCENT / 100
    }

    /// Files get their 60% plus whatever history left unused.
    pub fn files_chars(&self, history_used: usize) -> usize {
        self.max_chars.saturating_sub(history_used)
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(ContextLimit::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chars() {
        assert_eq!(
            parse_context_limit("400000").unwrap(),
            ContextLimit::Chars(400_000)
        );
        assert_eq!(parse_context_limit(" 5000 ").unwrap(), ContextLimit::Chars(5000));
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(
            parse_context_limit("100000t").unwrap(),
            ContextLimit::Tokens(100_000)
        );
        assert_eq!(
            parse_context_limit("100k tokens").unwrap(),
            ContextLimit::Tokens(100_000)
        );
        assert_eq!(parse_context_limit("100K").unwrap(), ContextLimit::Tokens(100_000));
        assert_eq!(parse_context_limit("1 token").unwrap(), ContextLimit::Tokens(1));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_context_limit("").is_err());
        assert!(parse_context_limit("lots").is_err());
        assert!(parse_context_limit("0").is_err());
        assert!(parse_context_limit("0t").is_err());
        assert!(parse_context_limit("-5").is_err());
    }

    #[test]
    fn test_tokens_convert_to_chars() {
        assert_eq!(ContextLimit::Tokens(100_000).as_chars(), MAX_CONTEXT_CHARS);
        assert_eq!(ContextLimit::default().as_chars(), MAX_CONTEXT_CHARS);
    }

    #[test]
    fn test_budget_split() {
        let budget = ContextBudget::new(ContextLimit::Chars(1000));
        assert_eq!(budget.history_chars(), 400);
        assert_eq!(budget.files_chars(400), 600);
        assert_eq!(budget.files_chars(100), 900);
    }
}
