//! Glob patterns over namespace-relative keys.
//!
//! `*` matches any run of characters other than the `:` delimiter and `?`
//! matches exactly one such character, so `user:*` never reaches into a
//! nested `user:1:posts` key and never crosses into another definition.

use regex::Regex;

use crate::config::KEY_DELIMITER;
use crate::error::{CacheError, Result};

const RESERVED: &[char] = &['[', ']', '{', '}'];

// == Key Pattern ==
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compiles a glob, rejecting malformed input up front.
    pub fn new(glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(CacheError::InvalidPattern("pattern is empty".to_string()));
        }
        if let Some(c) = glob
            .chars()
            .find(|c| RESERVED.contains(c) || c.is_whitespace() || c.is_control())
        {
            return Err(CacheError::InvalidPattern(format!(
                "unsupported character {:?} in '{}'",
                c, glob
            )));
        }

        let any_char = format!("[^{}]", regex::escape(&KEY_DELIMITER.to_string()));
        let mut expr = String::with_capacity(glob.len() * 2 + 2);
        expr.push('^');
        for c in glob.chars() {
            match c {
                '*' => {
                    expr.push_str(&any_char);
                    expr.push('*');
                }
                '?' => expr.push_str(&any_char),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| CacheError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, relative_key: &str) -> bool {
        self.regex.is_match(relative_key)
    }

    /// The literal text before the first wildcard, used to narrow store scans.
    pub fn literal_prefix(&self) -> &str {
        let end = self
            .source
            .find(|c: char| c == '*' || c == '?')
            .unwrap_or(self.source.len());
        &self.source[..end]
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}
