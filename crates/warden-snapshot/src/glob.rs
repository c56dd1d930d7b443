//! Path glob patterns
//!
//! `**` spans any number of segments, `*` stays within one segment, `?` is a
//! single non-separator character. Everything else is literal. Patterns are
//! anchored at both ends and matched against `/`-separated relative paths.

use crate::error::SnapshotError;
use regex::Regex;

/// Translate a glob to an anchored regex source
#[must_use]
pub fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
        }
    }

    out.push('$');
    out
}

/// Compile one glob
///
/// # Errors
/// [`SnapshotError::InvalidPattern`] if the translated regex is rejected
pub fn compile_glob(pattern: &str) -> Result<Regex, SnapshotError> {
    Regex::new(&glob_to_regex(pattern)).map_err(|source| SnapshotError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// A set of globs matched with "any of"
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    patterns: Vec<Regex>,
}

impl GlobSet {
    /// Compile every pattern
    ///
    /// # Errors
    /// First pattern that fails to compile
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, SnapshotError> {
        let patterns = patterns
            .iter()
            .map(|p| compile_glob(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[must_use]
    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(path))
    }
}
