//! Failure classification
//!
//! The rule table is data: an ordered list of `{class, patterns}` entries,
//! evaluated top to bottom, first match wins. Hosts override it through the
//! `[classification]` config section without touching code.

use crate::error::ClassifierError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure class that decides retry behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Timeout, rate limit, 5xx: retry with backoff
    Transient,
    /// Validation, auth, malformed input: never retried automatically
    Permanent,
    /// Compliance violation: never retried, always notified
    Policy,
}

impl ErrorClass {
    /// Whether automatic retries are allowed
    #[inline]
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Stable wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::Policy => "POLICY",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the classification table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Class assigned on match
    pub class: ErrorClass,
    /// Case-insensitive regexes matched against the error message
    pub patterns: Vec<String>,
}

/// Ordered rule table plus fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationTable {
    /// Rules in evaluation order
    pub rules: Vec<ClassificationRule>,
    /// Class for messages no rule matches
    pub default_class: ErrorClass,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        fn rule(class: ErrorClass, patterns: &[&str]) -> ClassificationRule {
            ClassificationRule {
                class,
                patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            }
        }

        Self {
            rules: vec![
                rule(
                    ErrorClass::Policy,
                    &[
                        r"\bpii\b",
                        r"personal(ly)? (identifiable )?(data|information)",
                        r"\blicen[cs]e\b",
                        r"copyright",
                        r"\bgdpr\b",
                        r"compliance",
                        r"policy violation",
                    ],
                ),
                rule(
                    ErrorClass::Permanent,
                    &[
                        r"unauthori[sz]ed",
                        r"forbidden",
                        r"\b(400|401|403|404|422)\b",
                        r"authentication",
                        r"invalid api key",
                        r"validation",
                        r"malformed",
                        r"invalid (input|argument|request)",
                        r"parse error",
                        r"bad request",
                        r"not found",
                    ],
                ),
                rule(
                    ErrorClass::Transient,
                    &[
                        r"time(d)? ?out",
                        r"rate[ _-]?limit",
                        r"\b429\b",
                        r"too many requests",
                        r"\b5\d\d\b",
                        r"unavailable",
                        r"connection (reset|refused|closed)",
                        r"overloaded",
                        r"temporar(y|ily)",
                    ],
                ),
            ],
            default_class: ErrorClass::Transient,
        }
    }
}

/// Compiled classification table
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<(ErrorClass, Regex)>,
    default_class: ErrorClass,
}

impl ErrorClassifier {
    /// Compile a rule table
    ///
    /// # Errors
    /// Returns [`ClassifierError::InvalidPattern`] for the first bad regex
    pub fn from_table(table: &ClassificationTable) -> Result<Self, ClassifierError> {
        let mut rules = Vec::new();
        for rule in &table.rules {
            for pattern in &rule.patterns {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ClassifierError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })?;
                rules.push((rule.class, regex));
            }
        }
        Ok(Self {
            rules,
            default_class: table.default_class,
        })
    }

    /// Classify an error message
    #[must_use]
    pub fn classify(&self, message: &str) -> ErrorClass {
        self.rules
            .iter()
            .find(|(_, regex)| regex.is_match(message))
            .map_or(self.default_class, |(class, _)| *class)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        // Built-in patterns are static and known to compile.
        Self::from_table(&ClassificationTable::default()).unwrap_or(Self {
            rules: Vec::new(),
            default_class: ErrorClass::Transient,
        })
    }
}
