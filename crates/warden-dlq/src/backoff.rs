//! Exponential backoff with bounded jitter

use rand::Rng;
use serde::{Deserialize, Serialize};

/// `[dlq]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Retries granted to TRANSIENT failures
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Fraction of the base delay added or removed at random
    pub jitter_pct: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 300_000,
            jitter_pct: 0.1,
        }
    }
}

impl DlqConfig {
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: self.initial_backoff_ms,
            multiplier: self.backoff_multiplier,
            max_ms: self.max_backoff_ms,
            jitter_pct: self.jitter_pct,
        }
    }

    /// # Errors
    /// Description of the first inconsistency
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_pct) {
            return Err("jitter_pct must lie in [0, 1]".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial_backoff_ms must not exceed max_backoff_ms".to_string());
        }
        Ok(())
    }
}

/// `min(initial * multiplier^n, max)` with `±jitter_pct` spread
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl BackoffPolicy {
    /// Delay before retry number `retry_count` without jitter
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let raw = self.initial_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_ms as f64 {
            self.max_ms
        } else {
            raw as u64
        }
    }

    /// Jittered delay drawn from `rng`, clamped to `[0, max_ms]`
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn jittered_delay_ms<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> u64 {
        let base = self.base_delay_ms(retry_count) as f64;
        let spread = self.jitter_pct.clamp(0.0, 1.0);
        let factor = if spread > 0.0 {
            1.0 + rng.random_range(-spread..=spread)
        } else {
            1.0
        };
        (base * factor).clamp(0.0, self.max_ms as f64) as u64
    }

    /// Jittered delay from the thread-local generator
    #[must_use]
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        self.jittered_delay_ms(retry_count, &mut rand::rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        DlqConfig::default().backoff()
    }

    #[test]
    fn base_delay_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.base_delay_ms(0), 1_000);
        assert_eq!(p.base_delay_ms(1), 2_000);
        assert_eq!(p.base_delay_ms(3), 8_000);
        assert_eq!(p.base_delay_ms(20), 300_000);
        assert_eq!(p.base_delay_ms(u32::MAX), 300_000);
    }

    #[test]
    fn zero_jitter_is_exact() {
        let p = BackoffPolicy {
            jitter_pct: 0.0,
            ..policy()
        };
        assert_eq!(p.delay_ms(2), 4_000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = DlqConfig::default();
        cfg.backoff_multiplier = 0.5;
        assert!(cfg.validate().is_err());
        let mut cfg = DlqConfig::default();
        cfg.jitter_pct = 1.5;
        assert!(cfg.validate().is_err());
        assert!(DlqConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn base_delay_never_decreases(n in 0u32..40) {
            let p = policy();
            prop_assert!(p.base_delay_ms(n + 1) >= p.base_delay_ms(n));
            prop_assert!(p.base_delay_ms(n) <= p.max_ms);
        }

        #[test]
        fn jitter_stays_in_band(n in 0u32..12, jitter in 0.0f64..=1.0) {
            let p = BackoffPolicy { jitter_pct: jitter, ..policy() };
            let base = p.base_delay_ms(n) as f64;
            let d = p.delay_ms(n) as f64;
            prop_assert!(d <= p.max_ms as f64);
            prop_assert!(d >= (base * (1.0 - jitter)).floor() - 1.0);
            prop_assert!(d <= (base * (1.0 + jitter)).ceil() + 1.0);
        }
    }
}
