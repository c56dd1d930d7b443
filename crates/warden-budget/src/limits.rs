//! Budget limits and named profiles

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ceilings for one sub-agent; unset fields are unlimited
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub max_cost_usd: Option<f64>,
    pub max_time_ms: Option<u64>,
    pub max_calls: Option<u64>,
}

/// Ceilings for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_cost_per_run: f64,
    pub max_time_per_run_ms: u64,
    pub max_cost_per_item: f64,
    pub max_items: u64,
    /// Keyed by agent id
    pub per_agent: BTreeMap<String, AgentLimits>,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::standard()
    }
}

impl BudgetLimits {
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_cost_per_run: 1.0,
            max_time_per_run_ms: 10 * 60 * 1000,
            max_cost_per_item: 0.05,
            max_items: 100,
            per_agent: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn standard() -> Self {
        Self {
            max_cost_per_run: 10.0,
            max_time_per_run_ms: 60 * 60 * 1000,
            max_cost_per_item: 0.25,
            max_items: 1_000,
            per_agent: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn extended() -> Self {
        Self {
            max_cost_per_run: 50.0,
            max_time_per_run_ms: 4 * 60 * 60 * 1000,
            max_cost_per_item: 1.0,
            max_items: 10_000,
            per_agent: BTreeMap::new(),
        }
    }

    /// Limits for one agent, if configured
    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<&AgentLimits> {
        self.per_agent.get(agent_id)
    }

    /// Finite, non-negative ceilings
    ///
    /// # Errors
    /// Description of the first offending field
    pub fn validate(&self) -> Result<(), String> {
        let finite = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(format!("{name} must be a finite, non-negative number"))
            }
        };
        finite("max_cost_per_run", self.max_cost_per_run)?;
        finite("max_cost_per_item", self.max_cost_per_item)?;
        for (agent, limits) in &self.per_agent {
            if let Some(cost) = limits.max_cost_usd {
                finite(&format!("per_agent.{agent}.max_cost_usd"), cost)?;
            }
        }
        Ok(())
    }
}

/// `[budget]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub default_profile: String,
    pub profiles: BTreeMap<String, BudgetLimits>,
    /// Utilisation bands that raise one advisory warning each
    pub warning_thresholds: Vec<f64>,
    /// Trigger the kill switch when a run ceiling is breached
    pub kill_on_run_exceeded: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let profiles = [
            ("minimal", BudgetLimits::minimal()),
            ("standard", BudgetLimits::standard()),
            ("extended", BudgetLimits::extended()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            default_profile: "standard".to_string(),
            profiles,
            warning_thresholds: vec![0.5, 0.75, 0.9],
            kill_on_run_exceeded: false,
        }
    }
}

impl BudgetConfig {
    /// Look up a profile, falling back to the default profile name
    #[must_use]
    pub fn profile(&self, name: Option<&str>) -> Option<(&str, &BudgetLimits)> {
        let name = name.unwrap_or(&self.default_profile);
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// # Errors
    /// Description of the first inconsistency
    pub fn validate(&self) -> Result<(), String> {
        if !self.profiles.contains_key(&self.default_profile) {
            return Err(format!(
                "default_profile '{}' is not a configured profile",
                self.default_profile
            ));
        }
        for (name, limits) in &self.profiles {
            limits.validate().map_err(|e| format!("profile '{name}': {e}"))?;
        }
        if self
            .warning_thresholds
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0 || *t > 1.0)
        {
            return Err("warning_thresholds must lie in (0, 1]".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = BudgetConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.profile(None).unwrap().0, "standard");
        assert!(cfg.profile(Some("minimal")).is_some());
        assert!(cfg.profile(Some("nope")).is_none());
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = BudgetConfig::default();
        cfg.default_profile = "missing".into();
        assert!(cfg.validate().is_err());

        let mut cfg = BudgetConfig::default();
        cfg.warning_thresholds = vec![1.5];
        assert!(cfg.validate().is_err());

        let mut cfg = BudgetConfig::default();
        if let Some(p) = cfg.profiles.get_mut("standard") {
            p.max_cost_per_run = f64::NAN;
        }
        assert!(cfg.validate().is_err());
    }
}
