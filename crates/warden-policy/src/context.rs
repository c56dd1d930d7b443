//! Per-event evaluation context

use serde_json::Value;
use warden_core::{EventType, GovernanceEvent};

/// Facts a policy condition can look at
///
/// Metric fields are read from the event payload keys `metric`,
/// `metric_type`, `old_value` and `new_value` when present.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    pub event_type: EventType,
    pub actor: String,
    pub metric: Option<String>,
    pub metric_type: Option<String>,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
    pub data: Value,
}

impl EvaluationContext {
    #[must_use]
    pub fn from_event(event: &GovernanceEvent) -> Self {
        let data = &event.data;
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |key: &str| data.get(key).and_then(Value::as_f64);
        Self {
            event_type: event.event_type,
            actor: event.actor.clone(),
            metric: text("metric"),
            metric_type: text("metric_type"),
            old_value: number("old_value"),
            new_value: number("new_value"),
            data: data.clone(),
        }
    }

    /// `new - old` when both values are known
    #[must_use]
    pub fn delta(&self) -> Option<f64> {
        Some(self.new_value? - self.old_value?)
    }

    /// Look up a payload field by dotted path or JSON pointer
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&Value> {
        if path.starts_with('/') {
            return self.data.pointer(path);
        }
        path.split('.')
            .try_fold(&self.data, |node, segment| match node {
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => node.get(segment),
            })
    }

    /// Whether `wanted` (when set) names this context's metric
    #[must_use]
    pub fn is_metric(&self, wanted: Option<&str>) -> bool {
        match wanted {
            None => true,
            Some(name) => self.metric.as_deref() == Some(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_metric_fields() {
        let event = GovernanceEvent::new(
            EventType::MetricChanged,
            "agent",
            json!({"metric": "coverage", "old_value": 80, "new_value": 72.5, "meta": {"tags": ["ci"]}}),
        );
        let ctx = EvaluationContext::from_event(&event);
        assert_eq!(ctx.metric.as_deref(), Some("coverage"));
        assert_eq!(ctx.delta(), Some(-7.5));
        assert_eq!(ctx.field("meta.tags.0"), Some(&json!("ci")));
        assert_eq!(ctx.field("/meta/tags/0"), Some(&json!("ci")));
        assert!(ctx.field("meta.missing").is_none());
        assert!(ctx.is_metric(None) && ctx.is_metric(Some("coverage")));
        assert!(!ctx.is_metric(Some("latency")));
    }
}
