//! Flow records: the configured watch-and-notify automation units.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::embed::EmbedConfig;

/// What causes a flow to attempt delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fire on a fixed per-flow interval.
    Timer,
    /// Fire when the monitored field's value changes.
    OnChange,
    /// Fire only when an inbound event is delivered; skipped by the poller.
    OnIncoming,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::OnChange => write!(f, "on_change"),
            Self::OnIncoming => write!(f, "on_incoming"),
        }
    }
}

/// One request header for the polled source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

fn default_interval() -> u64 {
    5
}

/// A named automation unit: trigger configuration, rendering configuration,
/// delivery target, and mutable runtime state.
///
/// `last_value` always holds the canonical string form of the monitored
/// field so heterogeneous types compare consistently across ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Unique key.
    pub name: String,

    pub trigger_type: TriggerType,

    #[serde(default)]
    pub active: bool,

    /// Polled source descriptor. Optional for timer flows that only render
    /// static templates.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub headers: Vec<Header>,

    /// When set, the source is fetched with POST instead of GET.
    #[serde(default)]
    pub request_body: Option<String>,

    /// Dot/bracket path into the polled response.
    #[serde(default)]
    pub field: Option<String>,

    /// Timer cadence in minutes.
    #[serde(default = "default_interval")]
    pub interval: u64,

    #[serde(default)]
    pub message_template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedConfig>,

    #[serde(default)]
    pub condition_enabled: bool,

    #[serde(default)]
    pub condition: String,

    /// Flow-specific webhook; falls back to the global default.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub webhook_name: Option<String>,

    #[serde(default)]
    pub webhook_avatar: Option<String>,

    #[serde(default)]
    pub category: Option<String>,

    // Runtime state, mutated only by the scheduler after a dispatch attempt
    // resolves (or by state resets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data: Option<Value>,
}

impl Flow {
    /// A minimal flow with the given name and trigger, inactive and with
    /// empty runtime state.
    pub fn new(name: impl Into<String>, trigger_type: TriggerType) -> Self {
        Self {
            name: name.into(),
            trigger_type,
            active: false,
            endpoint: None,
            headers: Vec::new(),
            request_body: None,
            field: None,
            interval: default_interval(),
            message_template: String::new(),
            embed: None,
            condition_enabled: false,
            condition: String::new(),
            webhook_url: None,
            webhook_name: None,
            webhook_avatar: None,
            category: None,
            last_run: None,
            last_value: None,
            last_data: None,
        }
    }

    /// Clear runtime state so the flow starts over from `Idle`.
    pub fn reset_state(&mut self) {
        self.last_run = None;
        self.last_value = None;
        self.last_data = None;
    }

    /// A fresh inactive copy with no trigger history.
    pub fn duplicate(&self, new_name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.name = new_name.into();
        copy.active = false;
        copy.reset_state();
        copy
    }

    /// Whether `other` changes this flow's trigger configuration in a way
    /// that invalidates the stored baseline.
    pub fn trigger_config_changed(&self, other: &Flow) -> bool {
        self.trigger_type != other.trigger_type
            || self.endpoint != other.endpoint
            || self.field != other.field
    }

    /// The stored payload as a rendering context. A string-form `last_data`
    /// (older stores serialized it) is parsed leniently; anything
    /// unusable yields an empty context.
    pub fn last_data_value(&self) -> Value {
        match &self.last_data {
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
            }
            Some(value) => value.clone(),
            None => Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_clears_state() {
        let mut flow = Flow::new("orders", TriggerType::OnChange);
        flow.active = true;
        flow.last_run = Some(1_700_000_000);
        flow.last_value = Some("A".to_string());
        flow.last_data = Some(json!({"x": 1}));

        let copy = flow.duplicate("orders_copy");
        assert_eq!(copy.name, "orders_copy");
        assert!(!copy.active);
        assert!(copy.last_run.is_none());
        assert!(copy.last_value.is_none());
        assert!(copy.last_data.is_none());
        // The original keeps its history.
        assert_eq!(flow.last_value.as_deref(), Some("A"));
    }

    #[test]
    fn test_trigger_config_change_detection() {
        let base = Flow::new("f", TriggerType::OnChange);

        let mut edited = base.clone();
        edited.field = Some("result.count".to_string());
        assert!(base.trigger_config_changed(&edited));

        let mut same = base.clone();
        same.message_template = "new text".to_string();
        assert!(!base.trigger_config_changed(&same));
    }

    #[test]
    fn test_last_data_lenient_parse() {
        let mut flow = Flow::new("f", TriggerType::OnIncoming);
        flow.last_data = Some(Value::String(r#"{"k": 1}"#.to_string()));
        assert_eq!(flow.last_data_value(), json!({"k": 1}));

        flow.last_data = Some(Value::String("not json".to_string()));
        assert_eq!(flow.last_data_value(), json!({}));

        flow.last_data = None;
        assert_eq!(flow.last_data_value(), json!({}));
    }

    #[test]
    fn test_trigger_type_serde_snake_case() {
        let flow = Flow::new("f", TriggerType::OnChange);
        let raw = serde_json::to_value(&flow).unwrap();
        assert_eq!(raw["trigger_type"], "on_change");
    }
}
