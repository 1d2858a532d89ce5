// ── Sysinfo normalization ──
//
// Firmware generations disagree on field names for the same facts.
// A `RuleSet` rewrites them before records reach the sink. Rules are
// data: adding a generation means adding a rule, not touching the
// poller.

use serde_json::Value;
use tracing::trace;

use crate::device::SysInfo;

/// Pre-forward rewrite of a sysinfo document.
pub trait SysinfoTransform: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, sysinfo: SysInfo) -> SysInfo;
}

/// A single field rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// Move `from` to `to` unless `to` is already present.
    Rename { from: String, to: String },
    /// Coerce `from` (bool, number or "on"/"off") into boolean `to`.
    /// Leaves an existing `to` untouched.
    PowerState { from: String, to: String },
}

impl FieldRule {
    pub fn rename(from: &str, to: &str) -> Self {
        Self::Rename {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }

    pub fn power_state(from: &str, to: &str) -> Self {
        Self::PowerState {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }

    fn apply(&self, doc: &mut SysInfo) {
        match self {
            Self::Rename { from, to } => {
                if doc.contains_key(to) {
                    return;
                }
                if let Some(value) = doc.remove(from) {
                    trace!(from = %from, to = %to, "renamed sysinfo field");
                    doc.insert(to.clone(), value);
                }
            }
            Self::PowerState { from, to } => {
                if doc.contains_key(to) {
                    return;
                }
                if let Some(on) = doc.get(from).and_then(power_flag) {
                    doc.insert(to.clone(), Value::Bool(on));
                }
            }
        }
    }
}

fn power_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Named, versioned list of field rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    name: String,
    rules: Vec<FieldRule>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, rules: Vec<FieldRule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Unify the firmware version field.
    pub fn v1() -> Self {
        Self::new("v1", vec![FieldRule::rename("fw_ver", "sw_ver")])
    }

    /// `v1` plus a unified `power_on` flag.
    pub fn v2() -> Self {
        Self::new(
            "v2",
            vec![
                FieldRule::rename("fw_ver", "sw_ver"),
                FieldRule::power_state("device_on", "power_on"),
                FieldRule::power_state("relay_state", "power_on"),
            ],
        )
    }

    /// Look up a built-in rule set by name. `none` yields an empty set.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::new("none", Vec::new())),
            "v1" => Some(Self::v1()),
            "v2" => Some(Self::v2()),
            _ => None,
        }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }
}

impl SysinfoTransform for RuleSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut sysinfo: SysInfo) -> SysInfo {
        for rule in &self.rules {
            rule.apply(&mut sysinfo);
        }
        sysinfo
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> SysInfo {
        match value {
            Value::Object(map) => map,
            _ => SysInfo::new(),
        }
    }

    #[test]
    fn v1_renames_firmware_field() {
        let out = RuleSet::v1().apply(doc(json!({"fw_ver": "1.2.3", "model": "HS110"})));
        assert_eq!(Value::Object(out), json!({"sw_ver": "1.2.3", "model": "HS110"}));
    }

    #[test]
    fn rename_keeps_existing_target() {
        let out = RuleSet::v1().apply(doc(json!({"fw_ver": "old", "sw_ver": "new"})));
        assert_eq!(out["sw_ver"], json!("new"));
        assert_eq!(out["fw_ver"], json!("old"));
    }

    #[test]
    fn v2_unifies_power_state() {
        let relay = RuleSet::v2().apply(doc(json!({"relay_state": 1})));
        assert_eq!(relay["power_on"], json!(true));
        assert_eq!(relay["relay_state"], json!(1));

        let smart = RuleSet::v2().apply(doc(json!({"device_on": false})));
        assert_eq!(smart["power_on"], json!(false));

        let text = RuleSet::new("t", vec![FieldRule::power_state("state", "power_on")])
            .apply(doc(json!({"state": "ON"})));
        assert_eq!(text["power_on"], json!(true));
    }

    #[test]
    fn unparseable_power_state_is_ignored() {
        let out = RuleSet::v2().apply(doc(json!({"relay_state": "maybe"})));
        assert!(!out.contains_key("power_on"));
    }

    #[test]
    fn rule_sets_resolve_by_name() {
        assert_eq!(RuleSet::by_name("V2").unwrap().name(), "v2");
        assert!(RuleSet::by_name("none").unwrap().rules().is_empty());
        assert!(RuleSet::by_name("v9").is_none());
    }
}
