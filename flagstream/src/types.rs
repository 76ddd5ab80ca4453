//! Model types for flags, segments, stored entities and evaluation results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Value type of a feature flag, as declared by the flag-control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    #[default]
    String,
    Boolean,
    Number,
    Json,
}

/// A single variation of a flag: an id and its stored string value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Variation {
    pub id: String,
    pub value: String,
}

/// Individually targeted users for one variation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetUsers {
    pub variation_id: String,
    pub key_ids: Vec<String>,
}

/// One condition of a rule. `op` may be empty for legacy segment conditions,
/// in which case `property` carries the operator name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub property: String,
    pub op: Option<String>,
    pub value: Option<String>,
}

/// A rollout interval `[lo, hi)` over `[0, 1]` owned by one variation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolloutVariation {
    pub id: String,
    pub rollout: [f64; 2],
    pub expt_rollout: f64,
}

/// Percentage-rollout dispatch shared by rules and the fallthrough.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolloutDispatch {
    pub dispatch_key: Option<String>,
    pub included_in_expt: bool,
    pub variations: Vec<RolloutVariation>,
}

/// A flag rule: AND-combined conditions plus the rollout applied on match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlagRule {
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub dispatch: RolloutDispatch,
}

/// A segment rule carries conditions only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchRule {
    pub conditions: Vec<Condition>,
}

/// A feature flag definition as replicated from the flag-control service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlag {
    /// Server-side identifier; `key` is the client-side id.
    pub id: String,
    pub key: String,
    pub name: String,
    pub variation_type: FlagType,
    pub is_enabled: bool,
    pub variations: Vec<Variation>,
    pub disabled_variation_id: String,
    pub target_users: Vec<TargetUsers>,
    pub rules: Vec<FlagRule>,
    pub fallthrough: RolloutDispatch,
    pub expt_include_all_targets: bool,
    /// Variation-id to stored value, synthesized from `variations`.
    #[serde(skip)]
    pub variation_map: HashMap<String, String>,
}

impl FeatureFlag {
    /// Rebuild the id-to-value map after deserialization.
    pub fn build_variation_map(&mut self) {
        self.variation_map = self
            .variations
            .iter()
            .map(|v| (v.id.clone(), v.value.clone()))
            .collect();
    }

    /// Stored string value of a variation id, if known.
    pub fn variation_value(&self, id: &str) -> Option<&str> {
        self.variation_map.get(id).map(String::as_str)
    }
}

/// A segment definition: explicit include/exclude lists plus rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Segment {
    pub included: HashSet<String>,
    pub excluded: HashSet<String>,
    pub rules: Vec<MatchRule>,
}

/// Payload of a stored entity.
#[derive(Debug, Clone)]
pub enum EntityBody {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
    /// Opaque record used by the internal test category.
    Raw(Arc<Value>),
    /// Archived entities are compacted to an empty body.
    Empty,
}

/// A record owned by the data store. `timestamp` is the entity version in
/// epoch milliseconds; archived entities stay invisible to readers but keep
/// their timestamp for version gating.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub timestamp: i64,
    pub is_archived: bool,
    pub body: EntityBody,
}

impl Entity {
    pub fn flag(id: impl Into<String>, timestamp: i64, flag: FeatureFlag) -> Self {
        Self {
            id: id.into(),
            timestamp,
            is_archived: false,
            body: EntityBody::Flag(Arc::new(flag)),
        }
    }

    pub fn segment(id: impl Into<String>, timestamp: i64, segment: Segment) -> Self {
        Self {
            id: id.into(),
            timestamp,
            is_archived: false,
            body: EntityBody::Segment(Arc::new(segment)),
        }
    }

    pub fn raw(id: impl Into<String>, timestamp: i64, value: Value) -> Self {
        Self {
            id: id.into(),
            timestamp,
            is_archived: false,
            body: EntityBody::Raw(Arc::new(value)),
        }
    }

    /// An archival tombstone: invisible to readers, versioned for gating.
    pub fn archived(id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            timestamp,
            is_archived: true,
            body: EntityBody::Empty,
        }
    }

    pub fn as_flag(&self) -> Option<Arc<FeatureFlag>> {
        match &self.body {
            EntityBody::Flag(flag) => Some(flag.clone()),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<Arc<Segment>> {
        match &self.body {
            EntityBody::Segment(segment) => Some(segment.clone()),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<Arc<Value>> {
        match &self.body {
            EntityBody::Raw(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Result of a flag evaluation converted to its declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(Value),
}

impl FlagValue {
    /// The flag type this value would satisfy; `None` for `Null`.
    pub fn flag_type(&self) -> Option<FlagType> {
        match self {
            FlagValue::Null => None,
            FlagValue::Bool(_) => Some(FlagType::Boolean),
            FlagValue::Number(_) => Some(FlagType::Number),
            FlagValue::String(_) => Some(FlagType::String),
            FlagValue::Json(_) => Some(FlagType::Json),
        }
    }

    /// Render the value in the stored-string form used by the service.
    pub fn to_stored_string(&self) -> Option<String> {
        match self {
            FlagValue::Null => None,
            FlagValue::Bool(b) => Some(b.to_string()),
            FlagValue::Number(n) => Some(n.to_string()),
            FlagValue::String(s) => Some(s.clone()),
            FlagValue::Json(v) => Some(v.to_string()),
        }
    }

    /// JSON rendering; whole numbers serialize as integers.
    pub fn to_json(&self) -> Value {
        match self {
            FlagValue::Null => Value::Null,
            FlagValue::Bool(b) => json!(b),
            FlagValue::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    json!(*n as i64)
                } else {
                    json!(n)
                }
            }
            FlagValue::String(s) => json!(s),
            FlagValue::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FlagValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            FlagValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        FlagValue::Number(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Number(value as f64)
    }
}

impl From<i32> for FlagValue {
    fn from(value: i32) -> Self {
        FlagValue::Number(f64::from(value))
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::String(value)
    }
}

impl From<Value> for FlagValue {
    fn from(value: Value) -> Self {
        FlagValue::Json(value)
    }
}

/// Convert a stored string value to the flag's declared type. Falls back to
/// the raw string when the stored value does not parse.
pub(crate) fn cast_variation(flag_type: FlagType, value: Option<&str>) -> FlagValue {
    let Some(raw) = value else {
        return FlagValue::Null;
    };
    match flag_type {
        FlagType::Boolean => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Bool(b)) => FlagValue::Bool(b),
            _ => FlagValue::String(raw.to_string()),
        },
        FlagType::Json => match serde_json::from_str::<Value>(raw) {
            Ok(v) => FlagValue::Json(v),
            Err(_) => FlagValue::String(raw.to_string()),
        },
        FlagType::Number => match raw.parse::<f64>() {
            Ok(n) => FlagValue::Number(n),
            Err(_) => FlagValue::String(raw.to_string()),
        },
        FlagType::String => FlagValue::String(raw.to_string()),
    }
}

/// How an evaluation result was calculated, in the flag's declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalDetail {
    /// Main factor that decided the flag value.
    pub reason: String,
    /// The evaluated value, or the default value on error.
    pub variation: FlagValue,
    /// Flag key, or a placeholder when the key was unknown.
    pub key_name: String,
    /// Flag display name.
    pub name: String,
}

impl EvalDetail {
    pub fn to_json(&self) -> Value {
        json!({
            "reason": self.reason,
            "variation": self.variation.to_json(),
            "keyName": self.key_name,
            "name": self.name,
        })
    }
}

/// Evaluation outcome of a single flag: success marker plus the detail.
#[derive(Debug, Clone)]
pub struct FlagState {
    pub success: bool,
    /// `"OK"` on success, otherwise the failure reason.
    pub message: String,
    pub data: EvalDetail,
}

impl FlagState {
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "message": self.message,
            "data": self.data.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_variation_boolean() {
        assert_eq!(
            cast_variation(FlagType::Boolean, Some("true")),
            FlagValue::Bool(true)
        );
        assert_eq!(
            cast_variation(FlagType::Boolean, Some("false")),
            FlagValue::Bool(false)
        );
        // Unparseable stored value falls back to the raw string.
        assert_eq!(
            cast_variation(FlagType::Boolean, Some("yes")),
            FlagValue::String("yes".to_string())
        );
    }

    #[test]
    fn test_cast_variation_number() {
        assert_eq!(
            cast_variation(FlagType::Number, Some("33")),
            FlagValue::Number(33.0)
        );
        assert_eq!(
            cast_variation(FlagType::Number, Some("2.5")),
            FlagValue::Number(2.5)
        );
        assert_eq!(
            cast_variation(FlagType::Number, Some("abc")),
            FlagValue::String("abc".to_string())
        );
    }

    #[test]
    fn test_cast_variation_json() {
        let value = cast_variation(FlagType::Json, Some(r#"{"a": 1}"#));
        assert_eq!(value.as_json().unwrap()["a"], 1);
    }

    #[test]
    fn test_cast_variation_null() {
        assert!(cast_variation(FlagType::String, None).is_null());
    }

    #[test]
    fn test_whole_numbers_serialize_as_integers() {
        assert_eq!(FlagValue::Number(33.0).to_json(), json!(33));
        assert_eq!(FlagValue::Number(2.5).to_json(), json!(2.5));
    }

    #[test]
    fn test_flag_deserializes_from_wire_shape() {
        let raw = json!({
            "id": "server-id-1",
            "key": "ff-test-bool",
            "name": "test bool flag",
            "variationType": "boolean",
            "isEnabled": true,
            "variations": [
                {"id": "v1", "value": "true"},
                {"id": "v2", "value": "false"}
            ],
            "disabledVariationId": "v2",
            "targetUsers": [{"keyIds": ["u-1"], "variationId": "v1"}],
            "rules": [{
                "conditions": [{"property": "country", "op": "Equal", "value": "us"}],
                "dispatchKey": "keyid",
                "includedInExpt": false,
                "variations": [{"id": "v1", "rollout": [0.0, 1.0], "exptRollout": 1.0}]
            }],
            "fallthrough": {
                "dispatchKey": "keyid",
                "includedInExpt": false,
                "variations": [{"id": "v2", "rollout": [0.0, 1.0], "exptRollout": 1.0}]
            },
            "exptIncludeAllTargets": false,
            "isArchived": false,
            "updatedAt": "2024-01-01T00:00:00Z"
        });
        let mut flag: FeatureFlag = serde_json::from_value(raw).unwrap();
        flag.build_variation_map();
        assert_eq!(flag.key, "ff-test-bool");
        assert_eq!(flag.variation_type, FlagType::Boolean);
        assert_eq!(flag.variation_value("v1"), Some("true"));
        assert_eq!(flag.rules.len(), 1);
        assert_eq!(flag.rules[0].dispatch.variations[0].rollout, [0.0, 1.0]);
        assert_eq!(flag.fallthrough.variations[0].id, "v2");
    }

    #[test]
    fn test_segment_deserializes_from_wire_shape() {
        let raw = json!({
            "id": "seg-1",
            "included": ["u-1"],
            "excluded": ["u-2"],
            "rules": [{"conditions": [{"property": "country", "op": "Equal", "value": "jp"}]}],
            "isArchived": false,
            "updatedAt": "2024-01-01T00:00:00Z"
        });
        let segment: Segment = serde_json::from_value(raw).unwrap();
        assert!(segment.included.contains("u-1"));
        assert!(segment.excluded.contains("u-2"));
        assert_eq!(segment.rules.len(), 1);
    }

    #[test]
    fn test_archived_entity_keeps_timestamp() {
        let entity = Entity::archived("ff-1", 42);
        assert!(entity.is_archived);
        assert_eq!(entity.timestamp, 42);
        assert!(entity.as_flag().is_none());
    }
}
