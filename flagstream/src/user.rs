//! End-user representation for evaluation requests.
//!
//! Users are constructed per call and never stored by the SDK. Custom
//! attribute values are stringified eagerly so that the rule operators see a
//! uniform string view.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::errors::Error;

/// Attribute names reserved for the two built-in fields. `key` and `keyId`
/// alias `keyid` during lookup.
const BUILTIN_ALIASES: [(&str, &str); 3] = [("key", "keyid"), ("keyid", "keyid"), ("name", "name")];

/// A custom attribute value: string, number or boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl AttributeValue {
    fn into_string(self) -> String {
        match self {
            AttributeValue::String(s) => s,
            AttributeValue::Number(n) => n.to_string(),
            AttributeValue::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Number(f64::from(value))
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// An end user to evaluate flags against.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    key_id: String,
    name: String,
    custom: HashMap<String, String>,
}

impl User {
    /// Start building a user from its unique key.
    pub fn builder(key: impl Into<String>) -> UserBuilder {
        UserBuilder {
            key: key.into(),
            name: None,
            custom: HashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an attribute. Built-in names win over custom attributes and
    /// the `key`/`keyId` aliases resolve to the user key.
    pub fn get(&self, property: &str) -> Option<&str> {
        match property {
            "keyid" => return Some(&self.key_id),
            "name" => return Some(&self.name),
            _ => {}
        }
        let lowered = property.to_ascii_lowercase();
        for (alias, target) in BUILTIN_ALIASES {
            if lowered == alias {
                return match target {
                    "keyid" => Some(&self.key_id),
                    _ => Some(&self.name),
                };
            }
        }
        self.custom.get(property).map(String::as_str)
    }

    /// Wire representation used by event payloads.
    pub(crate) fn to_json(&self) -> Value {
        let custom: Vec<Value> = self
            .custom
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        json!({
            "keyId": self.key_id,
            "name": self.name,
            "customizedProperties": custom,
        })
    }
}

/// Builder for [`User`]; validation happens in [`UserBuilder::build`].
#[derive(Debug, Clone)]
pub struct UserBuilder {
    key: String,
    name: Option<String>,
    custom: HashMap<String, String>,
}

impl UserBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a custom attribute. Keys colliding with the built-ins are
    /// dropped silently, matching the service semantics.
    pub fn custom(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        let key = key.into();
        let lowered = key.to_ascii_lowercase();
        if BUILTIN_ALIASES.iter().any(|(alias, _)| *alias == lowered) {
            return self;
        }
        self.custom.insert(key, value.into().into_string());
        self
    }

    pub fn build(self) -> Result<User, Error> {
        if self.key.trim().is_empty() {
            return Err(Error::InvalidUser("key is not valid"));
        }
        let name = self.name.unwrap_or_default();
        if name.trim().is_empty() {
            return Err(Error::InvalidUser("name is not valid"));
        }
        Ok(User {
            key_id: self.key,
            name,
            custom: self.custom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_key_and_name() {
        assert!(User::builder("").name("n").build().is_err());
        assert!(User::builder("  ").name("n").build().is_err());
        assert!(User::builder("k").build().is_err());
        assert!(User::builder("k").name("   ").build().is_err());
        assert!(User::builder("k").name("n").build().is_ok());
    }

    #[test]
    fn test_builtin_aliases_resolve_to_key() {
        let user = User::builder("u-1").name("User One").build().unwrap();
        assert_eq!(user.get("keyid"), Some("u-1"));
        assert_eq!(user.get("key"), Some("u-1"));
        assert_eq!(user.get("keyId"), Some("u-1"));
        assert_eq!(user.get("KeyId"), Some("u-1"));
        assert_eq!(user.get("name"), Some("User One"));
        assert_eq!(user.get("missing"), None);
    }

    #[test]
    fn test_custom_values_are_stringified() {
        let user = User::builder("u-1")
            .name("n")
            .custom("country", "us")
            .custom("salary", 2500)
            .custom("ratio", 0.25)
            .custom("graduated", true)
            .build()
            .unwrap();
        assert_eq!(user.get("country"), Some("us"));
        assert_eq!(user.get("salary"), Some("2500"));
        assert_eq!(user.get("ratio"), Some("0.25"));
        assert_eq!(user.get("graduated"), Some("true"));
    }

    #[test]
    fn test_custom_keys_colliding_with_builtins_are_dropped() {
        let user = User::builder("u-1")
            .name("n")
            .custom("Key", "other")
            .custom("NAME", "other")
            .custom("keyid", "other")
            .build()
            .unwrap();
        assert_eq!(user.get("key"), Some("u-1"));
        assert_eq!(user.get("name"), Some("n"));
    }

    #[test]
    fn test_wire_shape() {
        let user = User::builder("u-1")
            .name("n")
            .custom("country", "us")
            .build()
            .unwrap();
        let wire = user.to_json();
        assert_eq!(wire["keyId"], "u-1");
        assert_eq!(wire["name"], "n");
        assert_eq!(wire["customizedProperties"][0]["name"], "country");
        assert_eq!(wire["customizedProperties"][0]["value"], "us");
    }
}
