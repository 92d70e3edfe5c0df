//! Layered VM configuration.
//!
//! Configuration is a tree of named options: each leaf is either a literal
//! scalar, a nested map, or a deferred value computed on first access
//! within an execution. Declaration order is preserved so deferred leaves
//! can read fields resolved before them.

pub mod resolver;
pub mod schema;

use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use resolver::ResolveCtx;

/// A literal configuration leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Scalar {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

/// Deferred leaf: evaluated in the execution context during resolution,
/// at most once per execution.
pub type DeferredFn = Rc<dyn Fn(&ResolveCtx<'_>) -> Result<Scalar>>;

/// One configuration value.
#[derive(Clone)]
pub enum ConfigValue {
    Scalar(Scalar),
    Map(ConfigMap),
    Deferred(DeferredFn),
}

impl ConfigValue {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            ConfigValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ConfigMap> {
        match self {
            ConfigValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn deferred(f: impl Fn(&ResolveCtx<'_>) -> Result<Scalar> + 'static) -> Self {
        ConfigValue::Deferred(Rc::new(f))
    }
}

impl std::fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Scalar(s) => write!(f, "{s:?}"),
            ConfigValue::Map(m) => write!(f, "{m:?}"),
            ConfigValue::Deferred(_) => write!(f, "<deferred>"),
        }
    }
}

impl From<Scalar> for ConfigValue {
    fn from(v: Scalar) -> Self {
        ConfigValue::Scalar(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Scalar(v.into())
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Scalar(v.into())
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Scalar(v.into())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Scalar(v.into())
    }
}

impl From<ConfigMap> for ConfigValue {
    fn from(m: ConfigMap) -> Self {
        ConfigValue::Map(m)
    }
}

/// Ordered mapping of option names to values.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    entries: IndexMap<String, ConfigValue>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.entries.shift_remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Recursively merge `overrides` into this map. Nested maps merge
    /// field-by-field; on leaf conflicts the override wins. Keys new in
    /// the override are appended after the base keys.
    pub fn merged_with(&self, overrides: &ConfigMap) -> ConfigMap {
        let mut out = self.clone();
        for (key, value) in overrides.iter() {
            match (out.entries.get_mut(key), value) {
                (Some(ConfigValue::Map(base)), ConfigValue::Map(over)) => {
                    *base = base.merged_with(over);
                }
                _ => out.set(key, value.clone()),
            }
        }
        out
    }

    /// Structural conversion to a plain JSON mapping. Fails if any
    /// deferred value is still present, so only resolved snapshots
    /// convert.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (key, value) in self.iter() {
            let json = match value {
                ConfigValue::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(*b),
                ConfigValue::Scalar(Scalar::Int(i)) => serde_json::Value::from(*i),
                ConfigValue::Scalar(Scalar::Str(s)) => serde_json::Value::from(s.as_str()),
                ConfigValue::Map(m) => m.to_json()?,
                ConfigValue::Deferred(_) => {
                    return Err(Error::Configuration(format!(
                        "option {key} is unresolved"
                    )))
                }
            };
            map.insert(key.to_string(), json);
        }
        Ok(serde_json::Value::Object(map))
    }
}

impl IntoIterator for ConfigMap {
    type Item = (String, ConfigValue);
    type IntoIter = indexmap::map::IntoIter<String, ConfigValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_override_wins_on_leaves() {
        let base = ConfigMap::new().with("memory", 1024i64).with("cpus", 1i64);
        let over = ConfigMap::new().with("memory", 512i64);
        let merged = base.merged_with(&over);
        assert_eq!(merged.get("memory").unwrap().as_scalar().unwrap().as_int(), Some(512));
        assert_eq!(merged.get("cpus").unwrap().as_scalar().unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_merge_recurses_into_nested_maps() {
        let base = ConfigMap::new()
            .with("node", ConfigMap::new().with("user", "root").with("group", "vms"));
        let over = ConfigMap::new().with("node", ConfigMap::new().with("user", "admin"));
        let merged = base.merged_with(&over);
        let node = merged.get("node").unwrap().as_map().unwrap();
        assert_eq!(node.get("user").unwrap().as_scalar().unwrap().as_str(), Some("admin"));
        assert_eq!(node.get("group").unwrap().as_scalar().unwrap().as_str(), Some("vms"));
    }

    #[test]
    fn test_to_json_walks_structure() {
        let map = ConfigMap::new()
            .with("name", "web1")
            .with("autostart", true)
            .with("node", ConfigMap::new().with("user", "admin"));
        let json = map.to_json().unwrap();
        assert_eq!(json["name"], "web1");
        assert_eq!(json["autostart"], true);
        assert_eq!(json["node"]["user"], "admin");
    }

    #[test]
    fn test_to_json_rejects_unresolved_deferred() {
        let map = ConfigMap::new()
            .with("name", ConfigValue::deferred(|_| Ok(Scalar::from("late"))));
        assert!(map.to_json().is_err());
    }
}
