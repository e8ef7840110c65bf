//! Configuration Sources
//!
//! Flat dotted-key configuration, built in code or loaded from YAML. Nested
//! YAML mappings are flattened so `registry: { redis: { db: 2 } }` answers
//! the key `registry.redis.db`.

use crate::domain::ports::ConfigSource;
use crate::error::{Error, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// In-memory configuration source
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: BTreeMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)?;
        let mut config = Self::new();
        match root {
            Value::Null => {}
            Value::Mapping(_) => flatten("", &root, &mut config.values)?,
            _ => {
                return Err(Error::Configuration(
                    "configuration root must be a mapping".to_string(),
                ))
            }
        }
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) -> Result<()> {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let segment = scalar_to_string(k).ok_or_else(|| {
                    Error::Configuration(format!("non-scalar key under '{}'", prefix))
                })?;
                let key = if prefix.is_empty() {
                    segment
                } else {
                    format!("{}.{}", prefix, segment)
                };
                flatten(&key, v, out)?;
            }
        }
        Value::Sequence(_) => {
            return Err(Error::Configuration(format!(
                "sequences are not supported (key '{}')",
                prefix
            )))
        }
        Value::Null => {}
        Value::Tagged(tagged) => flatten(prefix, &tagged.value, out)?,
        scalar => {
            if let Some(s) = scalar_to_string(scalar) {
                out.insert(prefix.to_string(), s);
            }
        }
    }
    Ok(())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
