use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

/// A user-supplied set of `key = value` replacements for a serde config struct.
pub type Overrides = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown configuration key \"{0}\"")]
    UnknownKey(String),

    #[error("invalid configuration value: {0}")]
    InvalidValue(#[from] serde_json::Error),

    #[error("configuration defaults did not serialize to an object")]
    NotAnObject,

    #[error("conflicting configuration: {0}")]
    Conflict(String),
}

/// Builds a new config by replacing every key in `overrides` on top of `defaults`.
///
/// Keys must already exist on the serialized form of `T`; anything else is rejected
/// rather than silently applied.
pub fn merge_overrides<T>(defaults: &T, overrides: &Overrides) -> Result<T, ConfigurationError>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = match serde_json::to_value(defaults)? {
        Value::Object(map) => map,
        _ => return Err(ConfigurationError::NotAnObject),
    };

    for (key, value) in overrides {
        match merged.get_mut(key) {
            Some(slot) => {
                info!(key = key.as_str(), value = %value, "Updating configuration");
                *slot = value.clone();
            }
            None => return Err(ConfigurationError::UnknownKey(key.clone())),
        }
    }

    Ok(serde_json::from_value(Value::Object(merged))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Example {
        epochs: u32,
        name: String,
        limit: Option<usize>,
    }

    fn example() -> Example {
        Example {
            epochs: 1,
            name: "base".to_owned(),
            limit: Some(2),
        }
    }

    fn overrides(value: Value) -> Overrides {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn empty_overrides_keep_defaults() {
        let merged = merge_overrides(&example(), &Overrides::new()).unwrap();
        assert_eq!(merged, example());
    }

    #[test]
    fn present_keys_are_replaced() {
        let merged =
            merge_overrides(&example(), &overrides(json!({"epochs": 3, "limit": null}))).unwrap();
        assert_eq!(
            merged,
            Example {
                epochs: 3,
                name: "base".to_owned(),
                limit: None,
            }
        );
    }

    #[test]
    fn defaults_are_not_mutated() {
        let defaults = example();
        let _ = merge_overrides(&defaults, &overrides(json!({"name": "other"}))).unwrap();
        assert_eq!(defaults, example());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = merge_overrides(&example(), &overrides(json!({"epochz": 3}))).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownKey(key) if key == "epochz"));
    }

    #[test]
    fn mistyped_values_are_rejected() {
        let err = merge_overrides(&example(), &overrides(json!({"epochs": "three"}))).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue(_)));
    }
}
