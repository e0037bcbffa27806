//! Sub-config inputs that are either a raw mapping or an already-typed record.

use crate::error::{TrainingError, TrainingResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A validated argument record owned by `TrainConfig`.
pub trait Args: Serialize + DeserializeOwned + Clone {
    /// Field name used in error messages.
    const FIELD: &'static str;

    /// Cross-field checks serde cannot express.
    fn check(&self) -> TrainingResult<()> {
        Ok(())
    }
}

/// User input for an args field: a mapping of overrides or a typed record.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgsInput<T> {
    Partial(Map<String, Value>),
    Typed(T),
}

impl<T> ArgsInput<T> {
    #[must_use]
    pub fn typed(&self) -> Option<&T> {
        match self {
            Self::Partial(_) => None,
            Self::Typed(value) => Some(value),
        }
    }
}

impl<T: Serialize> Serialize for ArgsInput<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Partial(map) => map.serialize(serializer),
            Self::Typed(value) => value.serialize(serializer),
        }
    }
}

impl<'de, T> Deserialize<'de> for ArgsInput<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(Self::Partial)
    }
}

/// Deserialize `value` into `T`, reporting failures against `field`.
pub fn parse_field<T: DeserializeOwned>(field: &str, value: Value) -> TrainingResult<T> {
    serde_json::from_value(value).map_err(|e| TrainingError::config(field, e.to_string()))
}

/// Recursively merge `overrides` into `base`.
///
/// Objects merge key by key. Any other value, including `null`, replaces the
/// base value.
pub fn merge_json(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value);
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

/// Resolve an args input against `defaults`.
///
/// `None` yields the defaults, a typed record is checked and returned as is,
/// and a partial mapping is merged over the defaults field by field.
pub fn resolve_args<T: Args>(defaults: &T, input: Option<ArgsInput<T>>) -> TrainingResult<T> {
    let resolved = match input {
        None => defaults.clone(),
        Some(ArgsInput::Typed(value)) => value,
        Some(ArgsInput::Partial(overrides)) => {
            let mut merged = serde_json::to_value(defaults)?;
            merge_json(&mut merged, &Value::Object(overrides));
            parse_field(T::FIELD, merged)?
        }
    };
    resolved.check()?;
    Ok(resolved)
}
