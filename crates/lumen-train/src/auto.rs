//! The `"auto"` sentinel.
//!
//! Many config fields accept either a concrete value or the string `"auto"`,
//! meaning "pick something sensible once enough is known about the run".
//! `Auto<T>` keeps that distinction in the type instead of in string
//! comparisons.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const AUTO: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Auto<T> {
    #[default]
    Auto,
    Explicit(T),
}

impl<T> Auto<T> {
    #[must_use]
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    #[must_use]
    pub fn explicit(&self) -> Option<&T> {
        match self {
            Self::Auto => None,
            Self::Explicit(value) => Some(value),
        }
    }

    /// Returns the explicit value or computes one for `Auto`.
    pub fn resolve_with(self, f: impl FnOnce() -> T) -> T {
        match self {
            Self::Auto => f(),
            Self::Explicit(value) => value,
        }
    }

    /// Fallible variant of [`Auto::resolve_with`].
    pub fn try_resolve_with<E>(self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        match self {
            Self::Auto => f(),
            Self::Explicit(value) => Ok(value),
        }
    }
}

impl<T> From<T> for Auto<T> {
    fn from(value: T) -> Self {
        Self::Explicit(value)
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Auto<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str(AUTO),
            Self::Explicit(value) => value.fmt(f),
        }
    }
}

impl<T: Serialize> Serialize for Auto<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str(AUTO),
            Self::Explicit(value) => value.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Auto<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.as_str() == Some(AUTO) {
            return Ok(Self::Auto);
        }
        serde_json::from_value(value).map(Self::Explicit).map_err(serde::de::Error::custom)
    }
}
