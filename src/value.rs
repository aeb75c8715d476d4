//! Cached value model

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A value held by a cache layer.
///
/// `Absent` caches a negative lookup. It is distinct from "not found in the
/// cache" (which is `None` at the call site), and because every stored
/// value is tagged it can never be confused with a legitimate `V`, even one
/// that serializes to `null`:
///
/// ```text
/// Present(v) -> {"present": <v>}
/// Absent     -> "absent"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedValue<V> {
    Present(V),
    Absent,
}

impl<V> CachedValue<V> {
    /// Wrap an optional value, mapping `None` to the absent sentinel
    pub fn from_option(value: Option<V>) -> Self {
        match value {
            Some(v) => Self::Present(v),
            None => Self::Absent,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_ref(&self) -> CachedValue<&V> {
        match self {
            Self::Present(v) => CachedValue::Present(v),
            Self::Absent => CachedValue::Absent,
        }
    }

    /// Unwrap the sentinel: `Absent` becomes `None`
    pub fn into_option(self) -> Option<V> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }
}

impl<V> From<V> for CachedValue<V> {
    fn from(value: V) -> Self {
        Self::Present(value)
    }
}
