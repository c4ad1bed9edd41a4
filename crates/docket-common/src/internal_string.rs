use std::{borrow::Borrow, fmt::Display, ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};

/// A cheaply clonable, immutable string used for node names and path segments.
#[repr(transparent)]
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InternalString(Arc<str>);

impl InternalString {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InternalString {
    fn default() -> Self {
        Self(Arc::from(""))
    }
}

impl From<&str> for InternalString {
    #[inline(always)]
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for InternalString {
    #[inline(always)]
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&InternalString> for InternalString {
    #[inline(always)]
    fn from(value: &InternalString) -> Self {
        value.clone()
    }
}

impl From<&InternalString> for String {
    #[inline(always)]
    fn from(value: &InternalString) -> Self {
        value.0.to_string()
    }
}

impl Display for InternalString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for InternalString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Borrow<str> for InternalString {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for InternalString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for InternalString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InternalString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.into())
    }
}
