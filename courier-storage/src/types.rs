//! Small value types shared by the storages.

use std::fmt;

/// Name of a storage instance, used in log lines and errors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageId(String);

impl StorageId {
    /// Create a storage id, e.g. `topic/orders/store`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the `kind` storage belonging to `topic`.
    #[must_use]
    pub fn for_topic(topic: &str, kind: &str) -> Self {
        Self(format!("topic/{topic}/{kind}"))
    }

    /// The id as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StorageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
