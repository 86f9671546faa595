use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{fmt, marker::PhantomData, sync::Arc};
use tracing::warn;

use crate::error::{GraphError, Result};

/// A named slot in the [`Context`] that always holds values of type `T`.
///
/// Keys are declared once as constants so producers and consumers of a slot
/// cannot disagree on its name or its shape.
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.name).finish()
    }
}

/// Context for sharing data between tasks in a graph execution.
///
/// Cloning is cheap; every clone observes the same underlying map, which is
/// what lets fan-out branches publish their results to the joining task.
#[derive(Clone, Debug)]
pub struct Context {
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.data.insert(key, value);
            }
            Err(e) => warn!(key = %key, error = %e, "Dropping context value that failed to serialize"),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }

    /// Synchronous read, used by edge conditions.
    pub fn get_sync<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub async fn put<T: Serialize>(&self, key: Key<T>, value: &T) {
        self.set(key.name(), value).await;
    }

    pub async fn fetch<T: DeserializeOwned>(&self, key: Key<T>) -> Option<T> {
        self.get_sync(key.name())
    }

    pub fn fetch_sync<T: DeserializeOwned>(&self, key: Key<T>) -> Option<T> {
        self.get_sync(key.name())
    }

    /// Like [`Context::fetch`] but a missing or mistyped slot is an error.
    pub async fn require<T: DeserializeOwned>(&self, key: Key<T>) -> Result<T> {
        self.fetch(key).await.ok_or_else(|| {
            GraphError::ContextError(format!("{} not found in context", key.name()))
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
