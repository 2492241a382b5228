//! Literal-or-computed request parts.
//!
//! Paths, headers and query values are [`Template`]s; request bodies are
//! [`BodyTemplate`] trees. Both are resolved when a call is prepared, never
//! at registration time, so producers run again for every call.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::AppError;

/// A value that is either fixed or produced on demand.
pub enum Template<T> {
    Literal(T),
    Computed(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Template<T> {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Template::Computed(Arc::new(f))
    }

    pub fn resolve(&self) -> T {
        match self {
            Template::Literal(value) => value.clone(),
            Template::Computed(f) => f(),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Template::Literal(_))
    }
}

impl<T: Clone> Clone for Template<T> {
    fn clone(&self) -> Self {
        match self {
            Template::Literal(value) => Template::Literal(value.clone()),
            Template::Computed(f) => Template::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Template<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Template::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Template::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl<T> From<T> for Template<T> {
    fn from(value: T) -> Self {
        Template::Literal(value)
    }
}

impl From<&str> for Template<String> {
    fn from(value: &str) -> Self {
        Template::Literal(value.to_string())
    }
}

/// A JSON request body whose leaves, lists or objects may be computed.
///
/// A computed node may itself return a tree containing further computed
/// nodes; resolution recurses until only plain JSON is left.
#[derive(Clone)]
pub enum BodyTemplate {
    Value(Value),
    List(Vec<BodyTemplate>),
    Object(Vec<(String, BodyTemplate)>),
    Computed(Arc<dyn Fn() -> BodyTemplate + Send + Sync>),
}

impl BodyTemplate {
    pub fn computed<F, R>(f: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Into<BodyTemplate>,
    {
        BodyTemplate::Computed(Arc::new(move || f().into()))
    }

    pub fn object<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<BodyTemplate>,
    {
        BodyTemplate::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn list<V: Into<BodyTemplate>>(items: impl IntoIterator<Item = V>) -> Self {
        BodyTemplate::List(items.into_iter().map(Into::into).collect())
    }

    /// Resolve every producer in the tree, calling each one exactly once.
    pub fn resolve(&self) -> Value {
        match self {
            BodyTemplate::Value(value) => value.clone(),
            BodyTemplate::List(items) => Value::Array(items.iter().map(Self::resolve).collect()),
            BodyTemplate::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve());
                }
                Value::Object(map)
            }
            BodyTemplate::Computed(f) => f().resolve(),
        }
    }

    /// Resolve and serialize to the JSON text sent on the wire.
    pub fn render(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(&self.resolve())?)
    }
}

impl fmt::Debug for BodyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyTemplate::Value(value) => f.debug_tuple("Value").field(value).finish(),
            BodyTemplate::List(items) => f.debug_tuple("List").field(items).finish(),
            BodyTemplate::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
            BodyTemplate::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<Value> for BodyTemplate {
    fn from(value: Value) -> Self {
        BodyTemplate::Value(value)
    }
}

impl From<&str> for BodyTemplate {
    fn from(value: &str) -> Self {
        BodyTemplate::Value(Value::String(value.to_string()))
    }
}

impl From<String> for BodyTemplate {
    fn from(value: String) -> Self {
        BodyTemplate::Value(Value::String(value))
    }
}

impl From<i64> for BodyTemplate {
    fn from(value: i64) -> Self {
        BodyTemplate::Value(Value::from(value))
    }
}

impl From<f64> for BodyTemplate {
    fn from(value: f64) -> Self {
        BodyTemplate::Value(Value::from(value))
    }
}

impl From<bool> for BodyTemplate {
    fn from(value: bool) -> Self {
        BodyTemplate::Value(Value::Bool(value))
    }
}

impl From<Vec<BodyTemplate>> for BodyTemplate {
    fn from(items: Vec<BodyTemplate>) -> Self {
        BodyTemplate::List(items)
    }
}
