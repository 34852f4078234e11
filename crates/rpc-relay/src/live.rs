//! Live page values and the sanitizing snapshot taken before forwarding.
//!
//! Objects handed over by the instrumentation shim are shared and mutable,
//! and may reference themselves. [`LiveValue`] models that graph;
//! [`snapshot`] turns it into a plain, owned, acyclic [`serde_json::Value`].

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Number, Value};

/// Marker written in place of a back-reference to an ancestor.
pub const CIRCULAR_MARKER: &str = "[Circular]";

pub type LiveArray = Arc<Mutex<Vec<LiveValue>>>;
pub type LiveObject = Arc<Mutex<Vec<(String, LiveValue)>>>;

#[derive(Clone, Debug)]
pub enum LiveValue {
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(LiveArray),
    Object(LiveObject),
    /// Functions, symbols and other values that have no JSON form.
    Opaque(String),
}

impl LiveValue {
    pub fn array(items: Vec<LiveValue>) -> Self {
        LiveValue::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(fields: Vec<(&str, LiveValue)>) -> Self {
        LiveValue::Object(Arc::new(Mutex::new(
            fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        )))
    }

    pub fn string(s: impl Into<String>) -> Self {
        LiveValue::String(s.into())
    }

    /// Set or replace a field on an object value. Non-objects are left alone.
    pub fn set(&self, key: &str, value: LiveValue) {
        if let LiveValue::Object(obj) = self {
            let mut fields = lock(obj);
            match fields.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value,
                None => fields.push((key.to_string(), value)),
            }
        }
    }

    pub fn push(&self, value: LiveValue) {
        if let LiveValue::Array(items) = self {
            lock(items).push(value);
        }
    }

    pub fn get(&self, key: &str) -> Option<LiveValue> {
        match self {
            LiveValue::Object(obj) => lock(obj)
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            LiveValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn node_ptr(&self) -> Option<usize> {
        match self {
            LiveValue::Array(a) => Some(Arc::as_ptr(a) as *const () as usize),
            LiveValue::Object(o) => Some(Arc::as_ptr(o) as *const () as usize),
            _ => None,
        }
    }
}

impl From<Value> for LiveValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => LiveValue::Null,
            Value::Bool(b) => LiveValue::Bool(b),
            Value::Number(n) => LiveValue::Number(n),
            Value::String(s) => LiveValue::String(s),
            Value::Array(items) => {
                LiveValue::array(items.into_iter().map(LiveValue::from).collect())
            }
            Value::Object(map) => LiveValue::Object(Arc::new(Mutex::new(
                map.into_iter().map(|(k, v)| (k, LiveValue::from(v))).collect(),
            ))),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deep-copy a live value. `None` means the value itself is undefined.
///
/// Follows JSON conventions for values without a JSON form: they are dropped
/// from objects and become `null` inside arrays. A node already on the path
/// from the root is replaced by [`CIRCULAR_MARKER`]; the same node reached
/// through two different branches is copied twice.
pub fn snapshot(value: &LiveValue) -> Option<Value> {
    let mut path = Vec::new();
    copy(value, &mut path)
}

fn copy(value: &LiveValue, path: &mut Vec<usize>) -> Option<Value> {
    if let Some(ptr) = value.node_ptr() {
        if path.contains(&ptr) {
            return Some(Value::String(CIRCULAR_MARKER.to_string()));
        }
    }

    match value {
        LiveValue::Undefined | LiveValue::Opaque(_) => None,
        LiveValue::Null => Some(Value::Null),
        LiveValue::Bool(b) => Some(Value::Bool(*b)),
        LiveValue::Number(n) => Some(Value::Number(n.clone())),
        LiveValue::String(s) => Some(Value::String(s.clone())),
        LiveValue::Array(items) => {
            // Clone the handles out so no lock is held while descending.
            let children: Vec<LiveValue> = lock(items).clone();
            path.push(value.node_ptr().unwrap_or_default());
            let out = children
                .iter()
                .map(|child| copy(child, path).unwrap_or(Value::Null))
                .collect();
            path.pop();
            Some(Value::Array(out))
        }
        LiveValue::Object(fields) => {
            let children: Vec<(String, LiveValue)> = lock(fields).clone();
            path.push(value.node_ptr().unwrap_or_default());
            let mut out = Map::new();
            for (key, child) in &children {
                if let Some(v) = copy(child, path) {
                    out.insert(key.clone(), v);
                }
            }
            path.pop();
            Some(Value::Object(out))
        }
    }
}
