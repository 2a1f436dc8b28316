//! SignalK snapshot store.
//!
//! The store maintains the current state of every context as one nested
//! full-model document and provides methods for querying and updating it.

use crate::model::{Delta, PathMeta, PathValue, Update, UpdateItems};
use crate::path::{split_context, validate_path, PathError};
use serde_json::{Map, Value};

/// SignalK schema version reported in the full model.
pub const SIGNALK_VERSION: &str = "1.7.0";

/// Errors that reject a delta before it touches the store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("Root value for context '{0}' is not an object")]
    RootValueNotObject(String),

    #[error("Context '{0}' cannot hold values")]
    InvalidContext(String),

    #[error("Failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trait for SignalK data storage implementations.
pub trait SignalKStore: Send + Sync {
    /// Apply a delta to the store, merging values into the tree.
    ///
    /// A delta with any malformed item is rejected as a whole.
    fn apply_delta(&mut self, delta: &Delta) -> Result<(), CacheError>;

    /// Get value at an absolute path (e.g., "vessels.self.navigation.position").
    fn get_path(&self, path: &str) -> Option<Value>;

    /// Get value relative to self vessel (e.g., "navigation.position").
    fn get_self_path(&self, path: &str) -> Option<Value>;

    /// Get the full state for a context (e.g., "vessels.self").
    fn get_context(&self, context: &str) -> Option<Value>;

    /// Get the self context (`vessels.<id>`).
    fn self_context(&self) -> &str;

    /// Get the full data model as JSON.
    fn full_model(&self) -> &Value;
}

/// In-memory SignalK store implementation.
///
/// Stores the full SignalK tree as a nested JSON structure:
/// `{version, self, vessels: {<id>: {...}}, sources: {...}}`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    /// The full SignalK data tree
    data: Value,
    /// The self context, e.g. "vessels.urn:mrn:signalk:uuid:..."
    self_context: String,
}

impl MemoryStore {
    /// Create a new empty store with the given self context.
    ///
    /// The self context should be in the format "vessels.urn:mrn:signalk:uuid:..."
    /// as Signal K defines it. The "self" property in the full model points to
    /// this complete path.
    pub fn new(self_context: &str) -> Self {
        let mut data = serde_json::json!({
            "version": SIGNALK_VERSION,
            "self": self_context,
            "sources": {}
        });
        if let (root, Some(id)) = split_context(self_context) {
            data[root] = serde_json::json!({ id: {} });
        }

        Self {
            data,
            self_context: self_context.to_string(),
        }
    }

    /// Resolve a delta context: missing, empty or "vessels.self" is the self context.
    pub fn resolve_context(&self, context: Option<&str>) -> String {
        crate::path::resolve_context(context, &self.self_context)
    }

    /// Get the number of unique paths with values in the store.
    pub fn path_count(&self) -> usize {
        self.data
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(key, _)| !is_reserved_key(key))
                    .map(|(_, collection)| count_paths_recursive(collection))
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Check a delta before applying anything from it.
    fn validate(&self, context: &str, delta: &Delta) -> Result<(), CacheError> {
        let (root, id) = split_context(context);
        if id.is_none() || is_reserved_key(root) {
            return Err(CacheError::InvalidContext(context.to_string()));
        }
        for update in &delta.updates {
            match update.items() {
                Some(UpdateItems::Values(values)) => {
                    for pv in values {
                        validate_path(&pv.path)?;
                        if pv.path.is_empty() && !pv.value.is_object() {
                            return Err(CacheError::RootValueNotObject(context.to_string()));
                        }
                    }
                }
                Some(UpdateItems::Meta(meta)) => {
                    for pm in meta {
                        validate_path(&pm.path)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// The object for a context, created on first use.
    fn context_mut(&mut self, context: &str) -> &mut Map<String, Value> {
        let (root, id) = split_context(context);
        let collection = ensure_object(&mut self.data, root);
        match id {
            Some(id) => ensure_object_in(collection, id),
            None => collection,
        }
    }

    /// The leaf record for a path within a context, created on first use.
    fn leaf_mut(&mut self, context: &str, path: &str) -> &mut Map<String, Value> {
        let mut current = self.context_mut(context);
        if path.is_empty() {
            return current;
        }
        for segment in path.split('.') {
            current = ensure_object_in(current, segment);
        }
        current
    }

    fn apply_value(&mut self, context: &str, update: &Update, pv: &PathValue) {
        if pv.path.is_empty() {
            if let Value::Object(fields) = &pv.value {
                let target = self.context_mut(context);
                for (key, value) in fields {
                    merge_value(target, key, value);
                }
            }
            return;
        }

        let leaf = self.leaf_mut(context, &pv.path);
        leaf.insert("value".to_string(), pv.value.clone());
        set_or_remove(leaf, "timestamp", update.timestamp.as_deref());
        set_or_remove(leaf, "$source", update.source_ref.as_deref());
    }

    fn apply_meta(&mut self, context: &str, pm: &PathMeta) -> Result<(), CacheError> {
        let meta = serde_json::to_value(&pm.value)?;
        let leaf = self.leaf_mut(context, &pm.path);
        leaf.insert("meta".to_string(), meta);
        Ok(())
    }

    /// Record the provenance of a values update in the `sources` tree.
    fn record_source(&mut self, update: &Update) -> Result<(), CacheError> {
        let source_ref = match (&update.source_ref, &update.source) {
            (Some(source_ref), _) => source_ref.clone(),
            (None, Some(source)) => source.source_ref(),
            (None, None) => return Ok(()),
        };
        let (label, id) = match &update.source {
            Some(source) => {
                let id = source_ref
                    .strip_prefix(source.label.as_str())
                    .and_then(|rest| rest.strip_prefix('.'))
                    .filter(|rest| !rest.is_empty())
                    .map(String::from);
                (source.label.clone(), id)
            }
            None => match source_ref.split_once('.') {
                Some((label, id)) => (label.to_string(), Some(id.to_string())),
                None => (source_ref.clone(), None),
            },
        };

        let details = match &update.source {
            Some(source) => {
                let mut fields = match serde_json::to_value(source)? {
                    Value::Object(fields) => fields,
                    _ => Map::new(),
                };
                fields.remove("label");
                fields
            }
            None => Map::new(),
        };

        let sources = ensure_object(&mut self.data, "sources");
        let mut node = ensure_object_in(sources, &label);
        if let Some(id) = id {
            node = ensure_object_in(node, &id);
        }
        for (key, value) in details {
            node.insert(key, value);
        }
        Ok(())
    }

    /// Get a value at a path.
    fn get_path_value(&self, path: &str) -> Option<Value> {
        let (root, rest) = split_context(path);
        let mut current = self.data.get(root)?;
        let Some(rest) = rest else {
            return Some(current.clone());
        };
        // The context id is a single segment; the remainder is a data path.
        let (id, data_path) = match rest.split_once('.') {
            Some((id, data_path)) => (id, Some(data_path)),
            None => (rest, None),
        };
        current = current.get(id)?;
        if let Some(data_path) = data_path {
            for segment in data_path.split('.') {
                current = current.as_object()?.get(segment)?;
            }
        }
        Some(current.clone())
    }
}

impl SignalKStore for MemoryStore {
    fn apply_delta(&mut self, delta: &Delta) -> Result<(), CacheError> {
        let context = self.resolve_context(delta.context.as_deref());
        self.validate(&context, delta)?;

        for update in &delta.updates {
            match update.items() {
                Some(UpdateItems::Values(values)) => {
                    self.record_source(update)?;
                    for pv in values {
                        self.apply_value(&context, update, pv);
                    }
                }
                Some(UpdateItems::Meta(meta)) => {
                    for pm in meta {
                        self.apply_meta(&context, pm)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    fn get_path(&self, path: &str) -> Option<Value> {
        self.get_path_value(path)
    }

    fn get_self_path(&self, path: &str) -> Option<Value> {
        let full_path = format!("{}.{}", self.self_context, path);
        self.get_path_value(&full_path)
    }

    fn get_context(&self, context: &str) -> Option<Value> {
        let resolved = self.resolve_context(Some(context));
        self.get_path_value(&resolved)
    }

    fn self_context(&self) -> &str {
        &self.self_context
    }

    fn full_model(&self) -> &Value {
        &self.data
    }
}

/// Top-level keys of the full model that are not context collections.
fn is_reserved_key(key: &str) -> bool {
    matches!(key, "version" | "self" | "sources")
}

/// Count the number of leaf paths (values) below a node.
fn count_paths_recursive(value: &Value) -> usize {
    match value {
        Value::Object(map) => {
            // If this object has a "value" key, it's a leaf node
            if map.contains_key("value") {
                1
            } else {
                map.values().map(count_paths_recursive).sum()
            }
        }
        _ => 0,
    }
}

/// Get the object stored under `key` in `value`, replacing anything else.
fn ensure_object<'a>(value: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => ensure_object_in(map, key),
        _ => unreachable!("value was just made an object"),
    }
}

fn ensure_object_in<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("entry was just made an object"),
    }
}

/// Deep-merge `value` into `target[key]`: objects merge key by key,
/// anything else overwrites.
fn merge_value(target: &mut Map<String, Value>, key: &str, value: &Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (child_key, child_value) in incoming {
                merge_value(existing, child_key, child_value);
            }
        }
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}

fn set_or_remove(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        None => {
            map.remove(key);
        }
    }
}
