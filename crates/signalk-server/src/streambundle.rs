//! Distribution bus.
//!
//! Every delta that reaches the hub is pushed through [`StreamBundle::publish`],
//! which splits it into path/value pairs and republishes each on per-path
//! broadcast channels:
//!
//! - the general channel for the path, carrying a [`NormalizedValue`]
//! - for the self context only, a self-scoped channel with the same envelope
//!   and a value-only channel carrying the bare value
//!
//! Channels are created lazily on first reference and never removed. Before
//! the first value for a (context, path) is delivered, schema metadata for it
//! is looked up once and, when present, published as a synthesized meta delta.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use signalk_core::path::{expand_object_paths, resolve_context};
use signalk_core::{Delta, MetadataLookup, PathMeta, PathValue, Source, Update, UpdateItems};
use tokio::sync::broadcast;
use tracing::debug;

/// Suffix appended to a path to form the channel key of its metadata.
pub const META_SUFFIX: &str = ".meta";

/// `$source` of synthesized metadata deltas.
pub const SCHEMA_SOURCE: &str = "schema";

/// Errors raised while publishing a delta.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to encode metadata for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One path/value pair together with its context and provenance.
///
/// `path` is the path of the original item (`<path>.meta` for metadata), so
/// an object delivered on an expanded channel still carries its empty path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedValue {
    pub path: String,
    pub value: Value,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(rename = "$source", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl NormalizedValue {
    pub fn is_meta(&self) -> bool {
        self.path.ends_with(META_SUFFIX)
    }

    /// Convert back into a single-item delta.
    pub fn to_delta(&self) -> Result<Delta, serde_json::Error> {
        let mut update = match self.path.strip_suffix(META_SUFFIX) {
            Some(path) => Update::from_meta(vec![PathMeta::new(
                path,
                serde_json::from_value(self.value.clone())?,
            )]),
            None => Update::from_values(vec![PathValue::new(self.path.clone(), self.value.clone())]),
        };
        update.source = self.source.clone();
        update.source_ref = self.source_ref.clone();
        update.timestamp = self.timestamp.clone();
        Ok(Delta::new(self.context.clone(), vec![update]))
    }
}

#[derive(Debug, Default)]
struct Registry {
    general: HashMap<String, broadcast::Sender<NormalizedValue>>,
    self_scoped: HashMap<String, broadcast::Sender<NormalizedValue>>,
    self_values: HashMap<String, broadcast::Sender<Value>>,
    available_self_paths: Vec<String>,
    known_self_paths: HashSet<String>,
}

impl Registry {
    /// Returns the sender and whether it was just created.
    fn general(&mut self, key: &str, capacity: usize) -> (broadcast::Sender<NormalizedValue>, bool) {
        if let Some(tx) = self.general.get(key) {
            return (tx.clone(), false);
        }
        let (tx, _) = broadcast::channel(capacity);
        self.general.insert(key.to_string(), tx.clone());
        (tx, true)
    }

    fn self_scoped(&mut self, key: &str, capacity: usize) -> broadcast::Sender<NormalizedValue> {
        self.self_scoped
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .clone()
    }

    fn self_values(&mut self, key: &str, capacity: usize) -> broadcast::Sender<Value> {
        self.self_values
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .clone()
    }

    fn note_self_path(&mut self, key: &str) {
        if self.known_self_paths.insert(key.to_string()) {
            self.available_self_paths.push(key.to_string());
        }
    }
}

#[derive(Debug)]
struct Shared {
    registry: RwLock<Registry>,
    new_paths: broadcast::Sender<String>,
    capacity: usize,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn general(&self, key: &str) -> broadcast::Sender<NormalizedValue> {
        let (tx, created) = self.write().general(key, self.capacity);
        if created {
            let _ = self.new_paths.send(key.to_string());
        }
        tx
    }
}

/// Cloneable subscriber side of the bus.
#[derive(Debug, Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
    self_context: String,
}

impl BusHandle {
    /// Subscribe to every value delivered on `key`, any context.
    pub fn subscribe_general(&self, key: &str) -> broadcast::Receiver<NormalizedValue> {
        self.shared.general(key).subscribe()
    }

    /// Subscribe to values delivered on `key` in the self context.
    pub fn subscribe_self(&self, key: &str) -> broadcast::Receiver<NormalizedValue> {
        self.shared
            .write()
            .self_scoped(key, self.shared.capacity)
            .subscribe()
    }

    /// Subscribe to bare values delivered on `key` in the self context.
    pub fn subscribe_self_values(&self, key: &str) -> broadcast::Receiver<Value> {
        self.shared
            .write()
            .self_values(key, self.shared.capacity)
            .subscribe()
    }

    /// Announces the key of every general channel created from now on.
    pub fn new_paths(&self) -> broadcast::Receiver<String> {
        self.shared.new_paths.subscribe()
    }

    /// Channel keys that have carried self-context data, in first-seen order.
    pub fn available_paths(&self) -> Vec<String> {
        self.shared.read().available_self_paths.clone()
    }

    /// Keys of all general channels, sorted.
    pub fn channel_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.read().general.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn self_context(&self) -> &str {
        &self.self_context
    }
}

/// The distribution bus. Owned by the hub worker, which is its only writer.
pub struct StreamBundle {
    self_context: String,
    shared: Arc<Shared>,
    metadata: Arc<dyn MetadataLookup>,
    /// Per context, the paths whose metadata has been settled.
    meta_sent: HashMap<String, HashSet<String>>,
}

impl StreamBundle {
    pub fn new(self_context: &str, metadata: Arc<dyn MetadataLookup>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (new_paths, _) = broadcast::channel(capacity);
        Self {
            self_context: self_context.to_string(),
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::default()),
                new_paths,
                capacity,
            }),
            metadata,
            meta_sent: HashMap::new(),
        }
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle {
            shared: self.shared.clone(),
            self_context: self.self_context.clone(),
        }
    }

    pub fn self_context(&self) -> &str {
        &self.self_context
    }

    /// Publish every item of `delta`.
    ///
    /// Synthesized metadata deltas are delivered on their own channels and
    /// handed to `emit` before the value that triggered them is delivered.
    pub fn publish<F>(&mut self, delta: &Delta, mut emit: F) -> Result<(), BusError>
    where
        F: FnMut(Delta),
    {
        let context = resolve_context(delta.context.as_deref(), &self.self_context);
        for update in &delta.updates {
            self.publish_update(&context, update, &mut emit)?;
        }
        Ok(())
    }

    fn publish_update<F>(&mut self, context: &str, update: &Update, emit: &mut F) -> Result<(), BusError>
    where
        F: FnMut(Delta),
    {
        match update.items() {
            Some(UpdateItems::Values(values)) => {
                for item in values {
                    let mut keys = if item.path.is_empty() {
                        expand_object_paths(&item.value)
                    } else {
                        vec![item.path.clone()]
                    };
                    if keys.is_empty() {
                        keys.push(String::new());
                    }
                    for key in keys {
                        self.settle_meta(context, &key, update.timestamp.as_deref(), emit)?;
                        self.deliver(&key, envelope(context, update, item.path.clone(), item.value.clone()));
                    }
                }
            }
            Some(UpdateItems::Meta(meta)) => {
                for item in meta {
                    let key = format!("{}{META_SUFFIX}", item.path);
                    let value = serde_json::to_value(&item.value).map_err(|source| BusError::Encode {
                        path: item.path.clone(),
                        source,
                    })?;
                    self.deliver(&key, envelope(context, update, key.clone(), value));
                }
            }
            None => {}
        }
        Ok(())
    }

    fn settle_meta<F>(
        &mut self,
        context: &str,
        path: &str,
        timestamp: Option<&str>,
        emit: &mut F,
    ) -> Result<(), BusError>
    where
        F: FnMut(Delta),
    {
        if path.is_empty() {
            return Ok(());
        }
        let settled = self.meta_sent.entry(context.to_string()).or_default();
        if !settled.insert(path.to_string()) {
            return Ok(());
        }
        let Some(meta) = self.metadata.get_metadata(&format!("{context}.{path}")) else {
            return Ok(());
        };

        debug!("Emitting schema metadata for {context}.{path}");
        let mut update = Update::from_meta(vec![PathMeta::new(path, meta)]).with_source_ref(SCHEMA_SOURCE);
        update.timestamp = timestamp.map(str::to_string);
        self.publish_update(context, &update, emit)?;
        emit(Delta::new(context, vec![update]));
        Ok(())
    }

    fn deliver(&self, key: &str, value: NormalizedValue) {
        let general = self.shared.general(key);
        if value.context != self.self_context {
            let _ = general.send(value);
            return;
        }

        let (scoped, bare) = {
            let mut registry = self.shared.write();
            registry.note_self_path(key);
            (
                registry.self_scoped(key, self.shared.capacity),
                registry.self_values(key, self.shared.capacity),
            )
        };
        let _ = general.send(value.clone());
        let _ = bare.send(value.value.clone());
        let _ = scoped.send(value);
    }
}

fn envelope(context: &str, update: &Update, path: String, value: Value) -> NormalizedValue {
    NormalizedValue {
        path,
        value,
        context: context.to_string(),
        source: update.source.clone(),
        source_ref: update.source_ref.clone(),
        timestamp: update.timestamp.clone(),
    }
}
