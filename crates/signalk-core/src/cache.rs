//! Delta cache: the live snapshot plus the log of deltas that built it.
//!
//! Every ingested delta is split into single-item fragments. Fragments are
//! applied to the snapshot and appended, in arrival order, to a global log
//! and to the log of their context. Replaying the log into an empty cache
//! rebuilds the same snapshot.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::Delta;
use crate::store::{CacheError, MemoryStore, SignalKStore};

/// Snapshot tree and ordered fragment log for every context.
#[derive(Debug, Clone)]
pub struct DeltaCache {
    store: MemoryStore,
    /// All fragments in arrival order.
    log: Vec<Delta>,
    /// Per-context positions into `log`.
    by_context: HashMap<String, Vec<usize>>,
}

impl DeltaCache {
    pub fn new(self_context: &str) -> Self {
        Self {
            store: MemoryStore::new(self_context),
            log: Vec::new(),
            by_context: HashMap::new(),
        }
    }

    /// Apply a delta to the snapshot and log its fragments.
    ///
    /// Fragments are logged with their context resolved, so a replay does
    /// not depend on how the sender spelled the self context. A rejected
    /// delta leaves both the snapshot and the log untouched.
    pub fn ingest(&mut self, delta: &Delta) -> Result<(), CacheError> {
        let context = self.store.resolve_context(delta.context.as_deref());
        let mut resolved = delta.clone();
        resolved.context = Some(context.clone());

        self.store.apply_delta(&resolved)?;

        let fragments = resolved.fragments();
        if fragments.is_empty() {
            return Ok(());
        }
        let positions = self.by_context.entry(context).or_default();
        for fragment in fragments {
            positions.push(self.log.len());
            self.log.push(fragment);
        }
        Ok(())
    }

    /// Build the full document.
    ///
    /// With a context, returns that context's document (`None` if the
    /// context has never been seen); without one, the full model of every
    /// context. Top-level fields named in `exclude` are omitted.
    pub fn build_full(&self, context: Option<&str>, exclude: &[&str]) -> Option<Value> {
        let mut document = match context {
            Some(context) => self.store.get_context(context)?,
            None => self.store.full_model().clone(),
        };
        if let Value::Object(fields) = &mut document {
            for key in exclude {
                fields.remove(*key);
            }
        }
        Some(document)
    }

    /// Logged fragments matching `predicate`, in log order.
    ///
    /// With a context, only that context's fragments are considered.
    pub fn cached_deltas<F>(&self, context: Option<&str>, predicate: F) -> Vec<Delta>
    where
        F: Fn(&Delta) -> bool,
    {
        match context {
            Some(context) => {
                let resolved = self.store.resolve_context(Some(context));
                self.by_context
                    .get(&resolved)
                    .map(|positions| {
                        positions
                            .iter()
                            .map(|&i| &self.log[i])
                            .filter(|delta| predicate(delta))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            }
            None => self
                .log
                .iter()
                .filter(|delta| predicate(delta))
                .cloned()
                .collect(),
        }
    }

    /// Contexts that have received at least one delta, sorted.
    pub fn contexts(&self) -> Vec<&str> {
        let mut contexts: Vec<&str> = self.by_context.keys().map(String::as_str).collect();
        contexts.sort_unstable();
        contexts
    }

    /// Number of logged fragments.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn self_context(&self) -> &str {
        self.store.self_context()
    }

    /// The underlying snapshot store.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}
