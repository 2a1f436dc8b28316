//! # signalk-core
//!
//! Core SignalK data model, snapshot store and delta cache.
//!
//! This crate provides:
//! - Data model types (Delta, Update, PathValue, Meta, Source, etc.)
//! - Path parsing, wildcard matching and root-object expansion
//! - Metadata lookup with a built-in schema table
//! - In-memory snapshot store and the replayable delta cache
//! - Self identity resolution and default deltas
//!
//! This crate is intentionally runtime-agnostic and contains no async code.

pub mod cache;
pub mod defaults;
pub mod identity;
pub mod metadata;
pub mod model;
pub mod path;
pub mod store;

pub use cache::DeltaCache;
pub use identity::{resolve_self_identity, IdentityError, SelfIdentity};
pub use metadata::{MetadataLookup, NoMetadata, StaticSchema};
pub use model::*;
pub use path::{resolve_context, PathError, PathPattern};
pub use store::{CacheError, MemoryStore, SignalKStore};
