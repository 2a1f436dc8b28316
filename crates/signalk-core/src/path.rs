//! SignalK path handling.
//!
//! SignalK paths are dot-separated strings like "navigation.speedOverGround".
//! This module covers validation of delta paths, glob-style patterns used by the metadata
//! lookup, and enumeration of the leaf paths of object values delivered at
//! the context root.

use serde_json::Value;

/// Check that a delta path is well formed.
///
/// The empty path is valid (root object values); otherwise every segment
/// must be non-empty.
pub fn validate_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Ok(());
    }
    if path.split('.').any(str::is_empty) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(())
}

/// Resolve a delta context against the self context.
///
/// A missing, empty or `vessels.self` context refers to the self vessel.
pub fn resolve_context(context: Option<&str>, self_context: &str) -> String {
    match context {
        None | Some("") | Some("vessels.self") => self_context.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Split a context such as `vessels.urn:mrn:signalk:uuid:...` into its
/// root collection and identifier.
///
/// Identifiers never contain dots, so everything after the first dot is
/// the identifier.
pub fn split_context(context: &str) -> (&str, Option<&str>) {
    match context.split_once('.') {
        Some((root, id)) => (root, Some(id)),
        None => (context, None),
    }
}

/// Enumerate the dotted leaf paths of an object value.
///
/// Top-level keys form the first segment; nested objects are descended
/// into, everything else (scalars, arrays) terminates the path. Non-object
/// values have no leaf paths.
pub fn expand_object_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Value::Object(map) = value {
        for (key, child) in map {
            accumulate_leaf_paths(&mut paths, key.clone(), child);
        }
    }
    paths
}

fn accumulate_leaf_paths(paths: &mut Vec<String>, prefix: String, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                accumulate_leaf_paths(paths, format!("{prefix}.{key}"), child);
            }
        }
        _ => paths.push(prefix),
    }
}

/// A segment in a path pattern.
#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    /// Exact literal match for this segment
    Literal(String),
    /// Single wildcard (*) - matches exactly one segment when mid-path,
    /// or any suffix when at the end
    Wildcard,
}

/// A path pattern that may contain wildcards.
///
/// Supported patterns:
/// - Exact: "navigation.speedOverGround"
/// - Suffix wildcard: "navigation.*"
/// - Mid-path wildcard: "propulsion.*.revolutions"
/// - Full wildcard: "*"
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    /// True if the pattern ends with a wildcard (matches any suffix)
    trailing_wildcard: bool,
}

impl PathPattern {
    /// Create a new path pattern.
    ///
    /// Pattern syntax:
    /// - `*` at end matches any suffix (e.g., "navigation.*" matches "navigation.position.latitude")
    /// - `*` in middle matches exactly one segment (e.g., "propulsion.*.revolutions")
    /// - `*` alone matches any path
    pub fn new(pattern: &str) -> Result<Self, PathError> {
        let raw = pattern.to_string();
        let parts: Vec<&str> = pattern.split('.').collect();

        // Check for empty pattern
        if parts.is_empty() || (parts.len() == 1 && parts[0].is_empty()) {
            return Err(PathError::EmptyPattern);
        }

        let trailing_wildcard = parts.last() == Some(&"*");

        let segments: Vec<PatternSegment> = parts
            .iter()
            .map(|&s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            raw,
            segments,
            trailing_wildcard,
        })
    }

    /// Check if a path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path_parts: Vec<&str> = path.split('.').collect();

        // Special case: single wildcard matches everything
        if self.segments.len() == 1 && self.segments[0] == PatternSegment::Wildcard {
            return true;
        }

        // If trailing wildcard, path must have at least (pattern_len - 1) segments
        // If no trailing wildcard, path must have exactly pattern_len segments
        if self.trailing_wildcard {
            if path_parts.len() < self.segments.len() - 1 {
                return false;
            }
        } else if path_parts.len() != self.segments.len() {
            return false;
        }

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Literal(lit) => {
                    if i >= path_parts.len() || path_parts[i] != lit {
                        return false;
                    }
                }
                PatternSegment::Wildcard => {
                    // Trailing wildcard matches any remaining suffix
                    if self.trailing_wildcard && i == self.segments.len() - 1 {
                        return true;
                    }
                    if i >= path_parts.len() {
                        return false;
                    }
                    if path_parts[i].is_empty() {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Get the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Errors for malformed paths and patterns.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Path '{0}' has an empty segment")]
    EmptySegment(String),
}
