//! Default values for the self vessel.
//!
//! A defaults document mirrors the full model under `vessels.self`:
//!
//! ```json
//! {"vessels": {"self": {
//!     "name": "TestBoat",
//!     "design": {"length": {"value": {"overall": 12.1}, "meta": {"units": "m"}}}
//! }}}
//! ```
//!
//! It is turned into ordinary deltas that are sent through the hub at
//! startup, so defaults reach subscribers and the cache like any other data.

use serde_json::Value;

use crate::model::{Delta, Meta, PathMeta, PathValue, Update};

/// Convert a defaults document into deltas (without context).
///
/// - string fields directly under `vessels.self` become one root-object delta
/// - nested `meta` entries become one metadata delta
/// - nested `value` entries become one values delta
pub fn defaults_to_deltas(defaults: &Value) -> Result<Vec<Delta>, serde_json::Error> {
    let Some(Value::Object(own)) = defaults.get("vessels").and_then(|v| v.get("self")) else {
        return Ok(Vec::new());
    };

    let mut top_values = serde_json::Map::new();
    let mut meta = Vec::new();
    let mut values = Vec::new();
    for (key, value) in own {
        match value {
            Value::String(_) => {
                top_values.insert(key.clone(), value.clone());
            }
            _ => scan_defaults(key, value, &mut meta, &mut values)?,
        }
    }

    let mut deltas = Vec::new();
    if !top_values.is_empty() {
        deltas.push(unscoped(Update::from_values(vec![PathValue::new(
            "",
            Value::Object(top_values),
        )])));
    }
    if !meta.is_empty() {
        deltas.push(unscoped(Update::from_meta(meta)));
    }
    if !values.is_empty() {
        deltas.push(unscoped(Update::from_values(values)));
    }
    Ok(deltas)
}

fn unscoped(update: Update) -> Delta {
    Delta {
        context: None,
        updates: vec![update],
    }
}

fn scan_defaults(
    path: &str,
    item: &Value,
    meta: &mut Vec<PathMeta>,
    values: &mut Vec<PathValue>,
) -> Result<(), serde_json::Error> {
    let Value::Object(fields) = item else {
        return Ok(());
    };
    for (key, value) in fields {
        match key.as_str() {
            "meta" => meta.push(PathMeta::new(path, serde_json::from_value::<Meta>(value.clone())?)),
            "value" => values.push(PathValue::new(path, value.clone())),
            _ if value.is_object() => {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                scan_defaults(&child, value, meta, values)?;
            }
            _ => {}
        }
    }
    Ok(())
}
