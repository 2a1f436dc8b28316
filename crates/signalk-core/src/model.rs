//! SignalK data model types.
//!
//! These types represent the core SignalK specification structures:
//! - Delta messages for efficient updates
//! - Metadata descriptors for paths
//! - Source tracking for multi-device scenarios

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A SignalK delta message containing one or more updates.
///
/// Deltas are the primary mechanism for transmitting changes in SignalK.
/// They contain a context (which vessel/object) and a list of updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// The context path (e.g., "vessels.urn:mrn:signalk:uuid:...")
    /// If None, defaults to the self context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// The list of updates in this delta. A frame without `updates`
    /// decodes to an empty list and is a no-op downstream.
    #[serde(default)]
    pub updates: Vec<Update>,
}

impl Delta {
    /// Create a delta for the given context.
    pub fn new(context: impl Into<String>, updates: Vec<Update>) -> Self {
        Self {
            context: Some(context.into()),
            updates,
        }
    }

    /// Split the delta into one delta per path item, keeping item order.
    ///
    /// Every fragment carries the context and the provenance (`$source`,
    /// `source`, `timestamp`) of the update it was taken from.
    pub fn fragments(&self) -> Vec<Delta> {
        let mut fragments = Vec::new();
        for update in &self.updates {
            match update.items() {
                Some(UpdateItems::Values(values)) => {
                    for pv in values {
                        fragments.push(Delta {
                            context: self.context.clone(),
                            updates: vec![update.with_items(vec![pv.clone()], None)],
                        });
                    }
                }
                Some(UpdateItems::Meta(meta)) => {
                    for pm in meta {
                        fragments.push(Delta {
                            context: self.context.clone(),
                            updates: vec![update.with_items(Vec::new(), Some(vec![pm.clone()]))],
                        });
                    }
                }
                None => {}
            }
        }
        fragments
    }

    /// Iterate over every path referenced by the delta's items.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.updates.iter().flat_map(|update| {
            let values = update.values.iter().map(|pv| pv.path.as_str());
            let meta = update
                .meta
                .iter()
                .flatten()
                .map(|pm| pm.path.as_str());
            values.chain(meta)
        })
    }
}

/// A single update within a delta, containing values from one source at one timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Update {
    /// Reference to source in /sources (e.g., "nmea0183.GP")
    #[serde(rename = "$source", default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    /// Embedded source object (alternative to $source)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,

    /// ISO 8601 timestamp (UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// The path-value pairs in this update
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<PathValue>,

    /// Metadata updates (separate from values)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<PathMeta>>,
}

/// The items carried by an update: either values or metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateItems<'a> {
    Values(&'a [PathValue]),
    Meta(&'a [PathMeta]),
}

impl Update {
    /// Create an update carrying values.
    pub fn from_values(values: Vec<PathValue>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    /// Create an update carrying metadata.
    pub fn from_meta(meta: Vec<PathMeta>) -> Self {
        Self {
            meta: Some(meta),
            ..Self::default()
        }
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// The kind of items this update carries.
    ///
    /// Values take precedence; an update with neither returns `None`.
    pub fn items(&self) -> Option<UpdateItems<'_>> {
        if !self.values.is_empty() {
            return Some(UpdateItems::Values(&self.values));
        }
        self.meta.as_deref().map(UpdateItems::Meta)
    }

    /// True when the update carries metadata rather than values.
    pub fn is_meta(&self) -> bool {
        matches!(self.items(), Some(UpdateItems::Meta(_)))
    }

    fn with_items(&self, values: Vec<PathValue>, meta: Option<Vec<PathMeta>>) -> Update {
        Update {
            source_ref: self.source_ref.clone(),
            source: self.source.clone(),
            timestamp: self.timestamp.clone(),
            values,
            meta,
        }
    }
}

/// A single path-value pair within an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    /// The SignalK path (e.g., "navigation.speedOverGround").
    /// Empty for object values merged at the context root.
    pub path: String,

    /// The value at this path
    pub value: Value,
}

impl PathValue {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Metadata for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMeta {
    /// The SignalK path this metadata applies to
    pub path: String,

    /// The metadata value
    pub value: Meta,
}

impl PathMeta {
    pub fn new(path: impl Into<String>, value: Meta) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Source information describing where data originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Label identifying the source bus (e.g., "N2K-1", "serial-COM1")
    pub label: String,

    /// Type of source (e.g., "NMEA0183", "NMEA2000", "signalk")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    /// NMEA 2000 source address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// NMEA 2000 device CAN name
    #[serde(rename = "canName", default, skip_serializing_if = "Option::is_none")]
    pub can_name: Option<String>,

    /// NMEA 2000 PGN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgn: Option<u32>,

    /// NMEA 0183 sentence type (e.g., "RMC", "GGA")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,

    /// NMEA 0183 talker ID (e.g., "GP", "II")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talker: Option<String>,

    /// AIS message type (1-27)
    #[serde(rename = "aisType", default, skip_serializing_if = "Option::is_none")]
    pub ais_type: Option<u8>,
}

impl Source {
    /// The `$source` reference for this source: the label, qualified by
    /// the NMEA 2000 address or NMEA 0183 talker when one is known.
    pub fn source_ref(&self) -> String {
        match self.src.as_deref().or(self.talker.as_deref()) {
            Some(id) => format!("{}.{}", self.label, id),
            None => self.label.clone(),
        }
    }
}

/// Metadata describing a SignalK path.
///
/// Fields outside the typed set are kept in `extra` so metadata received
/// from peers survives a round trip through the cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Display name for gauges (no units)
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Long name for displays with more space
    #[serde(rename = "longName", default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,

    /// Short name for compact displays
    #[serde(rename = "shortName", default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,

    /// SI unit string (e.g., "m/s", "rad", "K")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    /// Timeout in seconds after which data is stale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Display scale configuration
    #[serde(rename = "displayScale", default, skip_serializing_if = "Option::is_none")]
    pub display_scale: Option<DisplayScale>,

    /// Alarm zones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<Zone>>,

    /// Indicates this path supports PUT requests
    #[serde(rename = "supportsPut", default, skip_serializing_if = "Option::is_none")]
    pub supports_put: Option<bool>,

    /// Any other metadata properties.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Metadata with just units and a description, the shape the schema
    /// carries for most numeric paths.
    pub fn described(units: Option<&str>, description: &str) -> Self {
        Self {
            units: units.map(String::from),
            description: Some(description.to_string()),
            ..Self::default()
        }
    }
}

/// Display scale configuration for gauges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayScale {
    /// Lower bound of display
    pub lower: f64,

    /// Upper bound of display
    pub upper: f64,

    /// Scale type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub scale_type: Option<ScaleType>,

    /// Power for power scale type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
}

/// Scale type for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleType {
    Linear,
    Logarithmic,
    Squareroot,
    Power,
}

/// An alarm/warning zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Lower bound (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,

    /// Upper bound (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,

    /// Alarm state when in this zone
    pub state: AlarmState,

    /// Message to display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Alarm states in order of severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    Nominal,
    Normal,
    Alert,
    Warn,
    Alarm,
    Emergency,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delta_deserialize() {
        let json = r#"{
            "context": "vessels.self",
            "updates": [{
                "$source": "nmea0183.GP",
                "timestamp": "2024-01-17T10:30:00.000Z",
                "values": [
                    {"path": "navigation.speedOverGround", "value": 3.85}
                ]
            }]
        }"#;

        let delta: Delta = serde_json::from_str(json).unwrap();
        assert_eq!(delta.context, Some("vessels.self".to_string()));
        assert_eq!(delta.updates.len(), 1);
        assert_eq!(delta.updates[0].values[0].path, "navigation.speedOverGround");
        assert!(!delta.updates[0].is_meta());
    }

    #[test]
    fn test_meta_update_deserialize() {
        let json = r#"{
            "context": "vessels.self",
            "updates": [{
                "meta": [
                    {"path": "navigation.speedOverGround", "value": {"units": "m/s", "zones": [], "foo": 1}}
                ]
            }]
        }"#;

        let delta: Delta = serde_json::from_str(json).unwrap();
        let update = &delta.updates[0];
        assert!(update.is_meta());
        let meta = &update.meta.as_ref().unwrap()[0].value;
        assert_eq!(meta.units.as_deref(), Some("m/s"));
        assert_eq!(meta.extra.get("foo"), Some(&json!(1)));
    }

    #[test]
    fn test_missing_updates_is_empty() {
        let delta: Delta = serde_json::from_str(r#"{"context": "vessels.self"}"#).unwrap();
        assert!(delta.updates.is_empty());
        assert!(delta.fragments().is_empty());
    }

    #[test]
    fn test_non_array_values_rejected() {
        let json = r#"{"updates": [{"values": 5}]}"#;
        assert!(serde_json::from_str::<Delta>(json).is_err());
    }

    #[test]
    fn test_delta_serialize() {
        let delta = Delta::new(
            "vessels.self",
            vec![Update::from_values(vec![PathValue::new(
                "navigation.speedOverGround",
                json!(3.85),
            )])
            .with_source_ref("test.source")
            .with_timestamp("2024-01-17T10:30:00.000Z")],
        );

        let json = serde_json::to_string(&delta).unwrap();
        assert!(json.contains("navigation.speedOverGround"));
        assert!(json.contains("3.85"));
        assert!(json.contains("\"$source\":\"test.source\""));
        assert!(!json.contains("\"meta\""));
    }

    #[test]
    fn test_fragments_keep_order_and_provenance() {
        let delta = Delta::new(
            "vessels.self",
            vec![
                Update::from_values(vec![
                    PathValue::new("a", json!(1)),
                    PathValue::new("b", json!(2)),
                ])
                .with_source_ref("one")
                .with_timestamp("2024-01-17T10:30:00.000Z"),
                Update::from_meta(vec![PathMeta::new("a", Meta::described(Some("m"), "A"))])
                    .with_source_ref("two"),
            ],
        );

        let fragments = delta.fragments();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].updates[0].values[0].path, "a");
        assert_eq!(fragments[1].updates[0].values[0].path, "b");
        assert_eq!(fragments[1].updates[0].source_ref.as_deref(), Some("one"));
        assert!(fragments[2].updates[0].is_meta());
        assert_eq!(fragments[2].updates[0].source_ref.as_deref(), Some("two"));
        assert_eq!(delta.paths().collect::<Vec<_>>(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_source_ref_from_source() {
        let source = Source {
            label: "N2K-1".to_string(),
            source_type: Some("NMEA2000".to_string()),
            src: Some("115".to_string()),
            can_name: None,
            pgn: Some(128267),
            sentence: None,
            talker: None,
            ais_type: None,
        };
        assert_eq!(source.source_ref(), "N2K-1.115");
    }
}
