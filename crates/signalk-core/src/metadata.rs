//! Path metadata lookup.
//!
//! The hub asks a [`MetadataLookup`] for the descriptive metadata of a fully
//! qualified path (`vessels.<id>.navigation.speedOverGround`) the first time
//! a value for that path is seen in a context. [`StaticSchema`] is the
//! built-in table covering the common vessel paths.

use crate::model::Meta;
use crate::path::PathPattern;

/// Source of descriptive metadata for paths.
///
/// Implementations must be pure: the same path always yields the same answer.
pub trait MetadataLookup: Send + Sync {
    /// Metadata for a fully qualified path, if the schema knows it.
    fn get_metadata(&self, path: &str) -> Option<Meta>;
}

/// A lookup that never has metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

impl MetadataLookup for NoMetadata {
    fn get_metadata(&self, _path: &str) -> Option<Meta> {
        None
    }
}

/// Pattern-keyed metadata table.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    entries: Vec<(PathPattern, Meta)>,
}

/// Vessel paths known to the built-in schema: (relative path, units, description).
const VESSEL_PATHS: &[(&str, Option<&str>, &str)] = &[
    (
        "navigation.speedOverGround",
        Some("m/s"),
        "Vessel speed over ground. If converting from AIS 'HIGH' value, set to 102.2 (Ais max value) and add warning in notifications",
    ),
    ("navigation.speedThroughWater", Some("m/s"), "Vessel speed through the water"),
    ("navigation.courseOverGroundTrue", Some("rad"), "Course over ground (true)"),
    ("navigation.courseOverGroundMagnetic", Some("rad"), "Course over ground (magnetic)"),
    ("navigation.headingTrue", Some("rad"), "The current true north heading of the vessel, equals 'headingMagnetic adjusted for magneticVariation'"),
    ("navigation.headingMagnetic", Some("rad"), "Current magnetic heading of the vessel, equals 'headingCompass adjusted for magneticDeviation'"),
    ("navigation.magneticVariation", Some("rad"), "The magnetic variation (declination) at the current position that must be added to the magnetic heading to derive the true heading"),
    ("navigation.rateOfTurn", Some("rad/s"), "Rate of turn (+ve is change to starboard). If the value is AIS RIGHT or LEFT, set to +-0.0206 rads and add warning in notifications"),
    ("navigation.position", None, "The position of the vessel in 2 or 3 dimensions (WGS84 datum)"),
    ("navigation.log", Some("m"), "Total distance traveled"),
    ("navigation.trip.log", Some("m"), "Total distance traveled on this trip / since trip reset"),
    ("environment.depth.belowTransducer", Some("m"), "Depth below Transducer"),
    ("environment.depth.belowKeel", Some("m"), "Depth below keel"),
    ("environment.wind.speedApparent", Some("m/s"), "Apparent wind speed"),
    ("environment.wind.angleApparent", Some("rad"), "Apparent wind angle, negative to port"),
    ("environment.wind.speedTrue", Some("m/s"), "Wind speed over water (as calculated from speedApparent and vessel's speed through water)"),
    ("environment.water.temperature", Some("K"), "Current water temperature"),
    ("environment.outside.temperature", Some("K"), "Current outside air temperature"),
    ("environment.outside.pressure", Some("Pa"), "Current outside air ambient pressure"),
    ("propulsion.*.revolutions", Some("Hz"), "Engine revolutions (x60 for RPM)"),
    ("propulsion.*.oilTemperature", Some("K"), "Oil temperature"),
    ("propulsion.*.temperature", Some("K"), "Engine temperature"),
    ("electrical.batteries.*.voltage", Some("V"), "Voltage measured at or as close as possible to the device"),
    ("electrical.batteries.*.current", Some("A"), "Current flowing out (+ve) or in (-ve) to the device"),
];

impl StaticSchema {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table of common vessel paths.
    pub fn builtin() -> Self {
        let mut schema = Self::new();
        for (path, units, description) in VESSEL_PATHS {
            // Entries are static and well formed.
            if let Ok(pattern) = PathPattern::new(&format!("vessels.*.{path}")) {
                schema
                    .entries
                    .push((pattern, Meta::described(*units, description)));
            }
        }
        schema
    }

    /// Add an entry for a fully qualified pattern such as `vessels.*.design.length`.
    pub fn with_entry(mut self, pattern: PathPattern, meta: Meta) -> Self {
        self.entries.push((pattern, meta));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetadataLookup for StaticSchema {
    fn get_metadata(&self, path: &str) -> Option<Meta> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, meta)| meta.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF: &str = "vessels.urn:mrn:signalk:uuid:2204ae24-c944-5ffe-8d1d-4d411c9cea2e";

    #[test]
    fn test_builtin_lookup() {
        let schema = StaticSchema::builtin();
        let meta = schema
            .get_metadata(&format!("{SELF}.navigation.speedOverGround"))
            .unwrap();
        assert_eq!(meta.units.as_deref(), Some("m/s"));

        let meta = schema
            .get_metadata(&format!("{SELF}.propulsion.port.revolutions"))
            .unwrap();
        assert_eq!(meta.units.as_deref(), Some("Hz"));
    }

    #[test]
    fn test_unknown_paths() {
        let schema = StaticSchema::builtin();
        assert!(schema.get_metadata(&format!("{SELF}.name")).is_none());
        assert!(schema.get_metadata(&format!("{SELF}.")).is_none());
        assert!(schema
            .get_metadata("atons.urn:mrn:imo:mmsi:992351000.navigation.speedOverGround")
            .is_none());
        assert!(NoMetadata.get_metadata("anything").is_none());
    }

    #[test]
    fn test_custom_entry() {
        let schema = StaticSchema::new().with_entry(
            PathPattern::new("vessels.*.design.length").unwrap(),
            Meta::described(Some("m"), "Length"),
        );
        assert_eq!(schema.len(), 1);
        assert!(schema
            .get_metadata(&format!("{SELF}.design.length"))
            .is_some());
    }
}
