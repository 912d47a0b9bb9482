//! Device type to command destination mapping.
//!
//! A [`MappingTable`] is an immutable snapshot built from an ordered list of
//! `(pattern, destinations)` entries plus an optional default set. Patterns
//! are either exact device type tokens or contain `*`, which matches any run
//! of characters. Resolution order:
//!
//! 1. the first exact entry equal to the device type,
//! 2. the first wildcard entry matching it, in declaration order,
//! 3. the default destinations,
//! 4. otherwise [`RoutingFailure::NoDestination`].
//!
//! [`DeviceTypeMappingRouter`] holds the current snapshot and swaps it as a
//! whole, so a reader sees either the old table or the new one.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use telemetry_common::error::{ConfigurationError, RoutingFailure};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTarget(pub String);

impl RouteTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One declared mapping, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub device_type: String,
    pub destinations: Vec<RouteTarget>,
}

impl MappingEntry {
    pub fn new(device_type: impl Into<String>, destinations: &[&str]) -> Self {
        Self {
            device_type: device_type.into(),
            destinations: destinations.iter().map(|d| RouteTarget::new(*d)).collect(),
        }
    }
}

/// Mapping file layout:
///
/// ```json
/// {
///   "mappings": [
///     {"deviceType": "sensor-temp", "destinations": ["coap"]},
///     {"deviceType": "sensor-*", "destinations": ["mqtt"]}
///   ],
///   "defaultDestinations": ["mqtt"]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingConfig {
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
    #[serde(default)]
    pub default_destinations: Vec<RouteTarget>,
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Wildcard(Regex),
}

#[derive(Debug)]
struct CompiledEntry {
    pattern: String,
    matcher: Matcher,
    destinations: Vec<RouteTarget>,
}

#[derive(Debug, Default)]
pub struct MappingTable {
    entries: Vec<CompiledEntry>,
    default_destinations: Vec<RouteTarget>,
}

impl MappingTable {
    pub fn build(config: MappingConfig) -> Result<Self, ConfigurationError> {
        let entries = config
            .mappings
            .into_iter()
            .map(|entry| {
                // an entry that routes nowhere would swallow commands silently
                if entry.destinations.is_empty() {
                    return Err(ConfigurationError::InvalidSetting {
                        name: "mappings".to_string(),
                        reason: format!("{} has no destinations", entry.device_type),
                    });
                }
                let matcher = compile_pattern(&entry.device_type)?;
                Ok(CompiledEntry {
                    pattern: entry.device_type,
                    matcher,
                    destinations: dedup(entry.destinations),
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        Ok(Self {
            entries,
            default_destinations: dedup(config.default_destinations),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, device_type: &str) -> Result<Vec<RouteTarget>, RoutingFailure> {
        let exact = self.entries.iter().find(|entry| match &entry.matcher {
            Matcher::Exact(token) => token == device_type,
            Matcher::Wildcard(_) => false,
        });
        let matched = exact.or_else(|| {
            self.entries.iter().find(|entry| match &entry.matcher {
                Matcher::Exact(_) => false,
                Matcher::Wildcard(regex) => regex.is_match(device_type),
            })
        });

        if let Some(entry) = matched {
            tracing::debug!(device_type, pattern = %entry.pattern, "mapping matched");
            return Ok(entry.destinations.clone());
        }
        if !self.default_destinations.is_empty() {
            return Ok(self.default_destinations.clone());
        }
        Err(RoutingFailure::NoDestination {
            device_type: device_type.to_string(),
        })
    }

    /// Every destination the table can resolve to, for startup validation.
    pub fn destinations(&self) -> HashSet<&RouteTarget> {
        self.entries
            .iter()
            .flat_map(|entry| entry.destinations.iter())
            .chain(self.default_destinations.iter())
            .collect()
    }
}

fn compile_pattern(pattern: &str) -> Result<Matcher, ConfigurationError> {
    if !pattern.contains('*') {
        return Ok(Matcher::Exact(pattern.to_string()));
    }
    let anchored = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
    Regex::new(&anchored)
        .map(Matcher::Wildcard)
        .map_err(|e| ConfigurationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

fn dedup(destinations: Vec<RouteTarget>) -> Vec<RouteTarget> {
    let mut seen = HashSet::new();
    destinations
        .into_iter()
        .filter(|d| seen.insert(d.clone()))
        .collect()
}

pub fn load_mapping_file(path: impl AsRef<Path>) -> Result<MappingTable, ConfigurationError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigurationError::MappingFile(format!("{}: {}", path.display(), e)))?;
    let config: MappingConfig = serde_json::from_str(&raw)
        .map_err(|e| ConfigurationError::MappingFile(format!("{}: {}", path.display(), e)))?;
    let table = MappingTable::build(config)?;
    info!(
        path = %path.display(),
        entries = table.len(),
        "loaded destination mapping"
    );
    Ok(table)
}

pub struct DeviceTypeMappingRouter {
    table: RwLock<Arc<MappingTable>>,
}

impl DeviceTypeMappingRouter {
    pub fn new(table: MappingTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<MappingTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new table. Lookups already holding the old snapshot finish
    /// against it.
    pub fn replace(&self, table: MappingTable) {
        let entries = table.len();
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        info!(entries, "destination mapping replaced");
    }

    pub fn resolve_destinations(
        &self,
        device_type: &str,
    ) -> Result<Vec<RouteTarget>, RoutingFailure> {
        self.snapshot().resolve(device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(mappings: Vec<MappingEntry>, default: &[&str]) -> MappingTable {
        MappingTable::build(MappingConfig {
            mappings,
            default_destinations: default.iter().map(|d| RouteTarget::new(*d)).collect(),
        })
        .unwrap()
    }

    fn targets(ids: &[&str]) -> Vec<RouteTarget> {
        ids.iter().map(|id| RouteTarget::new(*id)).collect()
    }

    #[test]
    fn exact_entry_beats_earlier_wildcard() {
        let table = table(
            vec![
                MappingEntry::new("sensor-*", &["A"]),
                MappingEntry::new("sensor-temp", &["B"]),
            ],
            &[],
        );

        assert_eq!(table.resolve("sensor-temp").unwrap(), targets(&["B"]));
        assert_eq!(table.resolve("sensor-humidity").unwrap(), targets(&["A"]));
    }

    #[test]
    fn first_matching_wildcard_wins() {
        let table = table(
            vec![
                MappingEntry::new("sensor-*", &["A"]),
                MappingEntry::new("*-temp", &["C"]),
            ],
            &[],
        );
        assert_eq!(table.resolve("sensor-temp").unwrap(), targets(&["A"]));
        assert_eq!(table.resolve("water-temp").unwrap(), targets(&["C"]));
    }

    #[test]
    fn wildcards_are_anchored_and_literal_otherwise() {
        let table = table(vec![MappingEntry::new("gps.v*", &["A"])], &[]);
        assert!(table.resolve("gps.v2").is_ok());
        assert!(table.resolve("gpsxv2").is_err());
        assert!(table.resolve("old-gps.v2").is_err());
    }

    #[test]
    fn falls_back_to_default_then_fails() {
        let with_default = table(vec![MappingEntry::new("tracker", &["A"])], &["mqtt"]);
        assert_eq!(with_default.resolve("thermostat").unwrap(), targets(&["mqtt"]));

        let without = table(vec![MappingEntry::new("tracker", &["A"])], &[]);
        assert!(matches!(
            without.resolve("thermostat"),
            Err(RoutingFailure::NoDestination { device_type }) if device_type == "thermostat"
        ));
    }

    #[test]
    fn entry_without_destinations_is_rejected() {
        for pattern in ["tracker", "track*"] {
            let result = MappingTable::build(MappingConfig {
                mappings: vec![MappingEntry::new(pattern, &[])],
                default_destinations: Vec::new(),
            });
            assert!(matches!(
                result,
                Err(ConfigurationError::InvalidSetting { reason, .. }) if reason.contains(pattern)
            ));
        }
    }

    #[test]
    fn destinations_are_deduplicated_in_order() {
        let table = table(vec![MappingEntry::new("tracker", &["B", "A", "B"])], &[]);
        assert_eq!(table.resolve("tracker").unwrap(), targets(&["B", "A"]));
    }

    #[test]
    fn replace_swaps_the_whole_table() {
        let router =
            DeviceTypeMappingRouter::new(table(vec![MappingEntry::new("tracker", &["A"])], &[]));
        let before = router.snapshot();

        router.replace(table(vec![MappingEntry::new("thermostat", &["B"])], &[]));

        assert!(router.resolve_destinations("tracker").is_err());
        assert_eq!(
            router.resolve_destinations("thermostat").unwrap(),
            targets(&["B"])
        );
        // an old snapshot stays consistent
        assert_eq!(before.resolve("tracker").unwrap(), targets(&["A"]));
    }

    #[test]
    fn mapping_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(
            &path,
            r#"{
                "mappings": [
                    {"deviceType": "sensor-*", "destinations": ["A"]},
                    {"deviceType": "sensor-temp", "destinations": ["B"]}
                ],
                "defaultDestinations": ["mqtt"]
            }"#,
        )
        .unwrap();

        let table = load_mapping_file(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("sensor-temp").unwrap(), targets(&["B"]));
        assert_eq!(table.resolve("pump").unwrap(), targets(&["mqtt"]));
    }

    #[test]
    fn missing_mapping_file_is_a_configuration_error() {
        assert!(matches!(
            load_mapping_file("/nonexistent/mapping.json"),
            Err(ConfigurationError::MappingFile(_))
        ));
    }
}
