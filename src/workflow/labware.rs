//! Deck labware registry.
//!
//! Labware named in `global_config.labware` is loaded onto the robot once per
//! run. Stock `opentrons_*` types load by name; anything else needs a JSON
//! definition `{labware_dir}/{type}.json`. Any failure falls back to the
//! synthetic id `{type}_{slot}` so the run can continue.

use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::RobotClient;
use crate::workflow::document::{GlobalConfig, LabwareSpec};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STOCK_PREFIX: &str = "opentrons_";

/// Deck slot origins, slots 1 to 12 in row-major order.
const DECK_SLOTS: [(f64, f64); 12] = [
    (0.0, 0.0),
    (0.13, 0.0),
    (0.26, 0.0),
    (0.0, 0.09),
    (0.13, 0.09),
    (0.26, 0.09),
    (0.0, 0.18),
    (0.13, 0.18),
    (0.26, 0.18),
    (0.0, 0.27),
    (0.13, 0.27),
    (0.26, 0.27),
];

/// Origin of a deck slot.
pub fn slot_origin(slot: u8) -> Option<(f64, f64)> {
    match slot {
        1..=12 => Some(DECK_SLOTS[usize::from(slot) - 1]),
        _ => None,
    }
}

/// Labware as loaded for this run.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedLabware {
    /// Robot-side id, or the synthetic fallback id
    pub id: String,
    #[allow(missing_docs)]
    pub spec: LabwareSpec,
    /// Definition with well geometry, when one was found
    pub definition: Option<Value>,
    /// True when the robot never confirmed the load
    pub fallback: bool,
}

impl LoadedLabware {
    /// Well centre `(x, y, z)` from the definition; the origin when unknown.
    pub fn well_position(&self, well: &str) -> (f64, f64, f64) {
        let Some(entry) = self
            .definition
            .as_ref()
            .and_then(|definition| definition.get("wells"))
            .and_then(|wells| wells.get(well))
        else {
            return (0.0, 0.0, 0.0);
        };
        let coord = |axis: &str| entry.get(axis).and_then(Value::as_f64).unwrap_or(0.0);
        (coord("x"), coord("y"), coord("z"))
    }
}

/// Labware by workflow-local name.
#[derive(Clone, Debug, Default)]
pub struct LabwareRegistry {
    entries: BTreeMap<String, LoadedLabware>,
}

fn fallback_id(spec: &LabwareSpec) -> String {
    format!("{}_{}", spec.kind, spec.slot)
}

async fn read_definition(path: &Path) -> AppResult<Value> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

impl LabwareRegistry {
    /// Loads every labware entry, falling back per entry on failure.
    pub async fn setup(
        robot: &dyn RobotClient,
        config: &GlobalConfig,
        labware_dir: &Path,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for (name, spec) in &config.labware {
            info!(labware = %name, kind = %spec.kind, slot = spec.slot, "Loading labware");
            let path: PathBuf = labware_dir.join(format!("{}.json", spec.kind));
            let definition = match read_definition(&path).await {
                Ok(definition) => Some(definition),
                Err(err) => {
                    if !spec.kind.starts_with(STOCK_PREFIX) {
                        warn!(path = %path.display(), error = %err, "Custom labware definition unavailable");
                    }
                    None
                }
            };

            let loaded = if spec.kind.starts_with(STOCK_PREFIX) {
                robot.load_labware(spec.slot, &spec.kind).await
            } else if let Some(definition) = &definition {
                robot.load_custom_labware(spec.slot, definition).await
            } else {
                Err(EchemError::UnknownLabware(spec.kind.clone()))
            };

            let (id, fallback) = match loaded {
                Ok(id) if !id.is_empty() => (id, false),
                Ok(_) => {
                    warn!(labware = %name, "Robot returned an empty labware id, using fallback id");
                    (fallback_id(spec), true)
                }
                Err(err) => {
                    warn!(labware = %name, error = %err, "Failed to load labware, using fallback id");
                    (fallback_id(spec), true)
                }
            };
            info!(labware = %name, id = %id, "Labware assigned to slot {}", spec.slot);
            entries.insert(
                name.clone(),
                LoadedLabware {
                    id,
                    spec: spec.clone(),
                    definition,
                    fallback,
                },
            );
        }
        Self { entries }
    }

    #[allow(missing_docs)]
    pub fn get(&self, name: &str) -> Option<&LoadedLabware> {
        self.entries.get(name)
    }

    /// Labware by name, or `UnknownLabware` listing what is available.
    pub fn require(&self, name: &str) -> AppResult<&LoadedLabware> {
        self.entries.get(name).ok_or_else(|| {
            let available: Vec<&str> = self.entries.keys().map(String::as_str).collect();
            warn!(labware = %name, ?available, "Labware not found");
            EchemError::UnknownLabware(name.to_string())
        })
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockRobot, RobotCall};
    use serde_json::json;

    fn config(labware: Value) -> GlobalConfig {
        serde_json::from_value(json!({ "labware": labware })).unwrap()
    }

    #[test]
    fn test_slot_table() {
        assert_eq!(slot_origin(1), Some((0.0, 0.0)));
        assert_eq!(slot_origin(12), Some((0.26, 0.27)));
        assert_eq!(slot_origin(0), None);
        assert_eq!(slot_origin(13), None);
    }

    #[tokio::test]
    async fn test_stock_and_custom_loading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vial_rack_2.json"),
            json!({
                "parameters": {"loadName": "vial_rack_2"},
                "wells": {"B1": {"x": 12.5, "y": 40.0, "z": 3.0}}
            })
            .to_string(),
        )
        .unwrap();

        let robot = MockRobot::new();
        let registry = LabwareRegistry::setup(
            &robot,
            &config(json!({
                "tips": {"type": "opentrons_96_tiprack_300ul", "slot": 10},
                "vials": {"type": "vial_rack_2", "slot": 2}
            })),
            dir.path(),
        )
        .await;

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.require("tips").unwrap().id, "opentrons_96_tiprack_300ul@10");
        let vials = registry.require("vials").unwrap();
        assert!(!vials.fallback);
        assert_eq!(vials.well_position("B1"), (12.5, 40.0, 3.0));
        assert_eq!(vials.well_position("Z9"), (0.0, 0.0, 0.0));
        assert!(robot
            .calls()
            .await
            .contains(&RobotCall::LoadCustomLabware { slot: 2, name: "vial_rack_2".into() }));
    }

    #[tokio::test]
    async fn test_fallback_ids() {
        let dir = tempfile::tempdir().unwrap();
        let robot = MockRobot::new();
        robot.fail_labware("opentrons_tiprack").await;
        let registry = LabwareRegistry::setup(
            &robot,
            &config(json!({
                "tips": {"type": "opentrons_tiprack", "slot": 1},
                "beaker": {"type": "missing_definition", "slot": 5}
            })),
            dir.path(),
        )
        .await;

        let tips = registry.require("tips").unwrap();
        assert!(tips.fallback);
        assert_eq!(tips.id, "opentrons_tiprack_1");
        assert_eq!(registry.require("beaker").unwrap().id, "missing_definition_5");
        assert!(matches!(
            registry.require("nothing"),
            Err(EchemError::UnknownLabware(_))
        ));
    }
}
