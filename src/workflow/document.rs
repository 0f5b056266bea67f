//! Workflow document model.
//!
//! A workflow file is JSON with three top-level keys:
//!
//! ```json
//! {
//!   "global_config": {
//!     "labware":     { "tips": { "type": "opentrons_96_tiprack_300ul", "slot": 10 } },
//!     "instruments": { "pipette": { "type": "p1000_single_gen2", "mount": "right" } },
//!     "hardware":    { "robot": { "ip": "100.67.89.154" }, "arm": { "ip": "192.168.1.233" } }
//!   },
//!   "nodes": [ { "id": "0", "label": "Home", "type": "home", "params": { ... } } ],
//!   "edges": [ { "source": "0", "target": "1" } ]
//! }
//! ```
//!
//! Node `params` may carry `robot_actions`, `arm_actions`, `peripheral_control`
//! and, for nodes whose `type` names a technique, measurement parameters. The
//! older spellings `ot2_actions`, `xarm_actions`, `arduino_control`,
//! `hardware.ot2` and `hardware.xarm` are accepted as aliases.
//!
//! Loading turns the raw document into closed action enums. Actions with an
//! unrecognised name are logged and dropped; a recognised action with bad
//! fields rejects the whole document.

use crate::core::{JsonMap, Technique};
use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::{Offset, PoseMotion, ServoMotion};
use crate::hardware::peripheral::{parse_peripheral_block, PeripheralCommand};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error};

// =============================================================================
// Global configuration
// =============================================================================

/// Labware placed on the deck.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LabwareSpec {
    /// Load name, e.g. `opentrons_96_tiprack_300ul`, or a custom definition name
    #[serde(rename = "type")]
    pub kind: String,
    /// Deck slot, 1 to 12
    pub slot: u8,
}

/// Pipette attached to the robot.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PipetteSpec {
    #[serde(rename = "type")]
    #[allow(missing_docs)]
    pub model: String,
    /// `left` or `right`
    #[serde(default = "default_mount")]
    pub mount: String,
}

fn default_mount() -> String {
    "right".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[allow(missing_docs)]
pub struct Instruments {
    #[serde(default)]
    pub pipette: Option<PipetteSpec>,
}

/// Network endpoint override for one device.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[allow(missing_docs)]
pub struct Endpoint {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Device endpoints named by the document.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[allow(missing_docs)]
pub struct HardwareEndpoints {
    #[serde(default, alias = "ot2")]
    pub robot: Option<Endpoint>,
    #[serde(default, alias = "xarm")]
    pub arm: Option<Endpoint>,
}

/// `global_config` block.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct GlobalConfig {
    /// Labware by workflow-local name
    #[serde(default)]
    pub labware: BTreeMap<String, LabwareSpec>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub instruments: Instruments,
    #[serde(default)]
    #[allow(missing_docs)]
    pub hardware: HardwareEndpoints,
}

// =============================================================================
// Actions
// =============================================================================

fn default_robot_speed() -> f64 {
    100.0
}

fn default_arm_speed() -> f64 {
    100.0
}

fn default_arm_acc() -> f64 {
    500.0
}

fn default_gripper_position() -> f64 {
    500.0
}

fn default_true() -> bool {
    true
}

fn peripheral_block<'de, D>(deserializer: D) -> Result<Vec<PeripheralCommand>, D::Error>
where
    D: Deserializer<'de>,
{
    let block = JsonMap::deserialize(deserializer)?;
    parse_peripheral_block(&block).map_err(serde::de::Error::custom)
}

/// Liquid-handling robot step.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum RobotAction {
    /// Move to a tip-rack well and pick up a tip
    PickUpTip {
        labware: String,
        well: String,
        #[serde(default)]
        offset: Offset,
    },
    /// Move to a well and drop the tip
    DropTip {
        labware: String,
        well: String,
        #[serde(default)]
        offset: Offset,
    },
    /// Move the pipette to a well
    MoveTo {
        labware: String,
        well: String,
        #[serde(default)]
        offset: Offset,
        #[serde(default = "default_robot_speed")]
        speed: f64,
    },
    /// Run pumps and ultrasonic bath; no robot motion
    Wash {
        #[serde(
            default,
            alias = "arduino_actions",
            deserialize_with = "peripheral_block"
        )]
        peripheral_control: Vec<PeripheralCommand>,
    },
    /// Home all axes
    Home,
}

impl RobotAction {
    /// Action names understood by the robot.
    pub const NAMES: [&'static str; 5] = ["pick_up_tip", "drop_tip", "move_to", "wash", "home"];

    #[allow(missing_docs)]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PickUpTip { .. } => "pick_up_tip",
            Self::DropTip { .. } => "drop_tip",
            Self::MoveTo { .. } => "move_to",
            Self::Wash { .. } => "wash",
            Self::Home => "home",
        }
    }

    /// Labware the action targets, if any.
    pub fn labware(&self) -> Option<&str> {
        match self {
            Self::PickUpTip { labware, .. }
            | Self::DropTip { labware, .. }
            | Self::MoveTo { labware, .. } => Some(labware),
            Self::Wash { .. } | Self::Home => None,
        }
    }
}

/// Articulated arm step.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ArmAction {
    /// Joint-space move
    SetServoAngle {
        angles: Vec<f64>,
        #[serde(default = "default_arm_speed")]
        speed: f64,
        #[serde(default = "default_arm_acc")]
        acc: f64,
        #[serde(default)]
        mvtime: f64,
        #[serde(default = "default_true")]
        relative: bool,
    },
    /// Cartesian move
    SetPosition {
        pose: [f64; 6],
        #[serde(default = "default_arm_speed")]
        speed: f64,
        #[serde(default = "default_arm_acc")]
        acc: f64,
        #[serde(default)]
        mvtime: f64,
    },
    /// Gripper opening; `labware` names what is grabbed or released
    SetGripperPosition {
        #[serde(default = "default_gripper_position")]
        pos: f64,
        #[serde(default)]
        labware: String,
    },
}

impl ArmAction {
    /// Action names understood by the arm.
    pub const NAMES: [&'static str; 3] = ["set_servo_angle", "set_position", "set_gripper_position"];

    #[allow(missing_docs)]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetServoAngle { .. } => "set_servo_angle",
            Self::SetPosition { .. } => "set_position",
            Self::SetGripperPosition { .. } => "set_gripper_position",
        }
    }

    /// Joint-space motion request, for servo moves.
    pub fn servo_motion(&self) -> Option<ServoMotion> {
        match self {
            Self::SetServoAngle {
                angles,
                speed,
                acc,
                mvtime,
                relative,
            } => Some(ServoMotion {
                angles: angles.clone(),
                speed: *speed,
                acc: *acc,
                mvtime: *mvtime,
                relative: *relative,
            }),
            _ => None,
        }
    }

    /// Cartesian motion request, for pose moves.
    pub fn pose_motion(&self) -> Option<PoseMotion> {
        match self {
            Self::SetPosition {
                pose,
                speed,
                acc,
                mvtime,
            } => Some(PoseMotion {
                pose: *pose,
                speed: *speed,
                acc: *acc,
                mvtime: *mvtime,
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Nodes and edges
// =============================================================================

/// Accepts ids written as strings or bare numbers.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {other}"
        ))),
    }
}

/// Directed dependency between two nodes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[allow(missing_docs)]
pub struct Edge {
    #[serde(deserialize_with = "id_string")]
    pub source: String,
    #[serde(deserialize_with = "id_string")]
    pub target: String,
}

impl Edge {
    #[allow(missing_docs)]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawParams {
    #[serde(default, alias = "ot2_actions")]
    robot_actions: Vec<Value>,
    #[serde(default, alias = "xarm_actions")]
    arm_actions: Vec<Value>,
    #[serde(default, alias = "arduino_control")]
    peripheral_control: JsonMap,
    #[serde(default)]
    parameters: JsonMap,
    #[serde(flatten)]
    extra: JsonMap,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    label: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    params: RawParams,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    global_config: GlobalConfig,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

/// Measurement a node requests after its hardware actions.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    #[allow(missing_docs)]
    pub technique: Technique,
    /// Raw parameters in canonical names, unit suffixes still attached
    pub parameters: JsonMap,
}

/// One step of a workflow.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub label: String,
    /// Free-form node type; a technique name makes this a measurement node
    pub kind: String,
    #[allow(missing_docs)]
    pub robot_actions: Vec<RobotAction>,
    #[allow(missing_docs)]
    pub arm_actions: Vec<ArmAction>,
    /// Board commands run as one batch after the motion steps
    pub peripheral: Vec<PeripheralCommand>,
    #[allow(missing_docs)]
    pub measurement: Option<Measurement>,
}

impl Node {
    /// Node with no actions.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: String::new(),
            robot_actions: Vec::new(),
            arm_actions: Vec::new(),
            peripheral: Vec::new(),
            measurement: None,
        }
    }
}

/// A loaded workflow.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Workflow {
    #[allow(missing_docs)]
    pub global: GlobalConfig,
    #[allow(missing_docs)]
    pub nodes: Vec<Node>,
    #[allow(missing_docs)]
    pub edges: Vec<Edge>,
}

/// Flat measurement keys from older workflow files: key, canonical name, unit.
const LEGACY_MEASUREMENT_KEYS: [(&str, &str, &str); 10] = [
    ("duration_s", "duration", "s"),
    ("sample_rate", "sample_interval", "s"),
    ("current_mA", "current", "mA"),
    ("start_voltage_V", "start_voltage", "V"),
    ("end_voltage_V", "end_voltage", "V"),
    ("scan_rate_mV_s", "scan_rate", "mV/s"),
    ("cycles", "cycles", ""),
    ("start_freq_Hz", "frequency_start", "Hz"),
    ("end_freq_Hz", "frequency_end", "Hz"),
    ("amplitude_mV", "ac_amplitude", "mV"),
];

/// Attaches `unit` to bare numbers so the normalizer converts them.
fn with_unit(value: &Value, unit: &str) -> Value {
    if unit.is_empty() {
        return value.clone();
    }
    match value {
        Value::Number(n) => Value::String(format!("{n}{unit}")),
        Value::String(s) if s.trim().parse::<f64>().is_ok() => {
            Value::String(format!("{}{unit}", s.trim()))
        }
        other => other.clone(),
    }
}

/// Measurement parameters of a node: `params.parameters` first, legacy flat
/// keys filling whatever it leaves out.
fn measurement_parameters(params: &RawParams) -> JsonMap {
    let mut parameters = params.parameters.clone();
    for (legacy, canonical, unit) in LEGACY_MEASUREMENT_KEYS {
        if parameters.contains_key(canonical) {
            continue;
        }
        if let Some(value) = params.extra.get(legacy) {
            parameters.insert(canonical.to_string(), with_unit(value, unit));
        }
    }
    parameters
}

fn parse_actions<A: DeserializeOwned>(
    node_id: &str,
    device: &str,
    names: &[&str],
    raw: &[Value],
) -> AppResult<Vec<A>> {
    let mut actions = Vec::with_capacity(raw.len());
    for value in raw {
        let name = value.get("action").and_then(Value::as_str).unwrap_or("");
        if !names.contains(&name) {
            error!(node = %node_id, action = %name, "Unknown {device} action type, skipping");
            continue;
        }
        let action = serde_json::from_value(value.clone()).map_err(|e| {
            EchemError::InvalidWorkflow(format!("node '{node_id}': malformed {name} action: {e}"))
        })?;
        actions.push(action);
    }
    Ok(actions)
}

impl Node {
    fn from_raw(raw: RawNode) -> AppResult<Self> {
        let id = raw.id;
        let robot_actions =
            parse_actions(&id, "robot", &RobotAction::NAMES, &raw.params.robot_actions)?;
        let arm_actions = parse_actions(&id, "arm", &ArmAction::NAMES, &raw.params.arm_actions)?;
        let peripheral = parse_peripheral_block(&raw.params.peripheral_control)
            .map_err(|e| EchemError::InvalidWorkflow(format!("node '{id}': {e}")))?;

        let measurement = match raw.kind.parse::<Technique>() {
            Ok(technique) => Some(Measurement {
                technique,
                parameters: measurement_parameters(&raw.params),
            }),
            Err(_) => {
                if !raw.kind.is_empty() {
                    debug!(node = %id, kind = %raw.kind, "Node type is not a technique");
                }
                None
            }
        };

        Ok(Self {
            id,
            label: raw.label,
            kind: raw.kind,
            robot_actions,
            arm_actions,
            peripheral,
            measurement,
        })
    }
}

impl Workflow {
    /// Builds a workflow from a parsed JSON document.
    pub fn from_value(value: Value) -> AppResult<Self> {
        let raw: RawDocument = serde_json::from_value(value)
            .map_err(|e| EchemError::InvalidWorkflow(e.to_string()))?;
        let nodes = raw
            .nodes
            .into_iter()
            .map(Node::from_raw)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            global: raw.global_config,
            nodes,
            edges: raw.edges,
        })
    }

    /// Parses a workflow from JSON text.
    pub fn from_json(text: &str) -> AppResult<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Reads and parses a workflow file.
    pub async fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&text)
    }

    /// Node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// `(node id, labware name)` for robot actions naming labware that
    /// `global_config.labware` does not declare.
    pub fn undeclared_labware(&self) -> Vec<(&str, &str)> {
        let declared = &self.global.labware;
        self.nodes
            .iter()
            .flat_map(|node| {
                node.robot_actions
                    .iter()
                    .filter_map(RobotAction::labware)
                    .filter(move |name| !declared.contains_key(*name))
                    .map(move |name| (node.id.as_str(), name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_undeclared_labware() {
        let workflow = Workflow::from_value(json!({
            "global_config": {"labware": {"tips": {"type": "opentrons_96_tiprack_300ul", "slot": 10}}},
            "nodes": [
                {"id": "a", "params": {"robot_actions": [
                    {"action": "pick_up_tip", "labware": "tips", "well": "A1"},
                    {"action": "home"}
                ]}},
                {"id": "b", "params": {"robot_actions": [
                    {"action": "move_to", "labware": "beaker", "well": "A1"},
                    {"action": "drop_tip", "labware": "trash", "well": "A1"}
                ]}}
            ]
        }))
        .unwrap();
        assert_eq!(
            workflow.undeclared_labware(),
            vec![("b", "beaker"), ("b", "trash")]
        );
    }

    #[test]
    fn test_legacy_keys() {
        let workflow = Workflow::from_value(json!({
            "global_config": {
                "labware": {"tips": {"type": "opentrons_96_tiprack_300ul", "slot": 10}},
                "hardware": {"ot2": {"ip": "10.0.0.2"}, "xarm": {"ip": "10.0.0.3"}}
            },
            "nodes": [{
                "id": 1,
                "type": "OCV",
                "params": {
                    "duration_s": 5,
                    "sample_rate": 1,
                    "arduino_control": {"base0_temp": 25.0},
                    "ot2_actions": [{"action": "home", "labware": "robot", "well": "home"}],
                    "xarm_actions": [{"action": "set_gripper_position", "pos": 200}]
                }
            }],
            "edges": []
        }))
        .unwrap();

        let robot = workflow.global.hardware.robot.as_ref().unwrap();
        assert_eq!(robot.ip.as_deref(), Some("10.0.0.2"));
        let node = workflow.node("1").unwrap();
        assert_eq!(node.robot_actions, vec![RobotAction::Home]);
        assert_eq!(node.arm_actions[0].name(), "set_gripper_position");
        assert_eq!(node.peripheral.len(), 1);

        let measurement = node.measurement.as_ref().unwrap();
        assert_eq!(measurement.technique, Technique::Ocv);
        assert_eq!(measurement.parameters["duration"], json!("5s"));
        assert_eq!(measurement.parameters["sample_interval"], json!("1s"));
    }

    #[test]
    #[traced_test]
    fn test_unknown_action_dropped() {
        let workflow = Workflow::from_value(json!({
            "nodes": [{"id": "a", "params": {"robot_actions": [
                {"action": "aspirate", "labware": "vial", "well": "A1"},
                {"action": "move_to", "labware": "vial", "well": "A1", "offset": {"z": 20}}
            ]}}]
        }))
        .unwrap();
        let node = workflow.node("a").unwrap();
        assert_eq!(node.robot_actions.len(), 1);
        match &node.robot_actions[0] {
            RobotAction::MoveTo { offset, speed, .. } => {
                assert_eq!(offset.z, 20.0);
                assert_eq!(*speed, 100.0);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(node.measurement.is_none());
        assert!(logs_contain("Unknown robot action type, skipping"));
    }

    #[test]
    fn test_malformed_known_action_rejected() {
        let err = Workflow::from_value(json!({
            "nodes": [{"id": "a", "params": {"arm_actions": [
                {"action": "set_position", "pose": [1, 2, 3]}
            ]}}]
        }))
        .unwrap_err();
        assert!(matches!(err, EchemError::InvalidWorkflow(_)));
        assert!(err.to_string().contains("set_position"));
    }

    #[test]
    fn test_explicit_parameters_win_over_legacy() {
        let workflow = Workflow::from_value(json!({
            "nodes": [{"id": "m", "type": "cp", "params": {
                "parameters": {"current": "2mA"},
                "current_mA": 5,
                "duration_s": "30"
            }}]
        }))
        .unwrap();
        let parameters = &workflow.node("m").unwrap().measurement.as_ref().unwrap().parameters;
        assert_eq!(parameters["current"], json!("2mA"));
        assert_eq!(parameters["duration"], json!("30s"));
    }

    #[test]
    fn test_wash_block() {
        let workflow = Workflow::from_value(json!({
            "nodes": [{"id": "w", "params": {"robot_actions": [
                {"action": "wash", "arduino_actions": {"pump0_ml": 2.0, "ultrasonic0_ms": 300}}
            ]}}]
        }))
        .unwrap();
        match &workflow.node("w").unwrap().robot_actions[0] {
            RobotAction::Wash { peripheral_control } => assert_eq!(peripheral_control.len(), 2),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_servo_defaults() {
        let action: ArmAction = serde_json::from_value(json!({
            "action": "set_servo_angle", "angles": [0.1, 0.2, 0.3, 0.4, 0.5, 0.6]
        }))
        .unwrap();
        let motion = action.servo_motion().unwrap();
        assert_eq!(motion.speed, 100.0);
        assert_eq!(motion.acc, 500.0);
        assert!(motion.relative);
        assert!(action.pose_motion().is_none());
    }
}
