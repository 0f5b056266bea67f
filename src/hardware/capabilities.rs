//! Capability traits for the devices a workflow drives.
//!
//! Each trait is the narrow surface the executor and the backends need from an
//! external client library. Implementations live outside this crate except for
//! the in-process mocks in [`crate::hardware::mock`].

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Offset from a well's reference point, in millimetres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    #[serde(default)]
    #[allow(missing_docs)]
    pub x: f64,
    #[serde(default)]
    #[allow(missing_docs)]
    pub y: f64,
    #[serde(default)]
    #[allow(missing_docs)]
    pub z: f64,
}

/// Reference point inside a well that an offset is measured from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum WellOrigin {
    Top,
    Bottom,
    Center,
}

/// Liquid-handling robot.
#[async_trait]
pub trait RobotClient: Send + Sync {
    /// Deck lights on or off.
    async fn set_lights(&self, on: bool) -> AppResult<()>;

    /// Moves every axis to its home position.
    async fn home(&self) -> AppResult<()>;

    /// Loads a stock labware definition into `slot`, returning the robot's id for it.
    async fn load_labware(&self, slot: u8, load_name: &str) -> AppResult<String>;

    /// Loads a custom labware definition into `slot`.
    async fn load_custom_labware(&self, slot: u8, definition: &Value) -> AppResult<String>;

    /// Attaches a pipette model to a mount (`left` or `right`).
    async fn load_pipette(&self, model: &str, mount: &str) -> AppResult<()>;

    /// Moves the pipette to a well.
    async fn move_to_well(
        &self,
        labware_id: &str,
        well: &str,
        origin: WellOrigin,
        offset: Offset,
        speed: f64,
    ) -> AppResult<()>;

    /// Picks up a tip at the current well.
    async fn pick_up_tip(&self, labware_id: &str, well: &str, offset: Offset) -> AppResult<()>;

    /// Drops the tip into a well.
    async fn drop_tip(
        &self,
        labware_id: &str,
        well: &str,
        origin: WellOrigin,
        offset: Offset,
    ) -> AppResult<()>;
}

/// Joint-space motion request for the arm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServoMotion {
    /// Joint angles in radians
    pub angles: Vec<f64>,
    #[allow(missing_docs)]
    pub speed: f64,
    #[allow(missing_docs)]
    pub acc: f64,
    #[allow(missing_docs)]
    pub mvtime: f64,
    /// Angles are relative to the current pose
    pub relative: bool,
}

/// Cartesian motion request for the arm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseMotion {
    /// x, y, z, roll, pitch, yaw
    pub pose: [f64; 6],
    #[allow(missing_docs)]
    pub speed: f64,
    #[allow(missing_docs)]
    pub acc: f64,
    #[allow(missing_docs)]
    pub mvtime: f64,
}

/// Articulated arm with a parallel gripper.
#[async_trait]
pub trait ArmClient: Send + Sync {
    #[allow(missing_docs)]
    async fn set_servo_angle(&self, motion: &ServoMotion) -> AppResult<()>;

    #[allow(missing_docs)]
    async fn set_position(&self, motion: &PoseMotion) -> AppResult<()>;

    /// Gripper opening in device units (0 closed, 850 fully open).
    async fn set_gripper_position(&self, position: f64) -> AppResult<()>;
}

/// Microcontroller board driving heaters, pumps and ultrasonic baths.
#[async_trait]
pub trait PeripheralBoard: Send + Sync {
    #[allow(missing_docs)]
    async fn set_temperature(&self, channel: u8, celsius: f64) -> AppResult<()>;

    #[allow(missing_docs)]
    async fn dispense(&self, channel: u8, ml: f64) -> AppResult<()>;

    /// Runs the ultrasonic transducer on `channel` for `ms` milliseconds.
    async fn run_timer(&self, channel: u8, ms: u64) -> AppResult<()>;
}

/// Simulated device the twin mirrors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum TwinDevice {
    Robot,
    Arm,
}

/// Named joint positions for the twin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointTarget {
    #[allow(missing_docs)]
    pub names: Vec<String>,
    #[allow(missing_docs)]
    pub positions: Vec<f64>,
}

impl JointTarget {
    /// Pairs joint names with positions.
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>, positions: Vec<f64>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            positions,
        }
    }
}

/// Publish side of the simulation channel.
///
/// Verdicts come back on the safety channel, see
/// [`crate::workflow::safety::SafetyPublisher`].
#[async_trait]
pub trait DigitalTwin: Send + Sync {
    /// Asks the twin to move `device` to `target`.
    async fn publish_joint_target(&self, device: TwinDevice, target: &JointTarget)
        -> AppResult<()>;

    /// Names the labware the device is carrying or approaching; empty clears it.
    async fn publish_target_asset(&self, device: TwinDevice, asset: &str) -> AppResult<()>;
}
