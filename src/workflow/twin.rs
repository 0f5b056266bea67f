//! Digital-twin joint targets.
//!
//! The twin is driven in joint space. Robot well moves become three prismatic
//! joint positions:
//!
//! ```text
//! x = (slot_x + offset_x + well_x) / 150 - 0.08
//! y = (slot_y + offset_y + well_y) / 150 - 0.08
//! z = -((offset_z + well_z) / 150 - 0.08)
//! ```
//!
//! Arm servo moves pass their angles through with a trailing relative flag,
//! and gripper moves publish `pos / 1000` to both fingers.

use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::{JointTarget, Offset, ServoMotion};
use crate::workflow::labware::slot_origin;

/// Prismatic joints of the robot model.
pub const ROBOT_JOINTS: [&str; 3] = [
    "PrismaticJointMiddleBar",
    "PrismaticJointPipetteHolder",
    "PrismaticJointRightPipette",
];

/// Finger joints of the arm's gripper.
pub const GRIPPER_JOINTS: [&str; 2] = ["left_finger", "right_finger"];

/// Name of the trailing flag on servo targets.
pub const RELATIVE_FLAG: &str = "relative";

const SCALE: f64 = 150.0;
const BIAS: f64 = 0.08;
const GRIPPER_SCALE: f64 = 1000.0;

/// Gripper opening assumed before the first gripper move.
pub const INITIAL_GRIPPER_POSITION: f64 = 500.0;

/// Robot target for a well, given the labware slot and well centre.
pub fn robot_well_target(slot: u8, well: (f64, f64, f64), offset: Offset) -> AppResult<JointTarget> {
    let (slot_x, slot_y) = slot_origin(slot).ok_or_else(|| {
        EchemError::InvalidWorkflow(format!("slot {slot} is not a deck slot"))
    })?;
    let (well_x, well_y, well_z) = well;
    let positions = vec![
        (slot_x + offset.x + well_x) / SCALE - BIAS,
        (slot_y + offset.y + well_y) / SCALE - BIAS,
        -((offset.z + well_z) / SCALE - BIAS),
    ];
    Ok(JointTarget::new(ROBOT_JOINTS, positions))
}

/// Robot target for the home position.
pub fn robot_home_target() -> JointTarget {
    JointTarget::new(ROBOT_JOINTS, vec![-BIAS, -BIAS, BIAS])
}

/// Arm target for a joint-space move: `joint1..jointN` plus the relative flag.
pub fn servo_target(motion: &ServoMotion) -> JointTarget {
    let mut names: Vec<String> = (1..=motion.angles.len())
        .map(|i| format!("joint{i}"))
        .collect();
    names.push(RELATIVE_FLAG.to_string());
    let mut positions = motion.angles.clone();
    positions.push(if motion.relative { 1.0 } else { 0.0 });
    JointTarget::new(names, positions)
}

/// Remembers the last gripper opening to tell grabbing from releasing.
#[derive(Clone, Debug)]
pub struct GripperTracker {
    previous: f64,
}

impl Default for GripperTracker {
    fn default() -> Self {
        Self {
            previous: INITIAL_GRIPPER_POSITION,
        }
    }
}

impl GripperTracker {
    /// Finger target and target asset for a move to `position`.
    ///
    /// Opening releases, so the asset is cleared; closing announces `labware`.
    pub fn update(&mut self, position: f64, labware: &str) -> (JointTarget, String) {
        let opening = position > self.previous;
        self.previous = position;
        let finger = position / GRIPPER_SCALE;
        let asset = if opening {
            String::new()
        } else {
            labware.to_string()
        };
        (JointTarget::new(GRIPPER_JOINTS, vec![finger, finger]), asset)
    }

    #[allow(missing_docs)]
    pub fn previous(&self) -> f64 {
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_well_target() {
        let offset = Offset {
            x: 0.0,
            y: 0.0,
            z: 20.0,
        };
        let target = robot_well_target(5, (15.0, 30.0, 10.0), offset).unwrap();
        assert_eq!(target.names, ROBOT_JOINTS.map(String::from).to_vec());
        assert!(close(target.positions[0], (0.13 + 15.0) / 150.0 - 0.08));
        assert!(close(target.positions[1], (0.09 + 30.0) / 150.0 - 0.08));
        assert!(close(target.positions[2], -(30.0 / 150.0 - 0.08)));
    }

    #[test]
    fn test_bad_slot() {
        assert!(robot_well_target(0, (0.0, 0.0, 0.0), Offset::default()).is_err());
    }

    #[test]
    fn test_servo_target_appends_flag() {
        let motion = ServoMotion {
            angles: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            speed: 100.0,
            acc: 500.0,
            mvtime: 0.0,
            relative: false,
        };
        let target = servo_target(&motion);
        assert_eq!(target.names.len(), 7);
        assert_eq!(target.names[0], "joint1");
        assert_eq!(target.names[6], RELATIVE_FLAG);
        assert_eq!(target.positions[6], 0.0);
    }

    #[test]
    fn test_gripper_grab_then_release() {
        let mut gripper = GripperTracker::default();
        let (target, asset) = gripper.update(200.0, "vial");
        assert_eq!(asset, "vial");
        assert_eq!(target.positions, vec![0.2, 0.2]);

        let (_, asset) = gripper.update(800.0, "vial");
        assert!(asset.is_empty());
        assert_eq!(gripper.previous(), 800.0);
    }
}
