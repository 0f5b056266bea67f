//! Mock Hardware Implementations
//!
//! In-process stand-ins for the robot, the arm, the peripheral board, the
//! digital twin and the potentiostat link. Every mock records the calls it
//! receives so tests can assert on ordering, and each can be told to fail.
//! The binary wires the same mocks when no device clients are configured.
//!
//! # Available Mocks
//!
//! - `MockRobot` - liquid-handling robot, optional per-labware load failures
//! - `MockArm` - articulated arm with gripper
//! - `MockBoard` - peripheral board, optional per-channel failures
//! - `MockTwin` - digital twin that can answer on the safety channel
//! - `SimulatedBench` - potentiostat link used by the technique backends

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backends::DeviceConnector;
use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::{
    ArmClient, DigitalTwin, JointTarget, Offset, PeripheralBoard, PoseMotion, RobotClient,
    ServoMotion, TwinDevice, WellOrigin,
};
use crate::workflow::safety::{SafetyPublisher, SafetyState};

// =============================================================================
// MockRobot - Liquid-handling robot
// =============================================================================

/// Call received by [`MockRobot`].
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum RobotCall {
    SetLights(bool),
    Home,
    LoadLabware { slot: u8, load_name: String },
    LoadCustomLabware { slot: u8, name: String },
    LoadPipette { model: String, mount: String },
    MoveToWell {
        labware_id: String,
        well: String,
        origin: WellOrigin,
        offset: Offset,
    },
    PickUpTip { labware_id: String, well: String },
    DropTip { labware_id: String, well: String },
}

/// Mock liquid-handling robot.
///
/// Labware ids are `{load_name}@{slot}` so tests can tell them apart from the
/// executor's fallback ids.
#[derive(Default)]
pub struct MockRobot {
    calls: RwLock<Vec<RobotCall>>,
    failing_labware: RwLock<HashSet<String>>,
    fail_pipette: AtomicBool,
    fail_motion: AtomicBool,
}

impl MockRobot {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes loading `load_name` fail.
    pub async fn fail_labware(&self, load_name: &str) {
        self.failing_labware
            .write()
            .await
            .insert(load_name.to_string());
    }

    /// Makes `load_pipette` fail.
    pub fn fail_pipette(&self) {
        self.fail_pipette.store(true, Ordering::SeqCst);
    }

    /// Makes every motion command fail.
    pub fn fail_motion(&self) {
        self.fail_motion.store(true, Ordering::SeqCst);
    }

    /// Calls received so far, in order.
    pub async fn calls(&self) -> Vec<RobotCall> {
        self.calls.read().await.clone()
    }

    async fn record(&self, call: RobotCall) {
        debug!(?call, "MockRobot");
        self.calls.write().await.push(call);
    }

    fn check_motion(&self) -> AppResult<()> {
        if self.fail_motion.load(Ordering::SeqCst) {
            Err(EchemError::Device("robot motion fault".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RobotClient for MockRobot {
    async fn set_lights(&self, on: bool) -> AppResult<()> {
        self.record(RobotCall::SetLights(on)).await;
        Ok(())
    }

    async fn home(&self) -> AppResult<()> {
        self.check_motion()?;
        self.record(RobotCall::Home).await;
        Ok(())
    }

    async fn load_labware(&self, slot: u8, load_name: &str) -> AppResult<String> {
        if self.failing_labware.read().await.contains(load_name) {
            return Err(EchemError::Device(format!(
                "labware {load_name} rejected by robot"
            )));
        }
        self.record(RobotCall::LoadLabware {
            slot,
            load_name: load_name.to_string(),
        })
        .await;
        Ok(format!("{load_name}@{slot}"))
    }

    async fn load_custom_labware(&self, slot: u8, definition: &Value) -> AppResult<String> {
        let name = definition
            .pointer("/parameters/loadName")
            .or_else(|| definition.pointer("/metadata/name"))
            .and_then(Value::as_str)
            .unwrap_or("custom_labware")
            .to_string();
        if self.failing_labware.read().await.contains(&name) {
            return Err(EchemError::Device(format!("labware {name} rejected by robot")));
        }
        self.record(RobotCall::LoadCustomLabware {
            slot,
            name: name.clone(),
        })
        .await;
        Ok(format!("{name}@{slot}"))
    }

    async fn load_pipette(&self, model: &str, mount: &str) -> AppResult<()> {
        if self.fail_pipette.load(Ordering::SeqCst) {
            return Err(EchemError::Device(format!("pipette {model} not detected")));
        }
        self.record(RobotCall::LoadPipette {
            model: model.to_string(),
            mount: mount.to_string(),
        })
        .await;
        Ok(())
    }

    async fn move_to_well(
        &self,
        labware_id: &str,
        well: &str,
        origin: WellOrigin,
        offset: Offset,
        _speed: f64,
    ) -> AppResult<()> {
        self.check_motion()?;
        self.record(RobotCall::MoveToWell {
            labware_id: labware_id.to_string(),
            well: well.to_string(),
            origin,
            offset,
        })
        .await;
        Ok(())
    }

    async fn pick_up_tip(&self, labware_id: &str, well: &str, _offset: Offset) -> AppResult<()> {
        self.check_motion()?;
        self.record(RobotCall::PickUpTip {
            labware_id: labware_id.to_string(),
            well: well.to_string(),
        })
        .await;
        Ok(())
    }

    async fn drop_tip(
        &self,
        labware_id: &str,
        well: &str,
        _origin: WellOrigin,
        _offset: Offset,
    ) -> AppResult<()> {
        self.check_motion()?;
        self.record(RobotCall::DropTip {
            labware_id: labware_id.to_string(),
            well: well.to_string(),
        })
        .await;
        Ok(())
    }
}

// =============================================================================
// MockArm - Articulated arm
// =============================================================================

/// Call received by [`MockArm`].
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum ArmCall {
    Servo(ServoMotion),
    Position(PoseMotion),
    Gripper(f64),
}

/// Mock arm.
#[derive(Default)]
pub struct MockArm {
    calls: RwLock<Vec<ArmCall>>,
}

impl MockArm {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far, in order.
    pub async fn calls(&self) -> Vec<ArmCall> {
        self.calls.read().await.clone()
    }

    async fn record(&self, call: ArmCall) {
        debug!(?call, "MockArm");
        self.calls.write().await.push(call);
    }
}

#[async_trait]
impl ArmClient for MockArm {
    async fn set_servo_angle(&self, motion: &ServoMotion) -> AppResult<()> {
        self.record(ArmCall::Servo(motion.clone())).await;
        Ok(())
    }

    async fn set_position(&self, motion: &PoseMotion) -> AppResult<()> {
        self.record(ArmCall::Position(motion.clone())).await;
        Ok(())
    }

    async fn set_gripper_position(&self, position: f64) -> AppResult<()> {
        self.record(ArmCall::Gripper(position)).await;
        Ok(())
    }
}

// =============================================================================
// MockBoard - Peripheral board
// =============================================================================

/// Call accepted by [`MockBoard`].
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum BoardCall {
    SetTemperature { channel: u8, celsius: f64 },
    Dispense { channel: u8, ml: f64 },
    RunTimer { channel: u8, ms: u64 },
}

/// Mock peripheral board. Calls on a failing channel are rejected and not recorded.
#[derive(Default)]
pub struct MockBoard {
    calls: RwLock<Vec<BoardCall>>,
    failing_channels: RwLock<HashSet<u8>>,
}

impl MockBoard {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every command on `channel` fail.
    pub async fn fail_channel(&self, channel: u8) {
        self.failing_channels.write().await.insert(channel);
    }

    /// Accepted calls so far, in order.
    pub async fn calls(&self) -> Vec<BoardCall> {
        self.calls.read().await.clone()
    }

    async fn accept(&self, channel: u8, call: BoardCall) -> AppResult<()> {
        if self.failing_channels.read().await.contains(&channel) {
            return Err(EchemError::Device(format!(
                "peripheral channel {channel} not responding"
            )));
        }
        debug!(?call, "MockBoard");
        self.calls.write().await.push(call);
        Ok(())
    }
}

#[async_trait]
impl PeripheralBoard for MockBoard {
    async fn set_temperature(&self, channel: u8, celsius: f64) -> AppResult<()> {
        self.accept(channel, BoardCall::SetTemperature { channel, celsius })
            .await
    }

    async fn dispense(&self, channel: u8, ml: f64) -> AppResult<()> {
        self.accept(channel, BoardCall::Dispense { channel, ml }).await
    }

    async fn run_timer(&self, channel: u8, ms: u64) -> AppResult<()> {
        self.accept(channel, BoardCall::RunTimer { channel, ms }).await
    }
}

// =============================================================================
// MockTwin - Digital twin
// =============================================================================

/// Message published to [`MockTwin`].
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum TwinCall {
    Joint {
        device: TwinDevice,
        target: JointTarget,
    },
    Asset {
        device: TwinDevice,
        asset: String,
    },
}

/// Mock digital twin.
///
/// When built with a publisher, every joint target is answered on the safety
/// channel: scripted verdicts first, then the fallback verdict. A silent twin
/// never answers.
pub struct MockTwin {
    calls: RwLock<Vec<TwinCall>>,
    observer: Option<SafetyPublisher>,
    script: RwLock<VecDeque<SafetyState>>,
    fallback: SafetyState,
}

impl MockTwin {
    /// Twin whose observer always answers `verdict`.
    pub fn responding(observer: SafetyPublisher, verdict: SafetyState) -> Self {
        Self {
            calls: RwLock::new(Vec::new()),
            observer: Some(observer),
            script: RwLock::new(VecDeque::new()),
            fallback: verdict,
        }
    }

    /// Twin whose observer never answers.
    pub fn silent() -> Self {
        Self {
            calls: RwLock::new(Vec::new()),
            observer: None,
            script: RwLock::new(VecDeque::new()),
            fallback: SafetyState::Hold,
        }
    }

    /// Queues verdicts for the next joint targets.
    pub async fn script(&self, verdicts: impl IntoIterator<Item = SafetyState>) {
        self.script.write().await.extend(verdicts);
    }

    /// Messages published so far, in order.
    pub async fn calls(&self) -> Vec<TwinCall> {
        self.calls.read().await.clone()
    }

    /// Joint targets published for `device`.
    pub async fn joint_targets(&self, device: TwinDevice) -> Vec<JointTarget> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                TwinCall::Joint { device: d, target } if *d == device => Some(target.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DigitalTwin for MockTwin {
    async fn publish_joint_target(
        &self,
        device: TwinDevice,
        target: &JointTarget,
    ) -> AppResult<()> {
        debug!(?device, ?target, "MockTwin joint target");
        self.calls.write().await.push(TwinCall::Joint {
            device,
            target: target.clone(),
        });
        if let Some(observer) = &self.observer {
            let verdict = self
                .script
                .write()
                .await
                .pop_front()
                .unwrap_or(self.fallback);
            if verdict != SafetyState::Hold {
                observer.publish(verdict);
            }
        }
        Ok(())
    }

    async fn publish_target_asset(&self, device: TwinDevice, asset: &str) -> AppResult<()> {
        self.calls.write().await.push(TwinCall::Asset {
            device,
            asset: asset.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// SimulatedBench - Potentiostat link
// =============================================================================

/// Device link used by the simulated technique backends.
pub struct SimulatedBench {
    reachable: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    board: Arc<MockBoard>,
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBench {
    /// Reachable bench with its own peripheral board.
    pub fn new() -> Self {
        Self::with_board(Arc::new(MockBoard::new()))
    }

    /// Reachable bench sharing `board`.
    pub fn with_board(board: Arc<MockBoard>) -> Self {
        Self {
            reachable: AtomicBool::new(true),
            fail_disconnect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            board,
        }
    }

    /// Bench whose every connection attempt fails.
    pub fn unreachable() -> Self {
        let bench = Self::new();
        bench.set_reachable(false);
        bench
    }

    #[allow(missing_docs)]
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes `disconnect` report an error.
    pub fn fail_disconnect(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Disconnect calls so far.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Board handed to connected sessions.
    pub fn mock_board(&self) -> Arc<MockBoard> {
        Arc::clone(&self.board)
    }
}

#[async_trait]
impl DeviceConnector for SimulatedBench {
    async fn connect(&self) -> AppResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EchemError::Connection("potentiostat not reachable".to_string()))
        }
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            Err(EchemError::Device("potentiostat did not release".to_string()))
        } else {
            Ok(())
        }
    }

    fn board(&self) -> Option<Arc<dyn PeripheralBoard>> {
        Some(Arc::clone(&self.board) as Arc<dyn PeripheralBoard>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::safety::safety_channel;

    #[tokio::test]
    async fn test_robot_labware_ids() {
        let robot = MockRobot::new();
        let id = robot.load_labware(3, "opentrons_96_tiprack").await.unwrap();
        assert_eq!(id, "opentrons_96_tiprack@3");

        robot.fail_labware("opentrons_96_tiprack").await;
        assert!(robot.load_labware(3, "opentrons_96_tiprack").await.is_err());
        assert_eq!(robot.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_twin_script_then_fallback() {
        let (publisher, _sync) = safety_channel();
        let twin = MockTwin::responding(publisher.clone(), SafetyState::Continue);
        twin.script([SafetyState::Abort]).await;
        let target = JointTarget::new(["j"], vec![0.0]);

        twin.publish_joint_target(TwinDevice::Arm, &target)
            .await
            .unwrap();
        assert_eq!(publisher.current(), SafetyState::Abort);

        twin.publish_joint_target(TwinDevice::Arm, &target)
            .await
            .unwrap();
        assert_eq!(publisher.current(), SafetyState::Continue);
        assert_eq!(twin.joint_targets(TwinDevice::Arm).await.len(), 2);
    }

    #[tokio::test]
    async fn test_bench_counts() {
        let bench = SimulatedBench::unreachable();
        assert!(bench.connect().await.is_err());
        bench.set_reachable(true);
        assert!(bench.connect().await.is_ok());
        assert_eq!(bench.connect_count(), 2);
        assert!(bench.board().is_some());
    }
}
