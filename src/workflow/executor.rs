//! Workflow graph executor.
//!
//! ```text
//! setup:    labware -> pipette -> lights on -> home
//! per node: robot actions -> arm actions -> peripheral batch -> measurement
//! ```
//!
//! Every robot and arm action outside the bootstrap node is first sent to
//! the digital twin. The executor then waits on the safety channel:
//!
//! ```text
//! hold() ─> publish target ─> await_verdict
//!                               ├─ CONTINUE ─> commit per TwinPolicy
//!                               ├─ ABORT    ─> stop the run
//!                               └─ timeout  ─> stop the run
//! ```
//!
//! Under [`TwinPolicy::SimulationOnly`] a confirmed twin move stands in for
//! the real one; [`TwinPolicy::CommitAfterConfirm`] issues the real move after
//! the twin confirms it. `wash` and Cartesian arm moves have no twin model and
//! go straight to hardware.

use crate::config::{SafetyConfig, TwinPolicy};
use crate::core::{ErrorKind, ExperimentResult, JsonMap, UnitOperation};
use crate::dispatcher::ExperimentDispatcher;
use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::{
    ArmClient, DigitalTwin, JointTarget, PeripheralBoard, RobotClient, TwinDevice, WellOrigin,
};
use crate::hardware::peripheral::{execute_batch, PeripheralCommand};
use crate::workflow::document::{ArmAction, GlobalConfig, Measurement, Node, RobotAction, Workflow};
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::labware::LabwareRegistry;
use crate::workflow::safety::SafetySynchronizer;
use crate::workflow::twin::{robot_home_target, robot_well_target, servo_target, GripperTracker};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Speed used for the approach move before a tip pick-up or drop.
const TIP_APPROACH_SPEED: f64 = 100.0;

/// Device clients a workflow drives.
#[derive(Clone)]
pub struct Devices {
    #[allow(missing_docs)]
    pub robot: Arc<dyn RobotClient>,
    #[allow(missing_docs)]
    pub arm: Arc<dyn ArmClient>,
    /// Optional; commands for a missing board are skipped with a warning
    pub board: Option<Arc<dyn PeripheralBoard>>,
    #[allow(missing_docs)]
    pub twin: Arc<dyn DigitalTwin>,
}

/// One failure recorded during a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeFailure {
    /// Node the failure happened in; `None` during load and setup
    pub node: Option<String>,
    /// Action or phase that failed
    pub action: Option<String>,
    #[allow(missing_docs)]
    pub kind: ErrorKind,
    #[allow(missing_docs)]
    pub message: String,
    /// True when the failure marks the run as failed
    pub escalated: bool,
}

/// Outcome of a workflow run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkflowReport {
    /// True when no failure escalated and the run was not stopped
    pub success: bool,
    /// Nodes that ran to completion, in execution order
    pub visited: Vec<String>,
    #[allow(missing_docs)]
    pub failures: Vec<NodeFailure>,
    /// Results of measurement nodes, failed ones included
    pub measurements: Vec<ExperimentResult>,
    /// Why the run stopped early, if it did
    pub halted: Option<String>,
}

impl WorkflowReport {
    fn record(&mut self, node: Option<&str>, action: Option<&str>, err: &EchemError) {
        self.failures.push(NodeFailure {
            node: node.map(str::to_string),
            action: action.map(str::to_string),
            kind: err.kind(),
            message: err.to_string(),
            escalated: err.is_escalating(),
        });
    }

    fn halt(&mut self, node: Option<&str>, action: Option<&str>, err: &EchemError) {
        self.record(node, action, err);
        self.halted = Some(err.to_string());
    }

    fn finish(mut self) -> Self {
        self.success = self.halted.is_none() && !self.failures.iter().any(|f| f.escalated);
        self
    }
}

/// Executes workflow graphs against a set of devices.
pub struct WorkflowExecutor {
    devices: Devices,
    dispatcher: Option<Arc<ExperimentDispatcher>>,
    safety: SafetySynchronizer,
    config: SafetyConfig,
    labware_dir: PathBuf,
    cancel: CancellationToken,
    labware: LabwareRegistry,
    gripper: GripperTracker,
}

impl WorkflowExecutor {
    /// Executor with default safety settings and no measurement dispatcher.
    pub fn new(devices: Devices, safety: SafetySynchronizer) -> Self {
        Self {
            devices,
            dispatcher: None,
            safety,
            config: SafetyConfig::default(),
            labware_dir: PathBuf::from("labware"),
            cancel: CancellationToken::new(),
            labware: LabwareRegistry::default(),
            gripper: GripperTracker::default(),
        }
    }

    /// Applies the handshake settings, poll interval and timeout included.
    pub fn with_safety_config(mut self, config: SafetyConfig) -> Self {
        self.safety = self.safety.configure(&config);
        self.config = config;
        self
    }

    /// Dispatcher used for measurement nodes.
    pub fn with_dispatcher(mut self, dispatcher: Arc<ExperimentDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Directory holding custom labware definitions.
    pub fn with_labware_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.labware_dir = dir.into();
        self
    }

    /// Uses `cancel` to stop runs from outside.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the current run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Labware loaded by the most recent run.
    pub fn labware(&self) -> &LabwareRegistry {
        &self.labware
    }

    /// Runs a workflow; `true` only when nothing escalated.
    pub async fn execute_workflow(&mut self, workflow: &Workflow) -> bool {
        self.run(workflow).await.success
    }

    /// Runs a workflow and reports what happened.
    pub async fn run(&mut self, workflow: &Workflow) -> WorkflowReport {
        let mut report = WorkflowReport::default();

        let graph = match WorkflowGraph::build(&workflow.nodes, &workflow.edges) {
            Ok(graph) => graph,
            Err(err) => {
                error!(error = %err, "Workflow rejected");
                report.halt(None, Some("load"), &err);
                return report.finish();
            }
        };
        info!(nodes = graph.len(), roots = ?graph.roots(), "Starting workflow");
        for (node, labware) in workflow.undeclared_labware() {
            warn!(%node, %labware, "Robot action names undeclared labware");
        }

        if let Err(err) = self.setup(&workflow.global).await {
            error!(error = %err, "Workflow setup failed");
            report.halt(None, Some("setup"), &err);
            return report.finish();
        }

        for id in graph.order() {
            if self.cancel.is_cancelled() {
                warn!(node = %id, "Workflow cancelled");
                report.halt(Some(id), None, &EchemError::Cancelled);
                break;
            }
            let Some(node) = workflow.node(id) else {
                continue;
            };
            let span = info_span!("node", node = %node.id, label = %node.label);
            match self.execute_node(node, &mut report).instrument(span).await {
                Ok(()) => report.visited.push(node.id.clone()),
                Err(err) => {
                    error!(node = %node.id, error = %err, "Stopping workflow");
                    report.halt(Some(&node.id), None, &err);
                    break;
                }
            }
        }

        let report = report.finish();
        info!(
            success = report.success,
            visited = report.visited.len(),
            failures = report.failures.len(),
            "Workflow finished"
        );
        report
    }

    async fn setup(&mut self, global: &GlobalConfig) -> AppResult<()> {
        self.labware =
            LabwareRegistry::setup(self.devices.robot.as_ref(), global, &self.labware_dir).await;
        self.gripper = GripperTracker::default();

        match &global.instruments.pipette {
            Some(pipette) => {
                info!(model = %pipette.model, mount = %pipette.mount, "Loading pipette");
                self.devices
                    .robot
                    .load_pipette(&pipette.model, &pipette.mount)
                    .await?;
            }
            None => warn!("No pipette configured"),
        }

        if let Err(err) = self.devices.robot.set_lights(true).await {
            warn!(error = %err, "Could not switch deck lights on");
        }
        self.devices.robot.home().await
    }

    fn is_bootstrap(&self, node: &Node) -> bool {
        self.config.bootstrap_node.as_deref() == Some(node.id.as_str())
    }

    /// Runs one node. `Err` is returned only for errors that stop the run.
    async fn execute_node(&mut self, node: &Node, report: &mut WorkflowReport) -> AppResult<()> {
        let direct = self.is_bootstrap(node);
        info!(direct, "Executing node");

        for action in &node.robot_actions {
            if let Err(err) = self.robot_step(action, direct).await {
                if err.is_fatal() {
                    return Err(err);
                }
                error!(action = action.name(), error = %err, "Robot action failed");
                report.record(Some(&node.id), Some(action.name()), &err);
            }
        }

        for action in &node.arm_actions {
            if let Err(err) = self.arm_step(action, direct).await {
                if err.is_fatal() {
                    return Err(err);
                }
                error!(action = action.name(), error = %err, "Arm action failed");
                report.record(Some(&node.id), Some(action.name()), &err);
            }
        }

        if !node.peripheral.is_empty() {
            for err in self.run_board(&node.peripheral).await {
                report.record(Some(&node.id), Some("peripheral_control"), &err);
            }
        }

        if let Some(measurement) = &node.measurement {
            self.measure(node, measurement, report).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Safety handshake
    // =========================================================================

    async fn handshake(
        &mut self,
        device: TwinDevice,
        target: &JointTarget,
        asset: Option<&str>,
    ) -> AppResult<()> {
        self.safety.hold();
        if let Some(asset) = asset {
            self.devices.twin.publish_target_asset(device, asset).await?;
        }
        self.devices.twin.publish_joint_target(device, target).await?;
        self.safety.await_verdict(device, &self.cancel).await
    }

    fn commits_after_confirm(&self) -> bool {
        self.config.twin_policy == TwinPolicy::CommitAfterConfirm
    }

    // =========================================================================
    // Robot
    // =========================================================================

    async fn robot_step(&mut self, action: &RobotAction, direct: bool) -> AppResult<()> {
        if direct {
            return self.robot_hardware(action).await;
        }
        let (target, asset) = match action {
            RobotAction::Wash { .. } => return self.robot_hardware(action).await,
            RobotAction::Home => (robot_home_target(), None),
            RobotAction::PickUpTip {
                labware,
                well,
                offset,
            }
            | RobotAction::DropTip {
                labware,
                well,
                offset,
            }
            | RobotAction::MoveTo {
                labware,
                well,
                offset,
                ..
            } => {
                let loaded = self.labware.require(labware)?;
                let target =
                    robot_well_target(loaded.spec.slot, loaded.well_position(well), *offset)?;
                (target, Some(labware.as_str()))
            }
        };

        self.handshake(TwinDevice::Robot, &target, asset).await?;
        if self.commits_after_confirm() {
            self.robot_hardware(action).await
        } else {
            debug!(action = action.name(), "Continuing with next robot action");
            Ok(())
        }
    }

    async fn robot_hardware(&self, action: &RobotAction) -> AppResult<()> {
        let robot = &self.devices.robot;
        match action {
            RobotAction::PickUpTip {
                labware,
                well,
                offset,
            } => {
                let id = &self.labware.require(labware)?.id;
                info!(labware = %id, %well, "Picking up tip");
                robot
                    .move_to_well(id, well, WellOrigin::Top, *offset, TIP_APPROACH_SPEED)
                    .await?;
                robot.pick_up_tip(id, well, *offset).await
            }
            RobotAction::DropTip {
                labware,
                well,
                offset,
            } => {
                let id = &self.labware.require(labware)?.id;
                info!(labware = %id, %well, "Dropping tip");
                robot
                    .move_to_well(id, well, WellOrigin::Top, *offset, TIP_APPROACH_SPEED)
                    .await?;
                robot.drop_tip(id, well, WellOrigin::Bottom, *offset).await
            }
            RobotAction::MoveTo {
                labware,
                well,
                offset,
                speed,
            } => {
                let id = &self.labware.require(labware)?.id;
                info!(labware = %id, %well, speed, "Moving to well");
                robot
                    .move_to_well(id, well, WellOrigin::Top, *offset, *speed)
                    .await
            }
            RobotAction::Wash { peripheral_control } => {
                info!(commands = peripheral_control.len(), "Washing");
                let failures = self.run_board(peripheral_control).await;
                match failures.len() {
                    0 => Ok(()),
                    n => Err(EchemError::Device(format!(
                        "{n} of {} wash commands failed",
                        peripheral_control.len()
                    ))),
                }
            }
            RobotAction::Home => {
                info!("Homing robot");
                robot.home().await
            }
        }
    }

    // =========================================================================
    // Arm
    // =========================================================================

    async fn arm_step(&mut self, action: &ArmAction, direct: bool) -> AppResult<()> {
        let (target, asset) = if let Some(motion) = action.servo_motion() {
            (servo_target(&motion), None)
        } else if let ArmAction::SetGripperPosition { pos, labware } = action {
            let (target, asset) = self.gripper.update(*pos, labware);
            (target, Some(asset))
        } else {
            debug!(action = action.name(), "No twin model for Cartesian moves");
            return self.arm_hardware(action).await;
        };

        if direct {
            return self.arm_hardware(action).await;
        }
        self.handshake(TwinDevice::Arm, &target, asset.as_deref())
            .await?;
        if self.commits_after_confirm() {
            self.arm_hardware(action).await
        } else {
            debug!(action = action.name(), "Continuing with next arm action");
            Ok(())
        }
    }

    async fn arm_hardware(&self, action: &ArmAction) -> AppResult<()> {
        let arm = &self.devices.arm;
        if let Some(motion) = action.servo_motion() {
            info!(angles = ?motion.angles, relative = motion.relative, "Moving arm joints");
            return arm.set_servo_angle(&motion).await;
        }
        if let Some(motion) = action.pose_motion() {
            info!(pose = ?motion.pose, "Moving arm to pose");
            return arm.set_position(&motion).await;
        }
        match action {
            ArmAction::SetGripperPosition { pos, .. } => {
                info!(position = pos, "Setting gripper");
                arm.set_gripper_position(*pos).await
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Peripheral board and measurements
    // =========================================================================

    async fn run_board(&self, commands: &[PeripheralCommand]) -> Vec<EchemError> {
        match &self.devices.board {
            Some(board) => execute_batch(board.as_ref(), commands).await,
            None => {
                warn!(commands = commands.len(), "No peripheral board attached, skipping");
                Vec::new()
            }
        }
    }

    /// Dispatches a measurement node. Only cancellation stops the run;
    /// other failures are recorded and escalate per class.
    async fn measure(
        &self,
        node: &Node,
        measurement: &Measurement,
        report: &mut WorkflowReport,
    ) -> AppResult<()> {
        let Some(dispatcher) = &self.dispatcher else {
            warn!(technique = %measurement.technique, "No dispatcher attached, skipping measurement");
            return Ok(());
        };

        let mut uo = UnitOperation::new(measurement.technique, measurement.parameters.clone());
        let mut metadata = JsonMap::new();
        metadata.insert("workflow_node".to_string(), node.id.clone().into());
        uo.metadata = Some(metadata);

        let result = dispatcher.execute_operation(uo, &self.cancel).await;
        let outcome = match result.error_kind {
            None => {
                info!(experiment_id = ?result.experiment_id, "Measurement complete");
                Ok(())
            }
            Some(ErrorKind::Cancelled) => Err(EchemError::Cancelled),
            Some(kind) => {
                let message = result.message.clone().unwrap_or_default();
                error!(?kind, %message, "Measurement failed");
                report.failures.push(NodeFailure {
                    node: Some(node.id.clone()),
                    action: Some(measurement.technique.to_string()),
                    kind,
                    message,
                    escalated: matches!(kind, ErrorKind::Connection | ErrorKind::Measurement),
                });
                Ok(())
            }
        };
        report.measurements.push(result);
        outcome
    }
}
