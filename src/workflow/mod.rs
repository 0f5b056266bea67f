//! Workflow graphs and the digital-twin gated executor.
//!
//! - [`document`] parses workflow JSON into closed action enums
//! - [`graph`] validates the node/edge structure and fixes the execution order
//! - [`labware`] loads deck labware and resolves well geometry
//! - [`twin`] turns actions into digital-twin joint targets
//! - [`safety`] is the safety channel between the observer and the executor
//! - [`executor`] runs a workflow against the devices

pub mod document;
pub mod executor;
pub mod graph;
pub mod labware;
pub mod safety;
pub mod twin;

pub use document::{ArmAction, Edge, Node, RobotAction, Workflow};
pub use executor::{Devices, WorkflowExecutor, WorkflowReport};
pub use graph::WorkflowGraph;
pub use safety::{safety_channel, SafetyPublisher, SafetyState, SafetySynchronizer};
