//! rust_echem command-line interface.
//!
//! ```bash
//! rust_echem run demos/workflows/ocv_wash.json
//! rust_echem experiment demos/unit_operations/cv.json
//! rust_echem validate demos/workflows/ocv_wash.json --config config/echem.toml
//! ```
//!
//! Device clients for the physical robot, arm and board live outside this
//! crate; the binary drives the in-process simulated devices, with a twin
//! that confirms every move.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rust_echem::config::{Settings, DEFAULT_CONFIG_PATH};
use rust_echem::core::UnitOperationRequest;
use rust_echem::dispatcher::ExperimentDispatcher;
use rust_echem::hardware::mock::{MockArm, MockBoard, MockRobot, MockTwin, SimulatedBench};
use rust_echem::logging;
use rust_echem::parameters::prepare;
use rust_echem::workflow::{
    safety_channel, Devices, SafetyState, Workflow, WorkflowExecutor, WorkflowGraph,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_echem")]
#[command(about = "Electrochemistry experiment dispatch and workflow execution", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow graph
    Run {
        /// Workflow JSON document
        workflow: PathBuf,
    },
    /// Execute a single unit operation
    Experiment {
        /// JSON file with `uo_type`, `parameters` and optional `metadata`
        request: PathBuf,
    },
    /// Check a workflow document without moving anything
    Validate {
        /// Workflow JSON document
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    logging::init(&settings);

    match cli.command {
        Commands::Run { workflow } => run_workflow(&settings, &workflow).await,
        Commands::Experiment { request } => run_experiment(&settings, &request).await,
        Commands::Validate { workflow } => validate_workflow(&settings, &workflow).await,
    }
}

fn dispatcher(settings: &Settings, board: Arc<MockBoard>) -> anyhow::Result<Arc<ExperimentDispatcher>> {
    let bench = Arc::new(SimulatedBench::with_board(board));
    Ok(Arc::new(ExperimentDispatcher::from_settings(settings, bench)?))
}

async fn run_workflow(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let workflow = Workflow::load(path)
        .await
        .with_context(|| format!("loading workflow {}", path.display()))?;

    let board = Arc::new(MockBoard::new());
    let dispatcher = dispatcher(settings, Arc::clone(&board))?;
    let (publisher, synchronizer) = safety_channel();
    let devices = Devices {
        robot: Arc::new(MockRobot::new()),
        arm: Arc::new(MockArm::new()),
        board: Some(board),
        twin: Arc::new(MockTwin::responding(publisher, SafetyState::Continue)),
    };
    let mut executor = WorkflowExecutor::new(devices, synchronizer)
        .with_safety_config(settings.safety.clone())
        .with_dispatcher(Arc::clone(&dispatcher))
        .with_labware_dir(settings.hardware.labware_dir.clone());

    let cancel = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling workflow");
            cancel.cancel();
        }
    });

    let report = executor.run(&workflow).await;
    dispatcher.cleanup().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.success {
        bail!("workflow {} failed", path.display());
    }
    Ok(())
}

async fn run_experiment(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let request: UnitOperationRequest = serde_json::from_str(&text)?;

    let dispatcher = dispatcher(settings, Arc::new(MockBoard::new()))?;
    let result = dispatcher.execute_experiment(request).await;
    dispatcher.cleanup().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        bail!(
            "experiment failed: {}",
            result.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn validate_workflow(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let workflow = Workflow::load(path)
        .await
        .with_context(|| format!("loading workflow {}", path.display()))?;
    let graph = WorkflowGraph::build(&workflow.nodes, &workflow.edges)?;

    let mut problems = 0;
    for node in &workflow.nodes {
        if let Some(measurement) = &node.measurement {
            if let Err(err) = prepare(measurement.technique, &measurement.parameters, &settings.limits) {
                warn!(node = %node.id, error = %err, "Measurement parameters rejected");
                problems += 1;
            }
        }
    }

    for (node, labware) in workflow.undeclared_labware() {
        warn!(%node, %labware, "Robot action names undeclared labware");
        problems += 1;
    }

    info!(
        nodes = graph.len(),
        edges = workflow.edges.len(),
        labware = workflow.global.labware.len(),
        "Workflow structure is valid"
    );
    println!("execution order: {}", graph.order().join(" -> "));
    if problems > 0 {
        bail!("{problems} problem(s) found in {}", path.display());
    }
    Ok(())
}
