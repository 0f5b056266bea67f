//! Technique backends.
//!
//! One backend per [`Technique`]. Each owns a [`DeviceSession`] and turns
//! validated [`ParsedParameters`] into measurement data. The five shipped
//! backends generate simulated curves; a real instrument driver implements
//! [`TechniqueBackend`] the same way and registers itself with a
//! [`BackendFactory`].
//!
//! # Contract
//!
//! - `validate_parameters` merges defaults before checking and returns every
//!   violation.
//! - `execute_measurement` requires a connected session and holds no one-shot
//!   state, so it may be called repeatedly.
//! - `disconnect_devices` is idempotent.

pub mod chronopotentiometry;
pub mod cyclic;
pub mod impedance;
pub mod linear_sweep;
pub mod open_circuit;
pub mod session;
pub mod simulation;

pub use session::{DeviceConnector, DeviceSession, SessionState};

use crate::config::SimulationConfig;
use crate::core::{JsonMap, Technique};
use crate::error::{AppResult, EchemError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::peripheral::{execute_batch, PeripheralCommand};
use crate::parameters::{self, ParameterLimits, ParsedParameters};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// Everything a backend needs at construction.
#[derive(Clone)]
pub struct BackendContext {
    /// Instrument link shared by all backends of a dispatcher
    pub connector: Arc<dyn DeviceConnector>,
    #[allow(missing_docs)]
    pub limits: ParameterLimits,
    #[allow(missing_docs)]
    pub simulation: SimulationConfig,
    /// Connection retry policy
    pub retry: RetryPolicy,
}

impl BackendContext {
    /// Context with default limits, simulation settings and retry policy.
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            limits: ParameterLimits::default(),
            simulation: SimulationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// State every simulated backend carries.
pub struct BackendCore {
    #[allow(missing_docs)]
    pub session: DeviceSession,
    #[allow(missing_docs)]
    pub limits: ParameterLimits,
    #[allow(missing_docs)]
    pub simulation: SimulationConfig,
}

impl BackendCore {
    #[allow(missing_docs)]
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            session: DeviceSession::new(Arc::clone(&ctx.connector), ctx.retry.clone()),
            limits: ctx.limits.clone(),
            simulation: ctx.simulation.clone(),
        }
    }
}

/// Per-technique measurement capability.
#[async_trait]
pub trait TechniqueBackend: Send + Sync {
    /// Technique served by this backend.
    fn technique(&self) -> Technique;

    #[allow(missing_docs)]
    fn core(&self) -> &BackendCore;

    #[allow(missing_docs)]
    fn core_mut(&mut self) -> &mut BackendCore;

    /// Measures with already validated parameters.
    async fn execute_measurement(&self, params: &ParsedParameters) -> AppResult<JsonMap>;

    /// Defaults applied to omitted fields.
    fn default_parameters(&self) -> JsonMap {
        parameters::default_parameters(self.technique())
    }

    /// Merges defaults, parses and validates raw parameters.
    fn prepare(&self, raw: &JsonMap) -> AppResult<ParsedParameters> {
        parameters::prepare(self.technique(), raw, &self.core().limits)
    }

    /// Every problem with `raw`; empty when valid.
    fn validate_parameters(&self, raw: &JsonMap) -> Vec<String> {
        match self.prepare(raw) {
            Ok(_) => Vec::new(),
            Err(EchemError::Validation(violations)) => violations,
            Err(other) => vec![other.to_string()],
        }
    }

    #[allow(missing_docs)]
    fn state(&self) -> SessionState {
        self.core().session.state()
    }

    /// Connects the devices; failures are logged and reported as `false`.
    async fn connect_devices(&mut self) -> bool {
        let technique = self.technique();
        match self.core_mut().session.connect().await {
            Ok(()) => true,
            Err(err) => {
                error!(%technique, error = %err, "Failed to connect to devices");
                false
            }
        }
    }

    /// Runs peripheral commands on the connected board, continuing past failures.
    async fn run_peripheral(&self, commands: &[PeripheralCommand]) -> Vec<EchemError> {
        if commands.is_empty() {
            return Vec::new();
        }
        match self.core().session.board() {
            Some(board) => execute_batch(board.as_ref(), commands).await,
            None => {
                warn!(
                    technique = %self.technique(),
                    count = commands.len(),
                    "No peripheral board available, skipping commands"
                );
                Vec::new()
            }
        }
    }

    /// Closes the device links; safe to call more than once.
    async fn disconnect_devices(&mut self) {
        self.core_mut().session.disconnect().await;
    }
}

/// Rejects parameters that belong to another technique.
pub(crate) fn mismatch(expected: Technique, params: &ParsedParameters) -> EchemError {
    EchemError::Measurement(format!(
        "{expected} backend received {} parameters",
        params.technique.technique()
    ))
}

type BackendConstructor = Box<dyn Fn(&BackendContext) -> Box<dyn TechniqueBackend> + Send + Sync>;

/// Builds backends by technique.
pub struct BackendFactory {
    constructors: HashMap<Technique, BackendConstructor>,
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendFactory {
    /// Factory with the five simulated backends registered.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register(Technique::Cva, |ctx| {
            Box::new(cyclic::CyclicVoltammetry::new(ctx))
        });
        factory.register(Technique::Peis, |ctx| {
            Box::new(impedance::ImpedanceSpectroscopy::new(ctx))
        });
        factory.register(Technique::Ocv, |ctx| {
            Box::new(open_circuit::OpenCircuitVoltage::new(ctx))
        });
        factory.register(Technique::Cp, |ctx| {
            Box::new(chronopotentiometry::Chronopotentiometry::new(ctx))
        });
        factory.register(Technique::Lsv, |ctx| {
            Box::new(linear_sweep::LinearSweepVoltammetry::new(ctx))
        });
        factory
    }

    /// Factory with nothing registered.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers or replaces the constructor for `technique`.
    pub fn register<F>(&mut self, technique: Technique, constructor: F)
    where
        F: Fn(&BackendContext) -> Box<dyn TechniqueBackend> + Send + Sync + 'static,
    {
        self.constructors.insert(technique, Box::new(constructor));
    }

    /// Builds a backend for `technique`.
    pub fn create(
        &self,
        technique: Technique,
        ctx: &BackendContext,
    ) -> AppResult<Box<dyn TechniqueBackend>> {
        self.constructors
            .get(&technique)
            .map(|constructor| constructor(ctx))
            .ok_or_else(|| EchemError::UnknownTechnique(technique.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBench;
    use serde_json::json;

    fn context() -> BackendContext {
        BackendContext::new(Arc::new(SimulatedBench::new()))
    }

    #[test]
    fn test_factory_builds_every_technique() {
        let factory = BackendFactory::new();
        let ctx = context();
        for technique in Technique::ALL {
            let backend = factory.create(technique, &ctx).unwrap();
            assert_eq!(backend.technique(), technique);
            assert_eq!(backend.state(), SessionState::Unconnected);
        }
    }

    #[test]
    fn test_empty_factory_rejects() {
        let factory = BackendFactory::empty();
        let err = factory.create(Technique::Ocv, &context()).err().unwrap();
        assert!(matches!(err, EchemError::UnknownTechnique(_)));
    }

    #[test]
    fn test_validate_parameters_reports_parse_errors() {
        let backend = BackendFactory::new().create(Technique::Cva, &context()).unwrap();
        let raw = json!({"scan_rate": "fast"}).as_object().cloned().unwrap();
        let errors = backend.validate_parameters(&raw);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("scan_rate"));
    }

    #[test]
    fn test_validate_parameters_cycles_window() {
        let backend = BackendFactory::new().create(Technique::Cva, &context()).unwrap();
        for bad in [0, -1, 1001] {
            let raw = json!({"cycles": bad}).as_object().cloned().unwrap();
            assert!(!backend.validate_parameters(&raw).is_empty());
        }
        let raw = json!({"cycles": 1000}).as_object().cloned().unwrap();
        assert!(backend.validate_parameters(&raw).is_empty());
    }

    #[tokio::test]
    async fn test_measurement_requires_connection() {
        let backend = BackendFactory::new().create(Technique::Ocv, &context()).unwrap();
        let params = backend.prepare(&JsonMap::new()).unwrap();
        let err = backend.execute_measurement(&params).await.unwrap_err();
        assert!(matches!(err, EchemError::Connection(_)));
    }

    #[tokio::test]
    async fn test_disconnect_devices_twice() {
        let mut backend = BackendFactory::new().create(Technique::Lsv, &context()).unwrap();
        assert!(backend.connect_devices().await);
        backend.disconnect_devices().await;
        backend.disconnect_devices().await;
        assert_eq!(backend.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_measurement_is_repeatable() {
        let mut backend = BackendFactory::new().create(Technique::Cp, &context()).unwrap();
        assert!(backend.connect_devices().await);
        let params = backend.prepare(&JsonMap::new()).unwrap();
        let first = backend.execute_measurement(&params).await.unwrap();
        let second = backend.execute_measurement(&params).await.unwrap();
        assert_eq!(first["time"], second["time"]);
    }
}
