//! Experiment dispatcher.
//!
//! Routes unit operations to technique backends and persists their results.
//!
//! ```text
//! request --resolve--> technique --prepare--> ParsedParameters
//!         --issue id--> connect --> peripheral batch --> measure
//!         --stamp--> ExperimentResult --upload--> ResultUploader
//! ```
//!
//! # Backend pool
//!
//! One backend per technique, created on first use and reused until
//! [`ExperimentDispatcher::cleanup`]. Each backend sits behind its own async
//! mutex, so at most one measurement per technique is in flight while
//! different techniques run in parallel.
//!
//! # Failures
//!
//! Nothing crosses this boundary as an `Err`: every failure becomes an
//! `ExperimentResult` with `status = error`. Parameters are validated before a
//! backend is looked up, so rejected requests never grow the pool. Every
//! result that was issued an id is uploaded, failed ones included; upload
//! failures are logged and do not change the returned result.

use crate::backends::{BackendContext, BackendFactory, DeviceConnector, TechniqueBackend};
use crate::config::Settings;
use crate::core::{
    ExperimentResult, ExperimentStatus, SubmissionResponse, Technique, UnitOperation,
    UnitOperationRequest,
};
use crate::error::{AppResult, EchemError};
use crate::parameters::prepare;
use crate::storage::{uploader_from_config, ResultRecord, ResultUploader};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

type SharedBackend = Arc<Mutex<Box<dyn TechniqueBackend>>>;

/// Routes unit operations to technique backends.
pub struct ExperimentDispatcher {
    factory: BackendFactory,
    context: BackendContext,
    uploader: Arc<dyn ResultUploader>,
    backends: Mutex<HashMap<Technique, SharedBackend>>,
    statuses: RwLock<HashMap<String, ExperimentStatus>>,
}

impl ExperimentDispatcher {
    /// Dispatcher over the built-in backends.
    pub fn new(context: BackendContext, uploader: Arc<dyn ResultUploader>) -> Self {
        Self {
            factory: BackendFactory::new(),
            context,
            uploader,
            backends: Mutex::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Dispatcher configured from settings, measuring through `connector`.
    pub fn from_settings(settings: &Settings, connector: Arc<dyn DeviceConnector>) -> AppResult<Self> {
        let context = BackendContext {
            connector,
            limits: settings.limits.clone(),
            simulation: settings.simulation.clone(),
            retry: settings.hardware.retry_policy(),
        };
        let uploader = uploader_from_config(&settings.storage)?;
        info!(storage = %uploader.describe(), "Experiment dispatcher ready");
        Ok(Self::new(context, uploader))
    }

    /// Replaces the backend factory.
    pub fn with_factory(mut self, factory: BackendFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Runs one unit operation to completion.
    pub async fn execute_experiment(&self, request: UnitOperationRequest) -> ExperimentResult {
        self.execute_experiment_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Runs one unit operation; cancelling `cancel` stops the measurement.
    pub async fn execute_experiment_with_cancel(
        &self,
        request: UnitOperationRequest,
        cancel: &CancellationToken,
    ) -> ExperimentResult {
        match UnitOperation::from_request(&request) {
            Ok(uo) => self.execute_operation(uo, cancel).await,
            Err(err) => {
                error!(uo_type = %request.uo_type, error = %err, "Error executing experiment");
                ExperimentResult::failure(request.uo_type, &err)
            }
        }
    }

    /// Runs a unit operation whose technique is already resolved.
    pub async fn execute_operation(
        &self,
        mut uo: UnitOperation,
        cancel: &CancellationToken,
    ) -> ExperimentResult {
        let technique = uo.technique;
        let params = match prepare(technique, &uo.parameters, &self.context.limits) {
            Ok(params) => params,
            Err(err) => {
                warn!(%technique, error = %err, "Rejected unit operation");
                return ExperimentResult::failure(technique.as_str(), &err);
            }
        };

        let backend = match self.backend(technique).await {
            Ok(backend) => backend,
            Err(err) => {
                error!(%technique, error = %err, "Error executing experiment");
                return ExperimentResult::failure(technique.as_str(), &err);
            }
        };
        let mut backend = backend.lock().await;

        let experiment_id = self.issue_id(technique).await;
        uo.experiment_id = Some(experiment_id.clone());
        let span = info_span!("experiment", experiment_id = %experiment_id, %technique);

        let outcome = async {
            info!("Executing experiment");
            if !backend.connect_devices().await {
                return Err(EchemError::Connection(
                    "Failed to connect to devices".to_string(),
                ));
            }
            let failures = backend.run_peripheral(&params.peripheral).await;
            if !failures.is_empty() {
                warn!(failed = failures.len(), "Some peripheral commands failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(EchemError::Cancelled),
                data = backend.execute_measurement(&params) => data,
            }
        }
        .instrument(span.clone())
        .await;
        drop(backend);

        let result = match outcome {
            Ok(data) => {
                ExperimentResult::success(technique.as_str(), data).with_id(&experiment_id)
            }
            Err(err) => {
                span.in_scope(|| error!(error = %err, "Experiment failed"));
                ExperimentResult::failure(technique.as_str(), &err).with_id(&experiment_id)
            }
        };

        let status = if result.is_success() {
            ExperimentStatus::Completed
        } else {
            ExperimentStatus::Failed
        };
        self.statuses
            .write()
            .await
            .insert(experiment_id.clone(), status);

        let uo_value = match serde_json::to_value(&uo) {
            Ok(value) => value,
            Err(err) => {
                warn!(%experiment_id, error = %err, "Could not serialise unit operation");
                serde_json::Value::Null
            }
        };
        let record = ResultRecord::new(uo_value, result.clone());
        if let Err(err) = self.uploader.upload(&record, &experiment_id).await {
            warn!(%experiment_id, error = %err, "Failed to upload results");
        }
        result
    }

    /// Runs a request and reports it in the submission reply shape.
    pub async fn submit(&self, request: UnitOperationRequest) -> SubmissionResponse {
        SubmissionResponse::from(&self.execute_experiment(request).await)
    }

    /// Lifecycle of an issued experiment id.
    pub async fn get_status(&self, experiment_id: &str) -> Option<ExperimentStatus> {
        self.statuses.read().await.get(experiment_id).copied()
    }

    /// Number of backends created so far.
    pub async fn backend_count(&self) -> usize {
        self.backends.lock().await.len()
    }

    /// True when a backend for `technique` exists.
    pub async fn has_backend(&self, technique: Technique) -> bool {
        self.backends.lock().await.contains_key(&technique)
    }

    /// Disconnects and drops every backend. Each backend is disconnected
    /// independently; one failing does not keep the others connected.
    pub async fn cleanup(&self) {
        let drained: Vec<(Technique, SharedBackend)> =
            self.backends.lock().await.drain().collect();
        join_all(drained.into_iter().map(|(technique, backend)| async move {
            backend.lock().await.disconnect_devices().await;
            info!(%technique, "Cleaned up backend");
        }))
        .await;
    }

    async fn backend(&self, technique: Technique) -> AppResult<SharedBackend> {
        let mut backends = self.backends.lock().await;
        if let Some(backend) = backends.get(&technique) {
            return Ok(Arc::clone(backend));
        }
        let backend = Arc::new(Mutex::new(self.factory.create(technique, &self.context)?));
        backends.insert(technique, Arc::clone(&backend));
        info!(%technique, "Created new backend instance");
        Ok(backend)
    }

    /// Issues `{YYYYmmdd_HHMMSS}_{TECH}_{8 hex}`, unique within this dispatcher.
    async fn issue_id(&self, technique: Technique) -> String {
        let mut statuses = self.statuses.write().await;
        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!(
                "{}_{}_{}",
                Utc::now().format("%Y%m%d_%H%M%S"),
                technique,
                &suffix[..8]
            );
            if !statuses.contains_key(&id) {
                statuses.insert(id.clone(), ExperimentStatus::Running);
                return id;
            }
            warn!(%id, "Experiment id collision, regenerating");
        }
    }
}
