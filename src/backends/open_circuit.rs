//! Open circuit voltage recording.

use super::simulation::{additive_noise, cap_points, pace};
use super::{mismatch, BackendContext, BackendCore, TechniqueBackend};
use crate::core::{JsonMap, Technique};
use crate::error::AppResult;
use crate::parameters::{ParsedParameters, TechniqueParameters};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Open circuit voltage backend.
pub struct OpenCircuitVoltage {
    core: BackendCore,
}

impl OpenCircuitVoltage {
    #[allow(missing_docs)]
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            core: BackendCore::new(ctx),
        }
    }
}

// Relaxation from 1.2 V towards 0.8 V.
fn voltage_at(t: f64) -> f64 {
    0.8 + 0.4 * (-0.01 * t).exp()
}

#[async_trait]
impl TechniqueBackend for OpenCircuitVoltage {
    fn technique(&self) -> Technique {
        Technique::Ocv
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    async fn execute_measurement(&self, params: &ParsedParameters) -> AppResult<JsonMap> {
        self.core.session.ensure_connected()?;
        let TechniqueParameters::Ocv(p) = &params.technique else {
            return Err(mismatch(Technique::Ocv, params));
        };
        info!(
            duration = p.duration,
            sample_interval = p.sample_interval,
            "Executing OCV measurement"
        );

        let requested = (p.duration / p.sample_interval).floor() as usize + 1;
        let points = cap_points(requested, &self.core.simulation, "ocv recording");
        let times: Vec<f64> = (0..points).map(|i| i as f64 * p.sample_interval).collect();
        let voltages: Vec<f64> = {
            let mut rng = rand::thread_rng();
            times
                .iter()
                .map(|t| voltage_at(*t) + additive_noise(&mut rng, 0.005))
                .collect()
        };

        pace(&self.core.simulation, p.duration).await;

        let mut data = JsonMap::new();
        data.insert("time".into(), json!(times));
        data.insert("voltage".into(), json!(voltages));
        data.insert("parameters".into(), serde_json::to_value(params)?);
        Ok(data)
    }
}
