//! Linear sweep voltammetry: a single forward scan.

use super::simulation::{cap_points, linspace, noise_factor, pace};
use super::{mismatch, BackendContext, BackendCore, TechniqueBackend};
use crate::core::{JsonMap, Technique};
use crate::error::AppResult;
use crate::parameters::{ParsedParameters, TechniqueParameters};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Linear sweep voltammetry backend.
pub struct LinearSweepVoltammetry {
    core: BackendCore,
}

impl LinearSweepVoltammetry {
    #[allow(missing_docs)]
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            core: BackendCore::new(ctx),
        }
    }
}

fn current_response(voltage: f64) -> f64 {
    1e-6 * (1.0 + 10.0 * (-(voltage - 0.5).powi(2) / 0.2).exp())
}

#[async_trait]
impl TechniqueBackend for LinearSweepVoltammetry {
    fn technique(&self) -> Technique {
        Technique::Lsv
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    async fn execute_measurement(&self, params: &ParsedParameters) -> AppResult<JsonMap> {
        self.core.session.ensure_connected()?;
        let TechniqueParameters::Lsv(p) = &params.technique else {
            return Err(mismatch(Technique::Lsv, params));
        };
        info!(
            start_voltage = p.start_voltage,
            end_voltage = p.end_voltage,
            scan_rate = p.scan_rate,
            "Executing LSV measurement"
        );

        let range = (p.end_voltage - p.start_voltage).abs();
        let requested = (range / (p.scan_rate * p.sample_interval)).round() as usize;
        let points = cap_points(requested, &self.core.simulation, "lsv scan");
        let voltages = linspace(p.start_voltage, p.end_voltage, points);
        let currents: Vec<f64> = {
            let mut rng = rand::thread_rng();
            voltages
                .iter()
                .map(|v| current_response(*v) * noise_factor(&mut rng, 0.05))
                .collect()
        };
        let times: Vec<f64> = (0..points).map(|i| i as f64 * p.sample_interval).collect();

        pace(&self.core.simulation, range / p.scan_rate).await;

        let mut data = JsonMap::new();
        data.insert("time".into(), json!(times));
        data.insert("voltage".into(), json!(voltages));
        data.insert("current".into(), json!(currents));
        data.insert("parameters".into(), serde_json::to_value(params)?);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBench;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_shape() {
        let ctx = BackendContext::new(Arc::new(SimulatedBench::new()));
        let mut backend = LinearSweepVoltammetry::new(&ctx);
        assert!(backend.connect_devices().await);

        let raw = json!({"start_voltage": "-0.5V", "end_voltage": "500mV", "scan_rate": "100mV/s"});
        let params = backend.prepare(raw.as_object().unwrap()).unwrap();
        let data = backend.execute_measurement(&params).await.unwrap();

        let voltage = data["voltage"].as_array().unwrap();
        let current = data["current"].as_array().unwrap();
        assert_eq!(voltage.len(), 100);
        assert_eq!(current.len(), 100);
        assert_eq!(voltage[0], json!(-0.5));
        let rate = data["parameters"]["scan_rate"].as_f64().unwrap();
        assert!((rate - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_peak_at_half_volt() {
        assert!(current_response(0.5) > current_response(0.0));
        assert!(current_response(0.5) > current_response(1.0));
    }
}
