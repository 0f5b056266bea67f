//! Chronopotentiometry: constant applied current, recorded potential.

use super::simulation::{additive_noise, cap_points, pace};
use super::{mismatch, BackendContext, BackendCore, TechniqueBackend};
use crate::core::{JsonMap, Technique};
use crate::error::AppResult;
use crate::parameters::{ParsedParameters, TechniqueParameters};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

const CELL_RESISTANCE: f64 = 1000.0;
const CELL_CAPACITANCE: f64 = 0.01;
const REST_POTENTIAL: f64 = 0.5;

/// Chronopotentiometry backend.
pub struct Chronopotentiometry {
    core: BackendCore,
}

impl Chronopotentiometry {
    #[allow(missing_docs)]
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            core: BackendCore::new(ctx),
        }
    }
}

/// RC charging curve of the simulated cell.
fn voltage_at(t: f64, current: f64) -> f64 {
    let tau = CELL_RESISTANCE * CELL_CAPACITANCE;
    REST_POTENTIAL + current * CELL_RESISTANCE * (1.0 - (-t / tau).exp())
}

#[async_trait]
impl TechniqueBackend for Chronopotentiometry {
    fn technique(&self) -> Technique {
        Technique::Cp
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    async fn execute_measurement(&self, params: &ParsedParameters) -> AppResult<JsonMap> {
        self.core.session.ensure_connected()?;
        let TechniqueParameters::Cp(p) = &params.technique else {
            return Err(mismatch(Technique::Cp, params));
        };
        info!(
            current = p.current,
            duration = p.duration,
            "Executing CP measurement"
        );

        let requested = (p.duration / p.sample_interval).floor() as usize + 1;
        let points = cap_points(requested, &self.core.simulation, "cp recording");
        let times: Vec<f64> = (0..points).map(|i| i as f64 * p.sample_interval).collect();
        let voltages: Vec<f64> = {
            let mut rng = rand::thread_rng();
            times
                .iter()
                .map(|t| voltage_at(*t, p.current) + additive_noise(&mut rng, 0.01))
                .collect()
        };

        pace(&self.core.simulation, p.duration).await;

        let mut data = JsonMap::new();
        data.insert("time".into(), json!(times));
        data.insert("voltage".into(), json!(voltages));
        data.insert("current".into(), json!(p.current));
        data.insert("parameters".into(), serde_json::to_value(params)?);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charging_curve_saturates() {
        assert!((voltage_at(0.0, 0.001) - 0.5).abs() < 1e-12);
        let late = voltage_at(1000.0, 0.001);
        assert!((late - 1.5).abs() < 1e-6);
        assert!(voltage_at(5.0, -0.001) < 0.5);
    }
}
