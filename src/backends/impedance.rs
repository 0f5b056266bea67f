//! Potentiostatic impedance spectroscopy.
//!
//! Sweeps log-spaced frequencies between the two endpoints in the order given
//! (high-to-low and low-to-high are both accepted). The simulated cell is a
//! parallel RC circuit with 5% multiplicative noise on each component.

use super::simulation::{cap_points, logspace, noise_factor, pace};
use super::{mismatch, BackendContext, BackendCore, TechniqueBackend};
use crate::core::{JsonMap, Technique};
use crate::error::AppResult;
use crate::parameters::{ParsedParameters, TechniqueParameters};
use async_trait::async_trait;
use serde_json::json;
use std::f64::consts::PI;
use tracing::info;

const RESISTANCE: f64 = 1000.0;
const CAPACITANCE: f64 = 1e-6;
const SECONDS_PER_POINT: f64 = 0.1;

/// Impedance spectroscopy backend.
pub struct ImpedanceSpectroscopy {
    core: BackendCore,
}

impl ImpedanceSpectroscopy {
    #[allow(missing_docs)]
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            core: BackendCore::new(ctx),
        }
    }
}

/// Real and imaginary impedance of the ideal RC cell.
fn impedance(frequency: f64) -> (f64, f64) {
    let omega = 2.0 * PI * frequency;
    let denom = 1.0 + (omega * RESISTANCE * CAPACITANCE).powi(2);
    (
        RESISTANCE / denom,
        -omega * RESISTANCE.powi(2) * CAPACITANCE / denom,
    )
}

#[async_trait]
impl TechniqueBackend for ImpedanceSpectroscopy {
    fn technique(&self) -> Technique {
        Technique::Peis
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    async fn execute_measurement(&self, params: &ParsedParameters) -> AppResult<JsonMap> {
        self.core.session.ensure_connected()?;
        let TechniqueParameters::Peis(p) = &params.technique else {
            return Err(mismatch(Technique::Peis, params));
        };
        info!(
            dc_voltage = p.dc_voltage,
            ac_amplitude = p.ac_amplitude,
            frequency_start = p.frequency_start,
            frequency_end = p.frequency_end,
            "Executing PEIS measurement"
        );

        let decades = (p.frequency_end / p.frequency_start).log10().abs();
        let requested = (decades * p.points_per_decade as f64).round() as usize;
        let points = cap_points(requested, &self.core.simulation, "peis sweep");
        let frequencies = logspace(p.frequency_start, p.frequency_end, points);

        let mut z_real = Vec::with_capacity(points);
        let mut z_imag = Vec::with_capacity(points);
        {
            let mut rng = rand::thread_rng();
            for f in &frequencies {
                let (re, im) = impedance(*f);
                z_real.push(re * noise_factor(&mut rng, 0.05));
                z_imag.push(im * noise_factor(&mut rng, 0.05));
            }
        }
        let magnitude: Vec<f64> = z_real
            .iter()
            .zip(&z_imag)
            .map(|(re, im)| re.hypot(*im))
            .collect();
        let phase: Vec<f64> = z_real
            .iter()
            .zip(&z_imag)
            .map(|(re, im)| im.atan2(*re).to_degrees())
            .collect();

        pace(&self.core.simulation, points as f64 * SECONDS_PER_POINT).await;

        let mut data = JsonMap::new();
        data.insert("frequencies".into(), json!(frequencies));
        data.insert("impedance_real".into(), json!(z_real));
        data.insert("impedance_imag".into(), json!(z_imag));
        data.insert("impedance_magnitude".into(), json!(magnitude));
        data.insert("phase_angle".into(), json!(phase));
        data.insert("parameters".into(), serde_json::to_value(params)?);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBench;
    use std::sync::Arc;

    #[test]
    fn test_rc_limits() {
        let (re_low, im_low) = impedance(1e-3);
        assert!((re_low - RESISTANCE).abs() < 1.0);
        assert!(im_low.abs() < 1.0);
        let (re_high, _) = impedance(1e6);
        assert!(re_high < 1.0);
    }

    #[tokio::test]
    async fn test_sweep_covers_decades() {
        let ctx = BackendContext::new(Arc::new(SimulatedBench::new()));
        let mut backend = ImpedanceSpectroscopy::new(&ctx);
        assert!(backend.connect_devices().await);

        let raw = json!({"start_freq": "100kHz", "end_freq": "1Hz", "amplitude": "5mV",
                         "points_per_decade": 10});
        let params = backend.prepare(raw.as_object().unwrap()).unwrap();
        let data = backend.execute_measurement(&params).await.unwrap();

        let frequencies = data["frequencies"].as_array().unwrap();
        assert_eq!(frequencies.len(), 50);
        let first = frequencies[0].as_f64().unwrap();
        assert!((first - 1e5).abs() < 1e-6);
        for phase in data["phase_angle"].as_array().unwrap() {
            let phase = phase.as_f64().unwrap();
            assert!((-90.0..=0.0).contains(&phase));
        }
    }
}
