//! Cyclic voltammetry.
//!
//! Each cycle is a forward scan from `start_voltage` to `end_voltage` followed
//! by the reverse scan. The simulated current is a Gaussian peak at 0.5 V with
//! a hysteresis term whose sign follows the scan direction. An optional nested
//! loop repeats the whole cycle set once per value of one scan parameter.

use super::simulation::{cap_points, linspace, pace};
use super::{mismatch, BackendContext, BackendCore, TechniqueBackend};
use crate::core::{JsonMap, Technique};
use crate::error::AppResult;
use crate::parameters::{CvaParameters, ParsedParameters, SweepVariable, TechniqueParameters};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

const BASE_CURRENT: f64 = 1e-6;
const PEAK_VOLTAGE: f64 = 0.5;
const PEAK_WIDTH: f64 = 0.2;
const PEAK_GAIN: f64 = 5.0;
const HYSTERESIS: f64 = 0.2;
const INTER_CYCLE_PAUSE_SECS: f64 = 0.5;

/// Cyclic voltammetry backend.
pub struct CyclicVoltammetry {
    core: BackendCore,
}

impl CyclicVoltammetry {
    #[allow(missing_docs)]
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            core: BackendCore::new(ctx),
        }
    }

    fn current_response(voltage: f64, scan_rate: f64) -> f64 {
        let peak = BASE_CURRENT
            * (1.0 + PEAK_GAIN * (-(voltage - PEAK_VOLTAGE).powi(2) / PEAK_WIDTH).exp());
        peak + HYSTERESIS * scan_rate.signum() * peak
    }

    async fn run_cycles(&self, p: &CvaParameters) -> Vec<Value> {
        let range = (p.end_voltage - p.start_voltage).abs();
        let requested = (range / (p.scan_rate * p.sample_interval)).round() as usize;
        let points = cap_points(requested, &self.core.simulation, "cva scan");
        let mut cycles = Vec::with_capacity(p.cycles.max(0) as usize);

        for cycle in 1..=p.cycles {
            info!(cycle, total = p.cycles, "Executing CV cycle");
            let mut voltages = linspace(p.start_voltage, p.end_voltage, points);
            let mut currents: Vec<f64> = voltages
                .iter()
                .map(|v| Self::current_response(*v, p.scan_rate))
                .collect();
            let reverse = linspace(p.end_voltage, p.start_voltage, points);
            currents.extend(reverse.iter().map(|v| Self::current_response(*v, -p.scan_rate)));
            voltages.extend(reverse);
            let times: Vec<f64> = (0..voltages.len())
                .map(|i| i as f64 * p.sample_interval)
                .collect();

            cycles.push(json!({
                "cycle": cycle,
                "time": times,
                "voltage": voltages,
                "current": currents,
            }));

            pace(&self.core.simulation, 2.0 * range / p.scan_rate).await;
            if cycle < p.cycles {
                pace(&self.core.simulation, INTER_CYCLE_PAUSE_SECS).await;
            }
        }
        cycles
    }
}

#[async_trait]
impl TechniqueBackend for CyclicVoltammetry {
    fn technique(&self) -> Technique {
        Technique::Cva
    }

    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    async fn execute_measurement(&self, params: &ParsedParameters) -> AppResult<JsonMap> {
        self.core.session.ensure_connected()?;
        let TechniqueParameters::Cva(p) = &params.technique else {
            return Err(mismatch(Technique::Cva, params));
        };
        info!(
            start_voltage = p.start_voltage,
            end_voltage = p.end_voltage,
            scan_rate = p.scan_rate,
            cycles = p.cycles,
            "Executing CVA measurement"
        );

        let (kind, results) = match &p.nested_loop {
            None => ("single", Value::from(self.run_cycles(p).await)),
            Some(nested) => {
                let mut loops = Vec::with_capacity(nested.values.len());
                for value in &nested.values {
                    let mut swept = p.clone();
                    match nested.variable {
                        SweepVariable::StartVoltage => swept.start_voltage = *value,
                        SweepVariable::EndVoltage => swept.end_voltage = *value,
                        SweepVariable::ScanRate => swept.scan_rate = *value,
                    }
                    loops.push(json!({
                        "loop_value": value,
                        "variable": nested.variable,
                        "results": self.run_cycles(&swept).await,
                    }));
                }
                ("nested", Value::from(loops))
            }
        };

        let mut data = JsonMap::new();
        data.insert("type".into(), json!(kind));
        data.insert("results".into(), results);
        data.insert("parameters".into(), serde_json::to_value(params)?);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBench;
    use serde_json::json;
    use std::sync::Arc;

    async fn connected() -> CyclicVoltammetry {
        let ctx = BackendContext::new(Arc::new(SimulatedBench::new()));
        let mut backend = CyclicVoltammetry::new(&ctx);
        assert!(backend.connect_devices().await);
        backend
    }

    #[tokio::test]
    async fn test_forward_and_reverse_scan() {
        let backend = connected().await;
        let raw = json!({"start_voltage": 0.0, "end_voltage": 1.0, "scan_rate": 0.1,
                         "sample_interval": 0.1, "cycles": 2});
        let params = backend.prepare(raw.as_object().unwrap()).unwrap();
        let data = backend.execute_measurement(&params).await.unwrap();

        assert_eq!(data["type"], json!("single"));
        let cycles = data["results"].as_array().unwrap();
        assert_eq!(cycles.len(), 2);
        let voltage = cycles[0]["voltage"].as_array().unwrap();
        assert_eq!(voltage.len(), 200);
        assert_eq!(voltage[0], json!(0.0));
        assert_eq!(voltage[99], json!(1.0));
        assert_eq!(voltage[199], json!(0.0));
    }

    #[test]
    fn test_hysteresis_separates_branches() {
        let forward = CyclicVoltammetry::current_response(0.5, 0.05);
        let reverse = CyclicVoltammetry::current_response(0.5, -0.05);
        assert!(forward > reverse);
        assert!((forward - 1.2 * 6e-6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_nested_loop_sweeps_variable() {
        let backend = connected().await;
        let raw = json!({"nested_loop": {"variable": "end_voltage", "values": ["0.8V", "1200mV"]}});
        let params = backend.prepare(raw.as_object().unwrap()).unwrap();
        let data = backend.execute_measurement(&params).await.unwrap();

        assert_eq!(data["type"], json!("nested"));
        let loops = data["results"].as_array().unwrap();
        assert_eq!(loops.len(), 2);
        assert_eq!(loops[1]["variable"], json!("end_voltage"));
        let voltages = loops[1]["results"][0]["voltage"].as_array().unwrap();
        let peak = voltages.iter().filter_map(Value::as_f64).fold(f64::MIN, f64::max);
        assert!((peak - 1.2).abs() < 1e-9);
    }
}
