//! Shared helpers for the simulated measurement generators.

use crate::config::SimulationConfig;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// `n` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// `n` log-spaced values from `start` to `end` inclusive; both must be positive.
pub fn logspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    linspace(start.log10(), end.log10(), n)
        .into_iter()
        .map(|exp| 10f64.powf(exp))
        .collect()
}

/// Multiplicative noise factor in `1 ± fraction/2`.
pub fn noise_factor<R: Rng>(rng: &mut R, fraction: f64) -> f64 {
    1.0 + fraction * (rng.gen::<f64>() - 0.5)
}

/// Additive noise in `±amplitude`.
pub fn additive_noise<R: Rng>(rng: &mut R, amplitude: f64) -> f64 {
    if amplitude == 0.0 {
        return 0.0;
    }
    rng.gen_range(-amplitude..amplitude)
}

/// Clamps a requested point count to `[2, max_points]`.
pub fn cap_points(requested: usize, config: &SimulationConfig, what: &str) -> usize {
    if requested > config.max_points {
        warn!(
            what,
            requested,
            max_points = config.max_points,
            "Point count capped"
        );
    }
    requested.clamp(2, config.max_points.max(2))
}

/// Sleeps for a nominal experiment span when real-time pacing is on.
pub async fn pace(config: &SimulationConfig, nominal_secs: f64) {
    if !config.realtime {
        return;
    }
    let secs = nominal_secs * config.time_scale;
    if secs.is_finite() && secs > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(1.0, 0.0, 5);
        assert_eq!(v.len(), 5);
        assert_eq!(v[0], 1.0);
        assert_eq!(v[4], 0.0);
    }

    #[test]
    fn test_logspace_descending() {
        let v = logspace(1e5, 1.0, 6);
        assert!((v[0] - 1e5).abs() < 1e-6);
        assert!((v[5] - 1.0).abs() < 1e-9);
        assert!(v.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_cap_points() {
        let config = SimulationConfig {
            max_points: 100,
            ..Default::default()
        };
        assert_eq!(cap_points(0, &config, "test"), 2);
        assert_eq!(cap_points(50, &config, "test"), 50);
        assert_eq!(cap_points(5000, &config, "test"), 100);
    }

    #[test]
    fn test_noise_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let f = noise_factor(&mut rng, 0.05);
            assert!((0.975..=1.025).contains(&f));
            assert!(additive_noise(&mut rng, 0.005).abs() <= 0.005);
        }
    }
}
