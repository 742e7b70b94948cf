//! Warm-restart cosine annealing for the network-weight learning rate

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::config::SearchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealingWarmRestarts {
    pub eta_max: f64,
    pub eta_min: f64,
    /// Length of the first cycle in epochs
    pub ti: usize,
    /// Growth factor of each following cycle
    pub tm: usize,
}

impl CosineAnnealingWarmRestarts {
    pub fn new(eta_max: f64, eta_min: f64, ti: usize, tm: usize) -> Self {
        Self {
            eta_max,
            eta_min,
            ti: ti.max(1),
            tm: tm.max(1),
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        Self::new(config.eta_max, config.eta_min, config.ti, config.tm)
    }

    /// Current cycle length and offset into it at fractional epoch `t`
    pub fn cycle_position(&self, t: f64) -> (f64, f64) {
        let mut period = self.ti as f64;
        let mut tc = t.max(0.0);
        while tc >= period {
            tc -= period;
            period *= self.tm as f64;
        }
        (period, tc)
    }

    /// Learning rate at fractional epoch `t`
    pub fn lr_at(&self, t: f64) -> f64 {
        let (period, tc) = self.cycle_position(t);
        if tc == 0.0 {
            return self.eta_max;
        }
        self.eta_min + 0.5 * (self.eta_max - self.eta_min) * (1.0 + (PI * tc / period).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_boundaries() {
        let s = CosineAnnealingWarmRestarts::new(0.001, 1e-6, 1, 2);
        assert_eq!(s.lr_at(0.0), 0.001);
        // cycles: [0,1), [1,3), [3,7)
        assert_eq!(s.lr_at(1.0), 0.001);
        assert_eq!(s.lr_at(3.0), 0.001);
        assert_eq!(s.cycle_position(5.0), (4.0, 2.0));
    }

    #[test]
    fn test_midpoint_is_mean() {
        let s = CosineAnnealingWarmRestarts::new(1.0, 0.0, 2, 1);
        assert!((s.lr_at(1.0) - 0.5).abs() < 1e-12);
        assert!((s.lr_at(3.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_cycle_params_clamped() {
        let s = CosineAnnealingWarmRestarts::new(0.1, 0.0, 0, 0);
        assert_eq!(s.ti, 1);
        assert_eq!(s.tm, 1);
        assert_eq!(s.lr_at(2.0), 0.1);
    }
}
