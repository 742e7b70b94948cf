//! Adam over parameter groups
//!
//! One instance per group: the network weights and the architecture logits
//! never share optimizer state.

use ndarray::{Array2, Zip};

use crate::nas::params::ParameterGroup;

#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    t: u64,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    /// Moments are shaped after `params`
    pub fn new<P: ParameterGroup>(params: &P, betas: (f64, f64), weight_decay: f64) -> Self {
        let zeros: Vec<Array2<f64>> = params.tensors().iter().map(|t| Array2::zeros(t.raw_dim())).collect();
        Self {
            beta1: betas.0,
            beta2: betas.1,
            eps: 1e-8,
            weight_decay: if weight_decay.is_finite() && weight_decay >= 0.0 { weight_decay } else { 0.0 },
            t: 0,
            m: zeros.clone(),
            v: zeros,
        }
    }

    /// Network-weight defaults: betas (0.9, 0.999)
    pub fn for_weights<P: ParameterGroup>(params: &P, weight_decay: f64) -> Self {
        Self::new(params, (0.9, 0.999), weight_decay)
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    /// One update; the weight-decay term is added to the gradient
    pub fn step<P: ParameterGroup>(&mut self, params: &mut P, grads: &P, lr: f64) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);
        let (b1, b2, eps, wd) = (self.beta1, self.beta2, self.eps, self.weight_decay);

        let grads = grads.tensors();
        for (((mut p, g), m), v) in params
            .tensors_mut()
            .into_iter()
            .zip(grads.iter())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            Zip::from(&mut p).and(g).and(m).and(v).for_each(|p, &g, m, v| {
                let g = g + wd * *p;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
    }
}
