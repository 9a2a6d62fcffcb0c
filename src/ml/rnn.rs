//! Single-layer Elman network with a scalar input and scalar output, trained
//! with truncated BPTT and Adam.

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

#[derive(Debug, Clone)]
pub struct RnnParams {
    pub hidden: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub gradient_clip: f64,
    pub seed: u64,
}

impl Default for RnnParams {
    fn default() -> Self {
        Self {
            hidden: 16,
            epochs: 60,
            learning_rate: 0.01,
            gradient_clip: 1.0,
            seed: 42,
        }
    }
}

/// Parameters live in one flat vector:
/// `w_in[h] | w_rec[h*h] | b_h[h] | w_out[h] | b_out`.
#[derive(Debug, Clone)]
pub struct ElmanNetwork {
    hidden: usize,
    theta: Vec<f64>,
}

impl ElmanNetwork {
    fn w_in(&self) -> usize {
        0
    }
    fn w_rec(&self) -> usize {
        self.hidden
    }
    fn b_h(&self) -> usize {
        self.hidden + self.hidden * self.hidden
    }
    fn w_out(&self) -> usize {
        2 * self.hidden + self.hidden * self.hidden
    }
    fn b_out(&self) -> usize {
        3 * self.hidden + self.hidden * self.hidden
    }

    fn initialise(hidden: usize, rng: &mut StdRng) -> Result<Self> {
        let mut net = Self {
            hidden,
            theta: vec![0.0; 3 * hidden + hidden * hidden + 1],
        };
        let scale = 1.0 / (hidden as f64).sqrt();
        let input = Normal::new(0.0, 0.5).map_err(|e| anyhow!("invalid init distribution: {e}"))?;
        let recurrent =
            Normal::new(0.0, scale).map_err(|e| anyhow!("invalid init distribution: {e}"))?;

        for i in 0..hidden {
            let idx = net.w_in() + i;
            net.theta[idx] = input.sample(rng);
        }
        for k in 0..hidden * hidden {
            let idx = net.w_rec() + k;
            net.theta[idx] = recurrent.sample(rng);
        }
        for i in 0..hidden {
            let idx = net.w_out() + i;
            net.theta[idx] = recurrent.sample(rng);
        }
        Ok(net)
    }

    /// Hidden states h_0..h_L (h_0 = 0) and the output read from h_L.
    fn forward(&self, sequence: &[f64]) -> (Vec<Vec<f64>>, f64) {
        let h = self.hidden;
        let mut states = Vec::with_capacity(sequence.len() + 1);
        states.push(vec![0.0; h]);
        for &x in sequence {
            let prev = &states[states.len() - 1];
            let next: Vec<f64> = (0..h)
                .map(|i| {
                    let rec: f64 = (0..h)
                        .map(|j| self.theta[self.w_rec() + i * h + j] * prev[j])
                        .sum();
                    (self.theta[self.w_in() + i] * x + rec + self.theta[self.b_h() + i]).tanh()
                })
                .collect();
            states.push(next);
        }
        let last = &states[states.len() - 1];
        let out = (0..h)
            .map(|i| self.theta[self.w_out() + i] * last[i])
            .sum::<f64>()
            + self.theta[self.b_out()];
        (states, out)
    }

    pub fn predict(&self, sequence: &[f64]) -> f64 {
        self.forward(sequence).1
    }

    /// Accumulates ∂(½(ŷ−y)²)/∂θ into `grad` and returns the squared error.
    fn backward(&self, sequence: &[f64], target: f64, grad: &mut [f64]) -> f64 {
        let h = self.hidden;
        let (states, out) = self.forward(sequence);
        let dy = out - target;

        let last = &states[sequence.len()];
        for i in 0..h {
            grad[self.w_out() + i] += dy * last[i];
        }
        grad[self.b_out()] += dy;

        let mut dh: Vec<f64> = (0..h).map(|i| dy * self.theta[self.w_out() + i]).collect();
        for t in (0..sequence.len()).rev() {
            let cur = &states[t + 1];
            let prev = &states[t];
            let da: Vec<f64> = (0..h).map(|i| dh[i] * (1.0 - cur[i] * cur[i])).collect();
            for i in 0..h {
                grad[self.w_in() + i] += da[i] * sequence[t];
                grad[self.b_h() + i] += da[i];
                for j in 0..h {
                    grad[self.w_rec() + i * h + j] += da[i] * prev[j];
                }
            }
            dh = (0..h)
                .map(|j| {
                    (0..h)
                        .map(|i| self.theta[self.w_rec() + i * h + j] * da[i])
                        .sum()
                })
                .collect();
        }
        dy * dy
    }

    /// Trains on `(window, next value)` pairs, already scaled. Deterministic
    /// for a given seed.
    pub fn train(samples: &[(Vec<f64>, f64)], params: &RnnParams) -> Result<Self> {
        if samples.is_empty() {
            bail!("Cannot train on empty dataset");
        }
        if params.hidden == 0 {
            bail!("hidden layer must have at least one unit");
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut net = Self::initialise(params.hidden, &mut rng)?;
        let n_params = net.theta.len();
        let (beta1, beta2, eps): (f64, f64, f64) = (0.9, 0.999, 1e-8);
        let mut m = vec![0.0; n_params];
        let mut v = vec![0.0; n_params];
        let mut step = 0i32;
        let mut order: Vec<usize> = (0..samples.len()).collect();

        for _ in 0..params.epochs {
            order.shuffle(&mut rng);
            for &idx in &order {
                let (window, target) = &samples[idx];
                let mut grad = vec![0.0; n_params];
                net.backward(window, *target, &mut grad);

                let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
                if !norm.is_finite() {
                    bail!("gradient diverged during training");
                }
                if norm > params.gradient_clip {
                    let k = params.gradient_clip / norm;
                    grad.iter_mut().for_each(|g| *g *= k);
                }

                step += 1;
                let bc1 = 1.0 - beta1.powi(step);
                let bc2 = 1.0 - beta2.powi(step);
                for k in 0..n_params {
                    m[k] = beta1 * m[k] + (1.0 - beta1) * grad[k];
                    v[k] = beta2 * v[k] + (1.0 - beta2) * grad[k] * grad[k];
                    net.theta[k] -= params.learning_rate * (m[k] / bc1) / ((v[k] / bc2).sqrt() + eps);
                }
            }
        }

        if net.theta.iter().any(|p| !p.is_finite()) {
            bail!("training produced non-finite weights");
        }
        Ok(net)
    }

    pub fn mean_squared_error(&self, samples: &[(Vec<f64>, f64)]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples
            .iter()
            .map(|(w, y)| (self.predict(w) - y).powi(2))
            .sum::<f64>()
            / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seasonal_windows(lookback: usize) -> Vec<(Vec<f64>, f64)> {
        let series: Vec<f64> = (0..72)
            .map(|t| 0.5 + 0.4 * (2.0 * std::f64::consts::PI * t as f64 / 12.0).sin())
            .collect();
        series
            .windows(lookback + 1)
            .map(|w| (w[..lookback].to_vec(), w[lookback]))
            .collect()
    }

    #[test]
    fn test_training_beats_mean_predictor() {
        let samples = seasonal_windows(6);
        let params = RnnParams {
            epochs: 80,
            ..Default::default()
        };
        let net = ElmanNetwork::train(&samples, &params).unwrap();
        let mean = samples.iter().map(|(_, y)| y).sum::<f64>() / samples.len() as f64;
        let baseline =
            samples.iter().map(|(_, y)| (y - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!(net.mean_squared_error(&samples) < baseline * 0.5);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let samples = seasonal_windows(4);
        let params = RnnParams {
            epochs: 5,
            ..Default::default()
        };
        let a = ElmanNetwork::train(&samples, &params).unwrap();
        let b = ElmanNetwork::train(&samples, &params).unwrap();
        assert_eq!(a.predict(&samples[0].0), b.predict(&samples[0].0));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let net = ElmanNetwork::initialise(3, &mut rng).unwrap();
        let window = vec![0.2, 0.5, 0.9];
        let target = 0.4;
        let mut grad = vec![0.0; net.theta.len()];
        net.backward(&window, target, &mut grad);

        let h = 1e-6;
        for k in [0, 4, 10, net.theta.len() - 1] {
            let mut plus = net.clone();
            plus.theta[k] += h;
            let mut minus = net.clone();
            minus.theta[k] -= h;
            let lp = 0.5 * (plus.predict(&window) - target).powi(2);
            let lm = 0.5 * (minus.predict(&window) - target).powi(2);
            let numeric = (lp - lm) / (2.0 * h);
            assert!((numeric - grad[k]).abs() < 1e-5, "param {k}: {numeric} vs {}", grad[k]);
        }
    }

    #[test]
    fn test_rejects_empty() {
        assert!(ElmanNetwork::train(&[], &RnnParams::default()).is_err());
    }
}
