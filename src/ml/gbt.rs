//! Gradient boosted regression trees on top of smartcore's CART regressor.

use anyhow::{anyhow, bail, Result};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};

type Tree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Boosting objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Loss {
    Squared,
    /// Pinball loss at level α, producing a conditional quantile.
    Quantile(f64),
}

#[derive(Debug, Clone)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: u16,
    pub min_samples_leaf: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 150,
            learning_rate: 0.05,
            max_depth: 3,
            min_samples_leaf: 3,
        }
    }
}

pub struct GradientBoostedTrees {
    loss: Loss,
    base: f64,
    stages: Vec<(f64, Tree)>,
    n_features: usize,
}

impl GradientBoostedTrees {
    pub fn fit(x: &[Vec<f64>], y: &[f64], loss: Loss, params: &BoostingParams) -> Result<Self> {
        if x.is_empty() || y.is_empty() {
            bail!("Cannot train on empty dataset");
        }
        if x.len() != y.len() {
            bail!(
                "Feature and target count mismatch: {} features, {} targets",
                x.len(),
                y.len()
            );
        }
        if let Loss::Quantile(alpha) = loss {
            if !(0.0 < alpha && alpha < 1.0) {
                bail!("quantile level {alpha} outside (0, 1)");
            }
        }

        let n_samples = x.len();
        let n_features = x[0].len();
        let mut flat = Vec::with_capacity(n_samples * n_features);
        for row in x {
            if row.len() != n_features {
                bail!("All feature vectors must have the same length");
            }
            flat.extend_from_slice(row);
        }
        let matrix = DenseMatrix::new(n_samples, n_features, flat, false);

        let base = match loss {
            Loss::Squared => y.iter().sum::<f64>() / n_samples as f64,
            Loss::Quantile(alpha) => quantile(y, alpha),
        };
        let mut fitted = vec![base; n_samples];
        let mut stages = Vec::with_capacity(params.n_estimators);

        let tree_params = DecisionTreeRegressorParameters::default()
            .with_max_depth(params.max_depth)
            .with_min_samples_leaf(params.min_samples_leaf)
            .with_min_samples_split(params.min_samples_leaf * 2);

        for _ in 0..params.n_estimators {
            let gradient: Vec<f64> = y
                .iter()
                .zip(&fitted)
                .map(|(yi, fi)| match loss {
                    Loss::Squared => yi - fi,
                    Loss::Quantile(alpha) => {
                        if yi > fi {
                            alpha
                        } else {
                            alpha - 1.0
                        }
                    }
                })
                .collect();

            let tree = Tree::fit(&matrix, &gradient, tree_params.clone())
                .map_err(|e| anyhow!("Tree training failed: {:?}", e))?;
            let step = tree
                .predict(&matrix)
                .map_err(|e| anyhow!("Prediction failed during boosting: {:?}", e))?;
            if step.iter().all(|s| s.abs() < 1e-15) {
                break;
            }

            let gamma = match loss {
                Loss::Squared => params.learning_rate,
                Loss::Quantile(alpha) => {
                    params.learning_rate * pinball_line_search(y, &fitted, &step, alpha)
                }
            };
            if gamma == 0.0 {
                break;
            }
            for (f, s) in fitted.iter_mut().zip(&step) {
                *f += gamma * s;
            }
            stages.push((gamma, tree));
        }

        Ok(Self {
            loss,
            base,
            stages,
            n_features,
        })
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn predict_one(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.n_features {
            bail!(
                "Feature count mismatch: model expects {}, got {}",
                self.n_features,
                row.len()
            );
        }
        let matrix = DenseMatrix::new(1, self.n_features, row.to_vec(), false);
        let mut value = self.base;
        for (gamma, tree) in &self.stages {
            let out = tree
                .predict(&matrix)
                .map_err(|e| anyhow!("Prediction failed: {:?}", e))?;
            value += gamma * out.first().copied().unwrap_or(0.0);
        }
        Ok(value)
    }
}

fn quantile(values: &[f64], alpha: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = alpha * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn pinball(residual: f64, alpha: f64) -> f64 {
    if residual >= 0.0 {
        alpha * residual
    } else {
        (alpha - 1.0) * residual
    }
}

/// Step length minimising total pinball loss along `step`. The objective is
/// convex and piecewise linear in γ, so ternary search over [0, largest
/// breakpoint] converges.
fn pinball_line_search(y: &[f64], fitted: &[f64], step: &[f64], alpha: f64) -> f64 {
    let upper = y
        .iter()
        .zip(fitted)
        .zip(step)
        .filter(|(_, s)| s.abs() > 1e-15)
        .map(|((yi, fi), s)| (yi - fi) / s)
        .filter(|g| g.is_finite() && *g > 0.0)
        .fold(0.0_f64, f64::max);
    if upper == 0.0 {
        return 0.0;
    }

    let objective = |gamma: f64| -> f64 {
        y.iter()
            .zip(fitted)
            .zip(step)
            .map(|((yi, fi), s)| pinball(yi - fi - gamma * s, alpha))
            .sum()
    };

    let (mut lo, mut hi) = (0.0, upper);
    for _ in 0..100 {
        let m1 = lo + (hi - lo) / 3.0;
        let m2 = hi - (hi - lo) / 3.0;
        if objective(m1) <= objective(m2) {
            hi = m2;
        } else {
            lo = m1;
        }
    }
    (lo + hi) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..n).map(|i| vec![i as f64, (i % 12) as f64]).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| 100.0 + 2.0 * i as f64 + if i % 3 == 0 { 4.0 } else { -2.0 })
            .collect();
        (x, y)
    }

    #[test]
    fn test_squared_loss_fits_training_data() {
        let (x, y) = ramp(80);
        let model = GradientBoostedTrees::fit(&x, &y, Loss::Squared, &BoostingParams::default()).unwrap();
        let mean_abs_err: f64 = x
            .iter()
            .zip(&y)
            .map(|(row, t)| (model.predict_one(row).unwrap() - t).abs())
            .sum::<f64>()
            / y.len() as f64;
        assert!(mean_abs_err < 10.0, "mean abs err {mean_abs_err}");
        assert!(model.n_stages() > 0);
    }

    #[test]
    fn test_quantile_twins_bracket_median() {
        let (x, y) = ramp(80);
        let params = BoostingParams::default();
        let low = GradientBoostedTrees::fit(&x, &y, Loss::Quantile(0.1), &params).unwrap();
        let high = GradientBoostedTrees::fit(&x, &y, Loss::Quantile(0.9), &params).unwrap();
        let row = &x[40];
        assert!(low.predict_one(row).unwrap() < high.predict_one(row).unwrap());
    }

    #[test]
    fn test_quantile_helper_interpolates() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.5), 3.0);
        assert!((quantile(&[0.0, 10.0], 0.1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_input() {
        let params = BoostingParams::default();
        assert!(GradientBoostedTrees::fit(&[], &[], Loss::Squared, &params).is_err());
        assert!(GradientBoostedTrees::fit(&[vec![1.0]], &[1.0], Loss::Quantile(1.5), &params).is_err());
        let (x, y) = ramp(20);
        let model = GradientBoostedTrees::fit(&x, &y, Loss::Squared, &params).unwrap();
        assert!(model.predict_one(&[1.0]).is_err());
    }
}
