use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};

/// Least-squares fit with a small ridge term on the normal equations.
#[derive(Debug, Clone)]
pub struct LinearFit {
    coefficients: DVector<f64>,
    /// (XᵀX + λI)⁻¹, used for prediction variance.
    covariance: DMatrix<f64>,
    sigma: f64,
    n_obs: usize,
}

/// Fits `y ≈ X β`. `ridge` is relative to the mean diagonal of XᵀX so it
/// stays unit-free across differently scaled designs.
pub fn fit(rows: &[Vec<f64>], y: &[f64], ridge: f64) -> Result<LinearFit> {
    if rows.is_empty() {
        bail!("Cannot fit on an empty design");
    }
    if rows.len() != y.len() {
        bail!(
            "Design and target count mismatch: {} rows, {} targets",
            rows.len(),
            y.len()
        );
    }
    let n = rows.len();
    let p = rows[0].len();
    if rows.iter().any(|r| r.len() != p) {
        bail!("All design rows must have the same length");
    }

    let x = DMatrix::from_fn(n, p, |i, j| rows[i][j]);
    let yv = DVector::from_column_slice(y);
    let xt = x.transpose();

    let mut gram = &xt * &x;
    let scale = gram.diagonal().mean().max(1e-12);
    for i in 0..p {
        gram[(i, i)] += ridge * scale;
    }
    let chol = gram
        .cholesky()
        .ok_or_else(|| anyhow!("normal equations are not positive definite"))?;
    let beta = chol.solve(&(&xt * &yv));

    let residuals = &yv - &x * &beta;
    let dof = n.saturating_sub(p).max(1);
    let sigma = (residuals.norm_squared() / dof as f64).sqrt();
    if !sigma.is_finite() || beta.iter().any(|b| !b.is_finite()) {
        bail!("least squares produced non-finite estimates");
    }

    Ok(LinearFit {
        coefficients: beta,
        covariance: chol.inverse(),
        sigma,
        n_obs: n,
    })
}

impl LinearFit {
    pub fn coefficients(&self) -> &[f64] {
        self.coefficients.as_slice()
    }

    /// Residual standard error.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        row.iter()
            .zip(self.coefficients.iter())
            .map(|(x, b)| x * b)
            .sum()
    }

    /// Standard deviation of a new observation at `row`:
    /// σ·sqrt(1 + xᵀ(XᵀX)⁻¹x).
    pub fn prediction_std(&self, row: &[f64]) -> f64 {
        let x = DVector::from_column_slice(row);
        let leverage = (x.transpose() * &self.covariance * &x)[(0, 0)];
        self.sigma * (1.0 + leverage.max(0.0)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_exact_line() {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![1.0, i as f64]).collect();
        let y: Vec<f64> = (0..20).map(|i| 2.0 + 3.0 * i as f64).collect();
        let fit = fit(&rows, &y, 0.0).unwrap();
        assert!((fit.coefficients()[0] - 2.0).abs() < 1e-6);
        assert!((fit.coefficients()[1] - 3.0).abs() < 1e-6);
        assert!(fit.sigma() < 1e-6);
        assert!((fit.predict(&[1.0, 30.0]) - 92.0).abs() < 1e-4);
    }

    #[test]
    fn test_prediction_std_grows_away_from_data() {
        let rows: Vec<Vec<f64>> = (0..30).map(|i| vec![1.0, i as f64]).collect();
        let y: Vec<f64> = (0..30)
            .map(|i| 5.0 + i as f64 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let fit = fit(&rows, &y, 1e-9).unwrap();
        let near = fit.prediction_std(&[1.0, 15.0]);
        let far = fit.prediction_std(&[1.0, 90.0]);
        assert!(near >= fit.sigma());
        assert!(far > near);
    }

    #[test]
    fn test_rejects_mismatched_input() {
        assert!(fit(&[vec![1.0]], &[1.0, 2.0], 0.0).is_err());
        assert!(fit(&[], &[], 0.0).is_err());
        assert!(fit(&[vec![1.0, 2.0], vec![1.0]], &[1.0, 2.0], 0.0).is_err());
    }

    #[test]
    fn test_ridge_handles_collinear_columns() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![1.0, i as f64, 2.0 * i as f64]).collect();
        let y: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let fit = fit(&rows, &y, 1e-6).unwrap();
        assert!((fit.predict(&[1.0, 4.0, 8.0]) - 4.0).abs() < 1e-3);
    }
}
