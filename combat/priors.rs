//! Method-of-moments hyperparameters for the empirical Bayes priors.
//!
//! Per site, the location parameters across features are modelled as
//! `Normal(gamma_bar, tau_2)` and the scale parameters as
//! `InverseGamma(a_prior, b_prior)`, both moment-matched from the naive estimates.

use crate::estimate::CombatError;
use ndarray::{ArrayView1, ArrayView2, Axis};

/// The empirical prior of one site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SitePrior {
    pub gamma_bar: f64,
    pub tau_2: f64,
    pub a_prior: f64,
    pub b_prior: f64,
}

/// Inverse-gamma shape matched to mean `m` and variance `s2`: `(2 s² + m²) / s²`.
pub fn inverse_gamma_shape(mean: f64, variance: f64) -> f64 {
    (2.0 * variance + mean * mean) / variance
}

/// Inverse-gamma scale matched to mean `m` and variance `s2`: `(m s² + m³) / s²`.
pub fn inverse_gamma_scale(mean: f64, variance: f64) -> f64 {
    (mean * variance + mean * mean * mean) / variance
}

/// Mean and unbiased variance of a vector. Requires at least two elements.
fn moments(values: ArrayView1<'_, f64>) -> (f64, f64) {
    let mean = values.mean().unwrap_or(0.0);
    (mean, values.var(1.0))
}

/// Estimates one prior per site from the rows of `gamma_hat` and `delta_hat`
/// (`[n_sites, n_features]`, at least two features).
pub fn estimate_priors(
    gamma_hat: ArrayView2<'_, f64>,
    delta_hat: ArrayView2<'_, f64>,
    site_names: &[String],
) -> Result<Vec<SitePrior>, CombatError> {
    gamma_hat
        .axis_iter(Axis(0))
        .zip(delta_hat.axis_iter(Axis(0)))
        .zip(site_names)
        .map(|((gamma_row, delta_row), name)| {
            let (gamma_bar, tau_2) = moments(gamma_row);
            let (m, s2) = moments(delta_row);
            // Identical scales across features leave the inverse-gamma moments undefined.
            if !(s2 > f64::EPSILON * m * m) {
                return Err(CombatError::NumericDegeneracy(format!(
                    "the scale estimates of site '{name}' do not vary across features, so its inverse-gamma prior is undefined"
                )));
            }
            Ok(SitePrior {
                gamma_bar,
                tau_2,
                a_prior: inverse_gamma_shape(m, s2),
                b_prior: inverse_gamma_scale(m, s2),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_moment_matched_hyperparameters() {
        // Mean 2, variance 1: a = (2 + 4) / 1, b = (2 + 8) / 1.
        assert_abs_diff_eq!(inverse_gamma_shape(2.0, 1.0), 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(inverse_gamma_scale(2.0, 1.0), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_gamma_mean_matches_input_mean() {
        // For InverseGamma(a, b) the mean is b / (a - 1).
        let (m, s2) = (1.3, 0.2);
        let a = inverse_gamma_shape(m, s2);
        let b = inverse_gamma_scale(m, s2);
        assert_abs_diff_eq!(b / (a - 1.0), m, epsilon = 1e-12);
        // And the variance is b² / ((a - 1)² (a - 2)).
        assert_abs_diff_eq!(b * b / ((a - 1.0).powi(2) * (a - 2.0)), s2, epsilon = 1e-12);
    }

    #[test]
    fn test_priors_are_per_site() {
        let gamma_hat = array![[1.0, 2.0, 3.0], [-1.0, -1.0, 2.0]];
        let delta_hat = array![[1.0, 2.0, 3.0], [0.5, 1.0, 1.5]];
        let names = vec!["A".to_string(), "B".to_string()];
        let priors = estimate_priors(gamma_hat.view(), delta_hat.view(), &names).unwrap();
        assert_eq!(priors.len(), 2);
        assert_abs_diff_eq!(priors[0].gamma_bar, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(priors[0].tau_2, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(priors[1].gamma_bar, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(priors[1].tau_2, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(priors[0].a_prior, 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(priors[0].b_prior, 10.0, epsilon = 1e-12);
        // Mean 1, variance 0.25.
        assert_abs_diff_eq!(priors[1].a_prior, 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(priors[1].b_prior, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_scales_are_degenerate() {
        let gamma_hat = array![[1.0, 2.0], [0.0, 1.0]];
        let delta_hat = array![[1.0, 2.0], [0.7, 0.7]];
        let names = vec!["A".to_string(), "B".to_string()];
        let err = estimate_priors(gamma_hat.view(), delta_hat.view(), &names).unwrap_err();
        match err {
            CombatError::NumericDegeneracy(msg) => assert!(msg.contains("'B'")),
            other => panic!("Expected NumericDegeneracy, got {:?}", other),
        }
    }
}
