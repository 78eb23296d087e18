//! Feature standardization.
//!
//! The magnitude of a feature would otherwise bias the empirical Bayes priors, which
//! are pooled across features. Each feature is regressed on the full design, and the
//! data are moved to a space with zero mean and unit pooled variance where covariate
//! effects are kept and site effects are left in place to be estimated.

use crate::design::covariate_only;
use crate::estimate::CombatError;
use crate::linalg::least_squares;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};

/// Residual spread, in units of `EPSILON * max|x|`, that is still rounding noise.
const ROUNDING_ULPS: f64 = 1.0e3;

/// Fit-time standardization parameters, reused unchanged by every transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    /// Regression coefficients of every feature on the design. Shape `[design_width, n_features]`.
    pub beta_hat: Array2<f64>,
    /// Sample-size-weighted average of the site intercept rows of `beta_hat`.
    pub grand_mean: Array1<f64>,
    /// Mean squared residual per feature, pooled uniformly over all samples.
    pub var_pooled: Array1<f64>,
}

/// Estimates `beta_hat`, `grand_mean` and `var_pooled` from fit-time data.
pub fn fit_standardization(
    features: ArrayView2<'_, f64>,
    design: ArrayView2<'_, f64>,
    n_sites: usize,
    site_counts: &[usize],
) -> Result<Standardization, CombatError> {
    debug_assert_eq!(site_counts.len(), n_sites);
    let n_samples = features.nrows() as f64;

    let beta_hat = least_squares(design, features)?;

    let mut grand_mean = Array1::zeros(features.ncols());
    for (site, &count) in site_counts.iter().enumerate() {
        grand_mean.scaled_add(count as f64 / n_samples, &beta_hat.row(site));
    }

    let residuals = &features - &design.dot(&beta_hat);
    let var_pooled = residuals.mapv(|r| r * r).sum_axis(Axis(0)) / n_samples;

    // A constant feature leaves only rounding noise in its residuals, on the order of
    // a few ulps of its largest magnitude.
    for (feature, (&variance, column)) in var_pooled
        .iter()
        .zip(features.axis_iter(Axis(1)))
        .enumerate()
    {
        let largest = column.fold(0.0_f64, |acc, &x| acc.max(x.abs()));
        let noise = ROUNDING_ULPS * f64::EPSILON * largest;
        if !(variance > noise * noise) {
            return Err(CombatError::NumericDegeneracy(format!(
                "feature {feature} has zero pooled variance after removing site and covariate effects"
            )));
        }
    }

    Ok(Standardization {
        beta_hat,
        grand_mean,
        var_pooled,
    })
}

/// Expected value of every sample: the grand mean plus the covariate contribution.
/// Site effects are excluded, since those are what harmonization removes.
pub fn expected_mean(
    design: ArrayView2<'_, f64>,
    beta_hat: ArrayView2<'_, f64>,
    grand_mean: ArrayView1<'_, f64>,
    n_sites: usize,
) -> Array2<f64> {
    let covariates = covariate_only(design, n_sites);
    let mut mean = covariates.dot(&beta_hat);
    mean += &grand_mean.insert_axis(Axis(0));
    mean
}

/// `(X - expected_mean) / sqrt(var_pooled)`, column by column.
pub fn standardize(
    features: ArrayView2<'_, f64>,
    expected_mean: ArrayView2<'_, f64>,
    var_pooled: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let scale = var_pooled.mapv(f64::sqrt);
    (&features - &expected_mean) / &scale.insert_axis(Axis(0))
}

/// Inverse of [`standardize`].
pub fn unstandardize(
    standardized: ArrayView2<'_, f64>,
    expected_mean: ArrayView2<'_, f64>,
    var_pooled: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let scale = var_pooled.mapv(f64::sqrt);
    &standardized * &scale.insert_axis(Axis(0)) + &expected_mean
}

/// The covariate rows of `beta_hat`, i.e. the effects harmonization preserves.
pub fn covariate_effects(beta_hat: ArrayView2<'_, f64>, n_sites: usize) -> ArrayView2<'_, f64> {
    beta_hat.slice_move(s![n_sites.., ..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_site_design() -> Array2<f64> {
        array![
            [1.0, 0.0, 20.0],
            [1.0, 0.0, 30.0],
            [1.0, 0.0, 40.0],
            [0.0, 1.0, 25.0],
            [0.0, 1.0, 35.0],
            [0.0, 1.0, 45.0]
        ]
    }

    #[test]
    fn test_grand_mean_weights_sites_by_size() {
        let design = array![[1.0, 0.0], [0.0, 1.0], [0.0, 1.0], [0.0, 1.0]];
        let features = array![[4.0], [1.0], [2.0], [3.0]];
        let fitted = fit_standardization(features.view(), design.view(), 2, &[1, 3]).unwrap();
        // Intercepts are 4 and 2; weights 1/4 and 3/4.
        assert_abs_diff_eq!(fitted.grand_mean[0], 2.5, epsilon = 1e-12);
        // Residuals: 0, -1, 0, 1.
        assert_abs_diff_eq!(fitted.var_pooled[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_standardized_data_has_zero_mean_and_pooled_unit_variance() {
        let design = two_site_design();
        let features = array![
            [10.3, 1.0],
            [14.8, 2.5],
            [20.1, 2.0],
            [22.9, 7.5],
            [27.6, 6.0],
            [32.4, 8.0]
        ];
        let fitted = fit_standardization(features.view(), design.view(), 2, &[3, 3]).unwrap();
        let mean = expected_mean(
            design.view(),
            fitted.beta_hat.view(),
            fitted.grand_mean.view(),
            2,
        );
        let z = standardize(features.view(), mean.view(), fitted.var_pooled.view());

        for column in z.axis_iter(Axis(1)) {
            // Equal site sizes: the site offsets cancel in the overall mean.
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-9);
        }

        let back = unstandardize(z.view(), mean.view(), fitted.var_pooled.view());
        for (b, x) in back.iter().zip(features.iter()) {
            assert_abs_diff_eq!(b, x, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_expected_mean_keeps_covariate_effect_only() {
        let design = two_site_design();
        let beta_hat = array![[1.0], [11.0], [0.5]];
        let grand_mean = array![6.0];
        let mean = expected_mean(design.view(), beta_hat.view(), grand_mean.view(), 2);
        assert_abs_diff_eq!(mean[[0, 0]], 6.0 + 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mean[[3, 0]], 6.0 + 12.5, epsilon = 1e-12);
        assert_eq!(covariate_effects(beta_hat.view(), 2), array![[0.5]]);
    }

    #[test]
    fn test_all_zero_feature_is_degenerate() {
        let design = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let features = array![[1.0, 0.0], [2.0, 0.0], [5.0, 0.0], [3.0, 0.0]];
        let err = fit_standardization(features.view(), design.view(), 2, &[2, 2]).unwrap_err();
        assert!(matches!(err, CombatError::NumericDegeneracy(_)));
    }

    #[test]
    fn test_large_offset_with_small_spread_is_kept() {
        let design = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let offset = 1.0e8;
        let features = array![
            [offset + 0.1],
            [offset - 0.1],
            [offset + 0.2],
            [offset]
        ];
        let fitted = fit_standardization(features.view(), design.view(), 2, &[2, 2]).unwrap();
        // Residuals: ±0.1 in both sites.
        assert_abs_diff_eq!(fitted.var_pooled[0], 0.01, epsilon = 1e-6);
        assert_abs_diff_eq!(fitted.grand_mean[0], offset + 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_constant_feature_at_large_offset_is_degenerate() {
        let design = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let features = array![[2.0, 1.0e8], [1.0, 1.0e8], [4.0, 1.0e8], [3.5, 1.0e8]];
        let err = fit_standardization(features.view(), design.view(), 2, &[2, 2]).unwrap_err();
        assert!(matches!(err, CombatError::NumericDegeneracy(ref msg) if msg.contains("feature 1")));
    }
}
