use crate::estimate::CombatError;
use crate::standardize::unstandardize;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Removes the shrunk site effects from standardized data and returns it to the
/// original feature scale.
///
/// Each sample is shifted by its site's `gamma_star` and divided by the square root of
/// its site's `delta_star`; the result is then rescaled by `sqrt(var_pooled)` and the
/// expected mean (grand mean plus covariate effects) is added back. Sites partition the
/// samples, so every row of the output is written exactly once.
pub fn adjust_data(
    standardized: ArrayView2<'_, f64>,
    partition: &[Vec<usize>],
    gamma_star: ArrayView2<'_, f64>,
    delta_star: ArrayView2<'_, f64>,
    var_pooled: ArrayView1<'_, f64>,
    expected_mean: ArrayView2<'_, f64>,
) -> Array2<f64> {
    let mut adjusted = Array2::zeros(standardized.raw_dim());

    for (site, rows) in partition.iter().enumerate() {
        let location = gamma_star.row(site);
        let scale = delta_star.row(site).mapv(f64::sqrt);
        for &row in rows {
            let mut out = adjusted.row_mut(row);
            out.assign(&standardized.row(row));
            out -= &location;
            out /= &scale;
        }
    }

    unstandardize(adjusted.view(), expected_mean, var_pooled)
}

/// Shrunk scales are divisors in [`adjust_data`]; reject any that are not strictly
/// positive and finite.
pub fn ensure_positive_scales(
    delta_star: ArrayView2<'_, f64>,
    site_names: &[String],
) -> Result<(), CombatError> {
    for (row, name) in delta_star.axis_iter(Axis(0)).zip(site_names) {
        if let Some(feature) = row.iter().position(|&d| !(d.is_finite() && d > 0.0)) {
            return Err(CombatError::NumericDegeneracy(format!(
                "site '{name}' has a non-positive scale estimate for feature {feature}"
            )));
        }
    }
    Ok(())
}
