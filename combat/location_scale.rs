use crate::estimate::CombatError;
use crate::linalg::least_squares;
use ndarray::{Array2, ArrayView2, Axis};

/// Naive (unshrunk) per-site location and scale estimates in standardized space.
#[derive(Debug, Clone)]
pub struct LocationScale {
    /// Per-site mean shift. Shape `[n_sites, n_features]`.
    pub gamma_hat: Array2<f64>,
    /// Per-site unbiased variance. Shape `[n_sites, n_features]`.
    pub delta_hat: Array2<f64>,
}

/// Fits `gamma_hat` by least squares on the site-indicator block alone and `delta_hat`
/// as the ddof = 1 variance of each site's standardized samples.
///
/// Every site must hold at least two samples; [`fit_model`](crate::fit_model) checks
/// this before standardizing.
pub fn fit_location_scale(
    standardized: ArrayView2<'_, f64>,
    site_design: ArrayView2<'_, f64>,
    partition: &[Vec<usize>],
) -> Result<LocationScale, CombatError> {
    let n_features = standardized.ncols();
    let gamma_hat = least_squares(site_design, standardized)?;

    let mut delta_hat = Array2::zeros((partition.len(), n_features));
    for (mut delta_row, rows) in delta_hat.axis_iter_mut(Axis(0)).zip(partition) {
        let site_values = standardized.select(Axis(0), rows);
        delta_row.assign(&site_values.var_axis(Axis(0), 1.0));
    }

    Ok(LocationScale {
        gamma_hat,
        delta_hat,
    })
}
