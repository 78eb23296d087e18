use crate::estimate::CombatError;
use ndarray::{Array2, ArrayView2, s};
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};

/// A Cholesky pivot this small relative to its own column's norm marks a column that
/// is numerically a combination of the columns before it.
const RANK_TOLERANCE: f64 = 1.0e-7;

/// Ordinary least squares for many right-hand sides at once.
///
/// Solves `(DᵀD) B = Dᵀ Y` through a Cholesky factorization of the Gram matrix.
/// `design` is `[n_samples, p]`, `targets` is `[n_samples, k]` and the result is
/// `[p, k]`. A rank-deficient design is reported with the first dependent column.
pub fn least_squares(
    design: ArrayView2<'_, f64>,
    targets: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, CombatError> {
    let gram = design.t().dot(&design);
    let rhs = design.t().dot(&targets);

    let lower = match gram.cholesky(UPLO::Lower) {
        Ok(lower) => lower,
        Err(_) => {
            return Err(CombatError::DegenerateDesign {
                column: first_dependent_column(&gram),
            });
        }
    };

    // Pivot k is the norm of column k after projecting out the earlier columns, so
    // comparing it with the column's own norm leaves column scaling out of the test.
    if let Some(column) = lower
        .diag()
        .iter()
        .zip(gram.diag())
        .position(|(&pivot, &norm_sq)| !(pivot.abs() > RANK_TOLERANCE * norm_sq.sqrt()))
    {
        return Err(CombatError::DegenerateDesign { column });
    }

    // L y = Dᵀ Y, then Lᵀ B = y.
    let forward = lower.solve_triangular(UPLO::Lower, Diag::NonUnit, &rhs)?;
    let upper = lower.t().as_standard_layout().into_owned();
    let beta = upper.solve_triangular(UPLO::Upper, Diag::NonUnit, &forward)?;
    Ok(beta)
}

/// Finds the smallest leading block of the Gram matrix that is not positive definite.
fn first_dependent_column(gram: &Array2<f64>) -> usize {
    (1..=gram.nrows())
        .find(|&k| gram.slice(s![..k, ..k]).to_owned().cholesky(UPLO::Lower).is_err())
        .map_or(gram.nrows().saturating_sub(1), |k| k - 1)
}
