//! # Numeric Input Container
//!
//! The core operates on positional arrays only: a feature matrix, one site label per
//! sample, and optional discrete and continuous covariate matrices. Nothing here knows
//! about column names; that is the job of [`crate::table`].
//!
//! Validation is eager. Shape and finiteness problems surface before any arithmetic
//! runs, so the numeric modules can assume consistent, finite inputs.

use crate::estimate::CombatError;
use ndarray::ArrayView2;

/// Borrowed views of everything a fit or transform needs.
///
/// Shapes: `features` is `[n_samples, n_features]`, `sites` has `n_samples` entries,
/// `discrete` is `[n_samples, k_d]` and `continuous` is `[n_samples, k_c]`.
#[derive(Debug, Clone, Copy)]
pub struct CombatInput<'a> {
    features: ArrayView2<'a, f64>,
    sites: &'a [String],
    discrete: Option<ArrayView2<'a, String>>,
    continuous: Option<ArrayView2<'a, f64>>,
}

impl<'a> CombatInput<'a> {
    pub fn new(features: ArrayView2<'a, f64>, sites: &'a [String]) -> Self {
        Self {
            features,
            sites,
            discrete: None,
            continuous: None,
        }
    }

    /// Attaches categorical covariates (e.g. diagnosis group).
    pub fn with_discrete(mut self, discrete: ArrayView2<'a, String>) -> Self {
        self.discrete = Some(discrete);
        self
    }

    /// Attaches numeric covariates (e.g. age).
    pub fn with_continuous(mut self, continuous: ArrayView2<'a, f64>) -> Self {
        self.continuous = Some(continuous);
        self
    }

    pub fn features(&self) -> ArrayView2<'a, f64> {
        self.features
    }

    pub fn sites(&self) -> &'a [String] {
        self.sites
    }

    pub fn discrete(&self) -> Option<ArrayView2<'a, String>> {
        self.discrete
    }

    pub fn continuous(&self) -> Option<ArrayView2<'a, f64>> {
        self.continuous
    }

    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Checks sample counts agree across arguments and that numeric inputs are finite.
    pub fn validate(&self) -> Result<(), CombatError> {
        let n_samples = self.n_samples();
        if n_samples == 0 {
            return Err(CombatError::ShapeMismatch(
                "the feature matrix has no samples".to_string(),
            ));
        }
        if self.n_features() == 0 {
            return Err(CombatError::ShapeMismatch(
                "the feature matrix has no feature columns".to_string(),
            ));
        }
        if self.sites.len() != n_samples {
            return Err(CombatError::ShapeMismatch(format!(
                "{} site labels were given for {} samples",
                self.sites.len(),
                n_samples
            )));
        }
        if let Some(discrete) = self.discrete {
            if discrete.nrows() != n_samples {
                return Err(CombatError::ShapeMismatch(format!(
                    "discrete covariates have {} rows but there are {} samples",
                    discrete.nrows(),
                    n_samples
                )));
            }
        }
        if let Some(continuous) = self.continuous {
            if continuous.nrows() != n_samples {
                return Err(CombatError::ShapeMismatch(format!(
                    "continuous covariates have {} rows but there are {} samples",
                    continuous.nrows(),
                    n_samples
                )));
            }
            check_finite(continuous, "continuous covariates")?;
        }
        check_finite(self.features, "features")
    }
}

fn check_finite(values: ArrayView2<'_, f64>, argument: &'static str) -> Result<(), CombatError> {
    match values.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, column), _)) => Err(CombatError::NonFiniteInput {
            argument,
            row,
            column,
        }),
        None => Ok(()),
    }
}
