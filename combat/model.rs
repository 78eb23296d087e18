use crate::adjust::adjust_data;
use crate::data::CombatInput;
use crate::design::{DesignEncoders, partition_by_site};
use crate::estimate::{CombatError, fit_model};
use crate::standardize::{Standardization, covariate_effects, expected_mean, standardize};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// The fitted model is saved as human-readable TOML; these structs define that format.

/// Tuning knobs for a fit. Every field has a default, so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatConfig {
    /// Relative change below which the empirical Bayes iteration stops.
    pub convergence_tolerance: f64,
    /// Iteration ceiling for the empirical Bayes solver, per site.
    pub max_iterations: usize,
    /// When false, the naive location/scale estimates are applied without shrinkage.
    pub empirical_bayes: bool,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            convergence_tolerance: 1e-4,
            max_iterations: 1000,
            empirical_bayes: true,
        }
    }
}

impl CombatConfig {
    pub fn validate(&self) -> Result<(), CombatError> {
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance > 0.0) {
            return Err(CombatError::InvalidConfig(format!(
                "convergence_tolerance must be a positive finite number, got {}",
                self.convergence_tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(CombatError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

/// Everything a fit learns. Produced whole by [`fit_model`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    config: CombatConfig,
    encoders: DesignEncoders,
    standardization: Standardization,
    /// Shrunk per-site location. Shape `[n_sites, n_features]`.
    gamma_star: Array2<f64>,
    /// Shrunk per-site scale. Shape `[n_sites, n_features]`.
    delta_star: Array2<f64>,
}

/// Custom error type for model loading and saving.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl FittedModel {
    pub(crate) fn new(
        config: CombatConfig,
        encoders: DesignEncoders,
        standardization: Standardization,
        gamma_star: Array2<f64>,
        delta_star: Array2<f64>,
    ) -> Self {
        Self {
            config,
            encoders,
            standardization,
            gamma_star,
            delta_star,
        }
    }

    /// Harmonizes new data with the stored parameters.
    ///
    /// The design matrix is rebuilt with the fit-time encoders, the data are
    /// standardized with the fit-time `beta_hat`, grand mean and pooled variance, and
    /// the shrunk site parameters are removed. The model is only read.
    pub fn transform(&self, input: &CombatInput<'_>) -> Result<Array2<f64>, CombatError> {
        input.validate()?;
        if input.n_features() != self.n_features() {
            return Err(CombatError::ShapeMismatch(format!(
                "the model was fitted on {} features but {} were given",
                self.n_features(),
                input.n_features()
            )));
        }

        let n_sites = self.encoders.n_sites();
        let design = self.encoders.build(input)?;
        let site_of_sample = self.encoders.site_indices(input.sites())?;
        let partition = partition_by_site(&site_of_sample, n_sites);

        let mean = expected_mean(
            design.view(),
            self.standardization.beta_hat.view(),
            self.standardization.grand_mean.view(),
            n_sites,
        );
        let standardized = standardize(
            input.features(),
            mean.view(),
            self.standardization.var_pooled.view(),
        );

        Ok(adjust_data(
            standardized.view(),
            &partition,
            self.gamma_star.view(),
            self.delta_star.view(),
            self.standardization.var_pooled.view(),
            mean.view(),
        ))
    }

    pub fn config(&self) -> &CombatConfig {
        &self.config
    }

    pub fn encoders(&self) -> &DesignEncoders {
        &self.encoders
    }

    pub fn site_names(&self) -> &[String] {
        self.encoders.site_names()
    }

    pub fn n_sites(&self) -> usize {
        self.encoders.n_sites()
    }

    pub fn n_features(&self) -> usize {
        self.standardization.var_pooled.len()
    }

    pub fn beta_hat(&self) -> ArrayView2<'_, f64> {
        self.standardization.beta_hat.view()
    }

    /// Coefficients of the covariate columns of the design; the part of `beta_hat`
    /// that harmonization preserves.
    pub fn covariate_effects(&self) -> ArrayView2<'_, f64> {
        covariate_effects(self.beta_hat(), self.n_sites())
    }

    pub fn grand_mean(&self) -> &Array1<f64> {
        &self.standardization.grand_mean
    }

    pub fn var_pooled(&self) -> &Array1<f64> {
        &self.standardization.var_pooled
    }

    pub fn gamma_star(&self) -> &Array2<f64> {
        &self.gamma_star
    }

    pub fn delta_star(&self) -> &Array2<f64> {
        &self.delta_star
    }

    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

/// Whether a transformer holds fitted parameters. There is no partially fitted state.
#[derive(Debug, Clone, Default)]
pub enum ModelState {
    #[default]
    Unfitted,
    Fitted(Box<FittedModel>),
}

/// A fit/transform estimator over the numeric interface.
#[derive(Debug, Clone, Default)]
pub struct CombatTransformer {
    config: CombatConfig,
    state: ModelState,
}

impl CombatTransformer {
    pub fn new(config: CombatConfig) -> Self {
        Self {
            config,
            state: ModelState::Unfitted,
        }
    }

    /// Wraps a previously fitted (e.g. loaded) model.
    pub fn from_model(model: FittedModel) -> Self {
        Self {
            config: model.config().clone(),
            state: ModelState::Fitted(Box::new(model)),
        }
    }

    /// Fits on `input`, replacing any earlier fit. On failure the transformer is left
    /// unfitted.
    pub fn fit(&mut self, input: &CombatInput<'_>) -> Result<(), CombatError> {
        self.reset();
        let model = fit_model(input, &self.config)?;
        self.state = ModelState::Fitted(Box::new(model));
        Ok(())
    }

    pub fn transform(&self, input: &CombatInput<'_>) -> Result<Array2<f64>, CombatError> {
        match &self.state {
            ModelState::Fitted(model) => model.transform(input),
            ModelState::Unfitted => Err(CombatError::NotFitted),
        }
    }

    pub fn fit_transform(&mut self, input: &CombatInput<'_>) -> Result<Array2<f64>, CombatError> {
        self.fit(input)?;
        self.transform(input)
    }

    /// Discards all fitted parameters at once. The configuration is kept.
    pub fn reset(&mut self) {
        self.state = ModelState::Unfitted;
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, ModelState::Fitted(_))
    }

    pub fn model(&self) -> Option<&FittedModel> {
        match &self.state {
            ModelState::Fitted(model) => Some(model),
            ModelState::Unfitted => None,
        }
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn config(&self) -> &CombatConfig {
        &self.config
    }
}
