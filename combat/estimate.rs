use crate::adjust::ensure_positive_scales;
use crate::bayes::{SolverSettings, shrink_sites};
use crate::data::CombatInput;
use crate::design::{DesignEncoders, partition_by_site};
use crate::location_scale::fit_location_scale;
use crate::model::{CombatConfig, FittedModel};
use crate::priors::estimate_priors;
use crate::standardize::{expected_mean, fit_standardization, standardize};
use ndarray::s;
use thiserror::Error;

/// Every way a fit or a transform can fail.
///
/// All variants are raised eagerly at the point of violation. There is no degraded
/// mode: either the whole pipeline succeeds or the caller receives one of these.
#[derive(Error, Debug)]
pub enum CombatError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error(
        "Non-finite value (NaN or Infinity) found in {argument} at row {row}, column {column}. All inputs must be finite."
    )]
    NonFiniteInput {
        argument: &'static str,
        row: usize,
        column: usize,
    },

    #[error("Values not seen during fit were found in {encoder}: {}", .values.join(", "))]
    UnseenCategory {
        encoder: String,
        values: Vec<String>,
    },

    #[error(
        "Site '{site}' has only {found} sample(s); at least 2 are required to estimate its variance."
    )]
    InsufficientSamples { site: String, found: usize },

    #[error("Harmonization needs at least 2 distinct sites, but only {found} was found.")]
    InsufficientSites { found: usize },

    #[error(
        "The design matrix is rank deficient (column {column} is linearly dependent on earlier columns). Check for covariates that duplicate site membership."
    )]
    DegenerateDesign { column: usize },

    #[error("Numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    #[error(
        "The empirical Bayes solver did not converge for site '{site}' within {max_iterations} iterations. Last relative change was {last_change:.6e}."
    )]
    NonConvergence {
        site: String,
        max_iterations: usize,
        last_change: f64,
    },

    #[error("The transformer has not been fitted. Call `fit` before `transform`.")]
    NotFitted,

    #[error(
        "{kind} covariates were {} at fit time but {} now.",
        presence_at_fit(.at_fit),
        presence_now(.at_fit)
    )]
    CovariateMismatch { kind: &'static str, at_fit: bool },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A linear algebra routine failed: {0}")]
    LinearAlgebra(#[from] ndarray_linalg::error::LinalgError),
}

fn presence_at_fit(at_fit: &bool) -> &'static str {
    if *at_fit { "supplied" } else { "absent" }
}

fn presence_now(at_fit: &bool) -> &'static str {
    presence_at_fit(&!*at_fit)
}

/// The main entry point for fitting. Runs the full ComBat estimation pipeline and
/// returns the complete fitted state, which is only ever produced whole.
pub fn fit_model(
    input: &CombatInput<'_>,
    config: &CombatConfig,
) -> Result<FittedModel, CombatError> {
    config.validate()?;
    input.validate()?;

    let n_samples = input.n_samples();
    let n_features = input.n_features();

    // 1. Encoders and the design matrix.
    let encoders = DesignEncoders::fit(input);
    let n_sites = encoders.n_sites();
    if n_sites < 2 {
        return Err(CombatError::InsufficientSites { found: n_sites });
    }
    let design = encoders.build(input)?;
    let site_of_sample = encoders.site_indices(input.sites())?;
    let partition = partition_by_site(&site_of_sample, n_sites);

    let site_names = encoders.site_names();
    for (site, rows) in partition.iter().enumerate() {
        if rows.len() < 2 {
            return Err(CombatError::InsufficientSamples {
                site: site_names[site].clone(),
                found: rows.len(),
            });
        }
    }
    let site_counts: Vec<usize> = partition.iter().map(Vec::len).collect();

    log::info!(
        "Fitting ComBat on {} samples, {} features, {} sites (design width {}).",
        n_samples,
        n_features,
        n_sites,
        design.ncols()
    );

    // 2. Standardize features against the full design.
    let standardization =
        fit_standardization(input.features(), design.view(), n_sites, &site_counts)?;
    let mean = expected_mean(
        design.view(),
        standardization.beta_hat.view(),
        standardization.grand_mean.view(),
        n_sites,
    );
    let standardized = standardize(
        input.features(),
        mean.view(),
        standardization.var_pooled.view(),
    );

    // 3. Naive per-site location/scale estimates.
    let naive = fit_location_scale(
        standardized.view(),
        design.slice(s![.., ..n_sites]),
        &partition,
    )?;

    // 4. Empirical Bayes shrinkage.
    let (gamma_star, delta_star) = if !config.empirical_bayes {
        log::info!("Empirical Bayes disabled; using location/scale estimates directly.");
        (naive.gamma_hat, naive.delta_hat)
    } else if n_features < 2 {
        log::warn!(
            "Priors are not identifiable from a single feature; skipping empirical Bayes shrinkage."
        );
        (naive.gamma_hat, naive.delta_hat)
    } else {
        let priors = estimate_priors(naive.gamma_hat.view(), naive.delta_hat.view(), site_names)?;
        let settings = SolverSettings {
            tolerance: config.convergence_tolerance,
            max_iterations: config.max_iterations,
        };
        shrink_sites(
            standardized.view(),
            &partition,
            naive.gamma_hat.view(),
            naive.delta_hat.view(),
            &priors,
            site_names,
            &settings,
        )?
    };
    ensure_positive_scales(delta_star.view(), site_names)?;

    log::info!("ComBat fit complete.");

    Ok(FittedModel::new(
        config.clone(),
        encoders,
        standardization,
        gamma_star,
        delta_star,
    ))
}
