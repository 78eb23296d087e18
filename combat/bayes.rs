use crate::estimate::CombatError;
use crate::priors::SitePrior;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Stopping rule of the fixed-point iteration.
#[derive(Debug, Clone, Copy)]
pub struct SolverSettings {
    /// Largest relative change of any gamma or delta that counts as converged.
    pub tolerance: f64,
    /// Hard ceiling on iterations per site.
    pub max_iterations: usize,
}

/// Shrunk parameters of one site.
#[derive(Debug, Clone)]
pub struct SiteSolution {
    pub gamma: Array1<f64>,
    pub delta: Array1<f64>,
    pub iterations: usize,
}

/// Conditional posterior mean of gamma given the current delta.
fn posterior_mean(gamma_hat: f64, gamma_bar: f64, n: f64, delta: f64, tau_2: f64) -> f64 {
    (tau_2 * n * gamma_hat + delta * gamma_bar) / (tau_2 * n + delta)
}

/// Conditional posterior mode of delta given the current gamma.
fn posterior_variance(sum_sq: f64, n: f64, a_prior: f64, b_prior: f64) -> f64 {
    (0.5 * sum_sq + b_prior) / (n / 2.0 + a_prior - 1.0)
}

/// `|new - old| / |old|`, falling back to the absolute change when `old` is zero.
fn relative_change(new: f64, old: f64) -> f64 {
    let diff = (new - old).abs();
    if old == 0.0 { diff } else { diff / old.abs() }
}

/// Alternates conditional updates of `(gamma, delta)` for one site until the largest
/// relative change across features falls below the tolerance.
///
/// `site_data` holds the standardized samples of this site, `[n_site, n_features]`.
/// Non-finite entries are treated as missing: they are excluded from the per-feature
/// count `n` and from the residual sums. [`fit_model`](crate::fit_model) rejects
/// non-finite input up front, so only direct callers of this function reach that path.
pub fn solve_site(
    site_data: ArrayView2<'_, f64>,
    gamma_hat: ArrayView1<'_, f64>,
    delta_hat: ArrayView1<'_, f64>,
    prior: &SitePrior,
    site_name: &str,
    settings: &SolverSettings,
) -> Result<SiteSolution, CombatError> {
    let counts: Array1<f64> = site_data
        .axis_iter(Axis(1))
        .map(|column| column.iter().filter(|v| v.is_finite()).count() as f64)
        .collect();

    let mut gamma_old = gamma_hat.to_owned();
    let mut delta_old = delta_hat.to_owned();
    let mut last_change = f64::INFINITY;

    for iteration in 1..=settings.max_iterations {
        let gamma_new = Zip::from(&gamma_hat)
            .and(&counts)
            .and(&delta_old)
            .map_collect(|&g, &n, &d| posterior_mean(g, prior.gamma_bar, n, d, prior.tau_2));

        let delta_new: Array1<f64> = site_data
            .axis_iter(Axis(1))
            .zip(gamma_new.iter())
            .zip(counts.iter())
            .map(|((column, &g), &n)| {
                let sum_sq: f64 = column
                    .iter()
                    .filter(|v| v.is_finite())
                    .map(|&v| (v - g) * (v - g))
                    .sum();
                posterior_variance(sum_sq, n, prior.a_prior, prior.b_prior)
            })
            .collect();

        let gamma_change = Zip::from(&gamma_new)
            .and(&gamma_old)
            .fold(0.0_f64, |acc, &new, &old| acc.max(relative_change(new, old)));
        let delta_change = Zip::from(&delta_new)
            .and(&delta_old)
            .fold(0.0_f64, |acc, &new, &old| acc.max(relative_change(new, old)));
        last_change = gamma_change.max(delta_change);

        gamma_old = gamma_new;
        delta_old = delta_new;

        if last_change < settings.tolerance {
            log::debug!(
                "Site '{}' converged after {} iterations (change {:.3e}).",
                site_name,
                iteration,
                last_change
            );
            return Ok(SiteSolution {
                gamma: gamma_old,
                delta: delta_old,
                iterations: iteration,
            });
        }
    }

    Err(CombatError::NonConvergence {
        site: site_name.to_string(),
        max_iterations: settings.max_iterations,
        last_change,
    })
}

/// Runs [`solve_site`] for every site and stacks the results into
/// `(gamma_star, delta_star)`, each `[n_sites, n_features]`.
pub fn shrink_sites(
    standardized: ArrayView2<'_, f64>,
    partition: &[Vec<usize>],
    gamma_hat: ArrayView2<'_, f64>,
    delta_hat: ArrayView2<'_, f64>,
    priors: &[SitePrior],
    site_names: &[String],
    settings: &SolverSettings,
) -> Result<(Array2<f64>, Array2<f64>), CombatError> {
    let mut gamma_star = Array2::zeros(gamma_hat.raw_dim());
    let mut delta_star = Array2::zeros(delta_hat.raw_dim());

    for (site, rows) in partition.iter().enumerate() {
        let site_data = standardized.select(Axis(0), rows);
        let solution = solve_site(
            site_data.view(),
            gamma_hat.row(site),
            delta_hat.row(site),
            &priors[site],
            &site_names[site],
            settings,
        )?;
        gamma_star.row_mut(site).assign(&solution.gamma);
        delta_star.row_mut(site).assign(&solution.delta);
    }

    Ok((gamma_star, delta_star))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn settings() -> SolverSettings {
        SolverSettings {
            tolerance: 1e-10,
            max_iterations: 1000,
        }
    }

    fn site_data() -> Array2<f64> {
        array![
            [1.2, -0.4, 0.3],
            [0.8, 0.1, -0.9],
            [1.9, -1.2, 0.2],
            [0.4, 0.6, -0.1]
        ]
    }

    #[test]
    fn test_solution_is_a_fixed_point() {
        let data = site_data();
        let gamma_hat = data.mean_axis(Axis(0)).unwrap();
        let delta_hat = data.var_axis(Axis(0), 1.0);
        let prior = SitePrior {
            gamma_bar: 0.1,
            tau_2: 0.5,
            a_prior: 4.0,
            b_prior: 2.5,
        };
        let solution = solve_site(
            data.view(),
            gamma_hat.view(),
            delta_hat.view(),
            &prior,
            "A",
            &settings(),
        )
        .unwrap();
        assert!(solution.iterations > 1);

        for j in 0..3 {
            let g = posterior_mean(gamma_hat[j], prior.gamma_bar, 4.0, solution.delta[j], prior.tau_2);
            assert_abs_diff_eq!(solution.gamma[j], g, epsilon = 1e-8);
            let sum_sq: f64 = data.column(j).iter().map(|v| (v - g) * (v - g)).sum();
            let d = posterior_variance(sum_sq, 4.0, prior.a_prior, prior.b_prior);
            assert_abs_diff_eq!(solution.delta[j], d, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_gamma_is_pulled_toward_prior_mean() {
        let data = site_data();
        let gamma_hat = data.mean_axis(Axis(0)).unwrap();
        let delta_hat = data.var_axis(Axis(0), 1.0);
        let prior = SitePrior {
            gamma_bar: 0.0,
            tau_2: 0.05,
            a_prior: 3.0,
            b_prior: 1.0,
        };
        let solution = solve_site(
            data.view(),
            gamma_hat.view(),
            delta_hat.view(),
            &prior,
            "A",
            &settings(),
        )
        .unwrap();
        for j in 0..3 {
            assert!(solution.gamma[j].abs() < gamma_hat[j].abs());
            assert_eq!(solution.gamma[j].signum(), gamma_hat[j].signum());
        }
    }

    #[test]
    fn test_missing_values_are_not_counted() {
        let data = array![[1.0, 2.0], [f64::NAN, 4.0], [3.0, 0.0]];
        let prior = SitePrior {
            gamma_bar: 0.0,
            tau_2: 1e12,
            a_prior: 3.0,
            b_prior: 1.0,
        };
        let solution = solve_site(
            data.view(),
            array![2.0, 2.0].view(),
            array![2.0, 4.0].view(),
            &prior,
            "A",
            &settings(),
        )
        .unwrap();
        // A very flat location prior leaves gamma at the naive mean.
        assert_abs_diff_eq!(solution.gamma[0], 2.0, epsilon = 1e-6);
        // n = 2 for the first feature: (0.5 * 2 + 1) / (1 + 3 - 1).
        assert_abs_diff_eq!(solution.delta[0], 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_iteration_ceiling() {
        let data = site_data();
        let gamma_hat = data.mean_axis(Axis(0)).unwrap();
        let delta_hat = data.var_axis(Axis(0), 1.0);
        let prior = SitePrior {
            gamma_bar: 0.1,
            tau_2: 0.5,
            a_prior: 4.0,
            b_prior: 2.5,
        };
        let tight = SolverSettings {
            tolerance: 1e-10,
            max_iterations: 2,
        };
        let err = solve_site(
            data.view(),
            gamma_hat.view(),
            delta_hat.view(),
            &prior,
            "S1",
            &tight,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CombatError::NonConvergence { ref site, max_iterations: 2, .. } if site == "S1"
        ));
    }

    #[test]
    fn test_relative_change_handles_zero() {
        assert_abs_diff_eq!(relative_change(0.5, 0.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(relative_change(-1.1, -1.0), 0.1, epsilon = 1e-12);
    }
}
