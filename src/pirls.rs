//! # Inner Conditional-Modes Solver
//!
//! Penalized iteratively reweighted least squares over the standardized
//! random/latent effects `u`, for fixed outer parameters. The penalty is the
//! identity quadratic `u'u` of the standardized parametrization, so the
//! normal equations are `(A' W A + I) step = A' s - u` with `A` the
//! loading-materialized random-effect design times the covariance Cholesky
//! factor.
//!
//! For a model where every observation is Gaussian with identity link the
//! penalized least-squares problem is quadratic and the solver runs exactly
//! one iteration: the closed-form solution needs no reweighting. Failing to
//! reach tolerance within the iteration cap is not fatal here; the caller
//! attaches a `NumericalNonConvergence` warning and keeps the last mode.

use crate::estimate::EstimationError;
use crate::model::ModelStructure;
use ndarray::{Array1, Array2};
use ndarray_linalg::Solve;

/// Iteration cap and tolerance for the inner solve.
#[derive(Debug, Clone)]
pub struct InnerOptions {
    pub max_iterations: usize,
    /// Relative penalized-deviance change below which the solve stops.
    pub tolerance: f64,
}

impl Default for InnerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

/// The converged (or best-available) state of one inner solve.
#[derive(Debug, Clone)]
pub struct InnerFit {
    /// Conditional mode in the standardized parametrization.
    pub mode: Array1<f64>,
    /// `-2 sum(log p(y_i | eta_i)) + u'u` at the mode, up to family
    /// constants.
    pub penalized_deviance: f64,
    pub iterations: usize,
    pub converged: bool,
    pub last_change: f64,
}

/// Finds the posterior mode of the standardized effects for fixed outer
/// parameters.
pub fn solve_conditional_modes(
    structure: &ModelStructure,
    a: &Array2<f64>,
    fixed_eta: &Array1<f64>,
    omega: &Array1<f64>,
    options: &InnerOptions,
    warm_start: Option<&Array1<f64>>,
) -> Result<InnerFit, EstimationError> {
    let q = a.ncols();

    if structure.all_gaussian() {
        // Quadratic objective: one exact penalized least-squares solve.
        let w: Array1<f64> = omega.mapv(|o| 1.0 / o);
        let a_t_w = &a.t() * &w;
        let mut normal = a_t_w.dot(a);
        normal.diag_mut().mapv_inplace(|d| d + 1.0);
        let rhs = a_t_w.dot(&(structure.y() - fixed_eta));
        let mode = normal
            .solve_into(rhs)
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        let penalized_deviance = penalized_deviance(structure, a, fixed_eta, omega, &mode);
        return Ok(InnerFit {
            mode,
            penalized_deviance,
            iterations: 1,
            converged: true,
            last_change: 0.0,
        });
    }

    let mut u = match warm_start {
        Some(start) if start.len() == q && start.iter().all(|v| v.is_finite()) => start.clone(),
        _ => Array1::zeros(q),
    };
    let mut pen_dev = penalized_deviance(structure, a, fixed_eta, omega, &u);
    if !pen_dev.is_finite() {
        // A stale warm start can land outside the family's safe range.
        u = Array1::zeros(q);
        pen_dev = penalized_deviance(structure, a, fixed_eta, omega, &u);
    }

    let n = structure.n_obs();
    let mut converged = false;
    let mut last_change = f64::INFINITY;
    let mut iterations = 0;

    for iter in 1..=options.max_iterations {
        iterations = iter;
        let eta = fixed_eta + &a.dot(&u);
        let mut s = Array1::zeros(n);
        let mut w = Array1::zeros(n);
        for i in 0..n {
            let family = structure.family(i);
            let mu = family.mean(eta[i]);
            s[i] = family.score(structure.y()[i], mu, structure.trial_count(i), omega[i]);
            w[i] = family.info_weight(mu, structure.trial_count(i), omega[i]);
        }
        if !s.iter().all(|v| v.is_finite()) || !w.iter().all(|v| v.is_finite()) {
            log::warn!("inner solve: non-finite working quantities at iteration {iter}");
            break;
        }

        let a_t_w = &a.t() * &w;
        let mut normal = a_t_w.dot(a);
        normal.diag_mut().mapv_inplace(|d| d + 1.0);
        let grad = a.t().dot(&s) - &u;
        let step = normal
            .solve_into(grad)
            .map_err(EstimationError::LinearSystemSolveFailed)?;

        // Step-halving keeps the penalized deviance monotone.
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..12 {
            let candidate = &u + &(&step * scale);
            let candidate_dev =
                penalized_deviance(structure, a, fixed_eta, omega, &candidate);
            if candidate_dev.is_finite() && candidate_dev <= pen_dev + 1e-12 {
                accepted = Some((candidate, candidate_dev));
                break;
            }
            scale *= 0.5;
        }
        let Some((new_u, new_dev)) = accepted else {
            log::warn!(
                "inner solve: step halving failed to improve the penalized deviance at iteration {iter}"
            );
            break;
        };

        last_change = (pen_dev - new_dev).abs() / (new_dev.abs() + 0.1);
        u = new_u;
        pen_dev = new_dev;
        if last_change < options.tolerance {
            converged = true;
            break;
        }
    }

    Ok(InnerFit {
        mode: u,
        penalized_deviance: pen_dev,
        iterations,
        converged,
        last_change,
    })
}

/// `-2 sum(log p) + u'u`, the objective the inner iterations monotonically
/// decrease.
pub fn penalized_deviance(
    structure: &ModelStructure,
    a: &Array2<f64>,
    fixed_eta: &Array1<f64>,
    omega: &Array1<f64>,
    u: &Array1<f64>,
) -> f64 {
    let eta = fixed_eta + &a.dot(u);
    let mut deviance = 0.0;
    for i in 0..structure.n_obs() {
        let family = structure.family(i);
        deviance -= 2.0
            * family.log_density(
                structure.y()[i],
                eta[i],
                structure.trial_count(i),
                omega[i],
            );
    }
    deviance + u.dot(u)
}
