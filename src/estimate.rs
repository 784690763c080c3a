//! # Outer Optimizer Driver
//!
//! Bound-constrained search over the flat outer parameter vector, maximizing
//! the Laplace-approximate marginal log-likelihood produced by the engine.
//! Two strategies are selectable:
//!
//! 1. **Quasi-Newton** (`wolfe_bfgs`): consumes value and analytic gradient.
//!    Bounds are handled by projection inside the objective closure plus
//!    projected-gradient zeroing at active bounds, so the line search never
//!    chases a descent direction that points out of the feasible set.
//! 2. **Nelder-Mead simplex** (`argmin`): derivative-free, consumes the
//!    sign-flipped value only.
//!
//! The driver owns the parameter vector for the whole fit. Every objective
//! evaluation updates a best-iterate tracker, which makes outer
//! non-convergence non-fatal: the best point seen so far becomes the result,
//! with a `NumericalNonConvergence` warning attached. On termination the
//! engine is invoked once more at the optimum requesting the gradient and
//! the full Hessian, and the fitted-model artifact is assembled.

use crate::diagnostics::assemble_fitted_model;
use crate::likelihood::{EvalRequest, MarginalEngine};
use crate::loadings::StructuralMismatch;
use crate::model::{ConfigurationError, FitWarning, FittedModel, ModelStructure};
use crate::pirls::InnerOptions;
use crate::types::ParameterVector;
use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use ndarray::Array1;
use std::cell::RefCell;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// A comprehensive error type for the model estimation process. Only
/// configuration, structural and linear-algebra failures abort a fit;
/// numerical-quality issues travel as `FitWarning`s instead.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("invalid model configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("loading template incompatible with the grouping structure: {0}")]
    StructuralMismatch(#[from] StructuralMismatch),

    #[error(
        "a linear system solve failed; the penalized information matrix may be singular: {0}"
    )]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("eigendecomposition failed: {0}")]
    EigendecompositionFailed(ndarray_linalg::error::LinalgError),

    #[error("outer optimization failed: {0}")]
    OptimizerFailed(String),
}

/// Which outer search strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStrategy {
    /// Bound-constrained quasi-Newton consuming value and gradient.
    QuasiNewton,
    /// Derivative-free simplex consuming the value only.
    NelderMead,
}

/// Knobs for one fit.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub strategy: OptimizerStrategy,
    pub outer_max_iterations: u64,
    pub outer_tolerance: f64,
    pub inner: InnerOptions,
    /// Starting values; the structure's defaults when absent. Values outside
    /// the bounds are clamped, not rejected.
    pub initial: Option<ParameterVector>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            strategy: OptimizerStrategy::QuasiNewton,
            outer_max_iterations: 200,
            outer_tolerance: 1e-6,
            inner: InnerOptions::default(),
            initial: None,
        }
    }
}

/// Best-iterate bookkeeping across objective evaluations.
struct Tracker {
    best_value: f64,
    best_params: Array1<f64>,
    trace: Vec<f64>,
    evaluations: usize,
}

impl Tracker {
    fn new(initial: &Array1<f64>) -> Self {
        Self {
            best_value: f64::NEG_INFINITY,
            best_params: initial.clone(),
            trace: Vec::new(),
            evaluations: 0,
        }
    }

    fn record(&mut self, params: &Array1<f64>, loglik: f64) {
        self.evaluations += 1;
        if loglik.is_finite() && loglik > self.best_value {
            self.best_value = loglik;
            self.best_params = params.clone();
        }
        self.trace.push(self.best_value);
    }
}

fn project_onto_bounds(params: &Array1<f64>, lower: &Array1<f64>) -> Array1<f64> {
    let mut out = params.clone();
    for (value, &bound) in out.iter_mut().zip(lower.iter()) {
        if *value < bound {
            *value = bound;
        }
    }
    out
}

/// The main entry point: runs the outer search and assembles the artifact.
pub fn fit(
    structure: &ModelStructure,
    options: &FitOptions,
) -> Result<FittedModel, EstimationError> {
    let layout = structure.layout();
    let bounds = layout.lower_bounds(&structure.covariance().theta_diag_flags());

    log::info!(
        "Starting fit: {} observations, {} parameters ({} theta, {} beta, {} lambda, {} weights)",
        structure.n_obs(),
        layout.total(),
        layout.theta.len(),
        layout.beta.len(),
        layout.lambda.len(),
        layout.weights.len(),
    );

    let mut warnings = Vec::new();
    let supplied = match &options.initial {
        Some(initial) => {
            if initial.len() != layout.total() {
                return Err(ConfigurationError::DimensionMismatch {
                    what: "initial parameter vector",
                    expected: layout.total(),
                    found: initial.len(),
                }
                .into());
            }
            initial.clone()
        }
        None => structure.default_initial(),
    };

    // Bounds violations in the starting values are corrected, not fatal.
    let mut clamped_indices = Vec::new();
    for i in 0..supplied.len() {
        if supplied[i] < bounds[i] {
            clamped_indices.push(i);
        }
    }
    let initial = project_onto_bounds(&supplied.0, &bounds);
    if !clamped_indices.is_empty() {
        log::warn!(
            "Starting values clamped to their lower bounds at indices {:?}",
            clamped_indices
        );
        warnings.push(FitWarning::StartingValuesClamped {
            indices: clamped_indices,
        });
    }

    let engine = MarginalEngine::new(structure, options.inner.clone());
    let tracker = RefCell::new(Tracker::new(&initial));

    let (converged, iterations) = match options.strategy {
        OptimizerStrategy::QuasiNewton => {
            run_quasi_newton(&engine, &tracker, &initial, &bounds, options)
        }
        OptimizerStrategy::NelderMead => {
            run_nelder_mead(&engine, &tracker, &initial, &bounds, options)?
        }
    };

    let tracker = tracker.into_inner();
    if tracker.best_value == f64::NEG_INFINITY {
        return Err(EstimationError::OptimizerFailed(
            "no finite objective value was ever observed".to_string(),
        ));
    }
    if !converged {
        warnings.push(FitWarning::NumericalNonConvergence {
            stage: "outer optimization".to_string(),
            iterations: iterations as usize,
            last_change: f64::NAN,
        });
    }

    // One final high-fidelity evaluation at the optimum: gradient plus the
    // full (non-reduced) Hessian for standard errors and diagnostics.
    let best = ParameterVector::new(project_onto_bounds(&tracker.best_params, &bounds));
    let evaluation = engine.evaluate(&best, &EvalRequest::final_evaluation())?;
    warnings.extend(evaluation.warnings.iter().cloned());

    log::info!(
        "Fit finished: loglik {:.6}, {} objective evaluations, converged: {}",
        evaluation.loglik,
        tracker.evaluations,
        converged
    );

    assemble_fitted_model(
        structure,
        &engine,
        &best,
        &evaluation,
        converged,
        iterations,
        tracker.trace,
        warnings,
    )
}

fn run_quasi_newton(
    engine: &MarginalEngine<'_>,
    tracker: &RefCell<Tracker>,
    initial: &Array1<f64>,
    bounds: &Array1<f64>,
    options: &FitOptions,
) -> (bool, u64) {
    const ACTIVE_EPS: f64 = 1e-12;

    let cost_and_grad = |point: &Array1<f64>| -> (f64, Array1<f64>) {
        let clamped = project_onto_bounds(point, bounds);
        let params = ParameterVector::new(clamped.clone());
        match engine.evaluate(&params, &EvalRequest::with_gradient()) {
            Ok(result) => {
                tracker.borrow_mut().record(&clamped, result.loglik);
                let mut grad = match result.gradient {
                    Some(gradient) => gradient.mapv(|g| -g),
                    None => Array1::zeros(point.len()),
                };
                // Projected gradient: at an active lower bound, drop any
                // component that would push the parameter further outside.
                for i in 0..clamped.len() {
                    if clamped[i] <= bounds[i] + ACTIVE_EPS && grad[i] > 0.0 {
                        grad[i] = 0.0;
                    }
                }
                let cost = if result.loglik.is_finite() {
                    -result.loglik
                } else {
                    1e10
                };
                (cost, grad)
            }
            Err(error) => {
                log::warn!("objective evaluation failed: {error}; returning a large finite cost");
                (1e10, Array1::zeros(point.len()))
            }
        }
    };

    match Bfgs::new(initial.clone(), cost_and_grad)
        .with_tolerance(options.outer_tolerance)
        .with_max_iterations(options.outer_max_iterations as usize)
        .run()
    {
        Ok(BfgsSolution { iterations, .. }) => (true, iterations as u64),
        Err(error) => {
            log::warn!("quasi-Newton search did not converge: {error:?}; keeping the best iterate");
            let evaluations = tracker.borrow().evaluations as u64;
            (false, evaluations)
        }
    }
}

struct SimplexProblem<'a, 'b> {
    engine: &'b MarginalEngine<'a>,
    bounds: &'b Array1<f64>,
    tracker: &'b RefCell<Tracker>,
}

impl CostFunction for SimplexProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, point: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let raw = Array1::from_vec(point.clone());
        let clamped = project_onto_bounds(&raw, self.bounds);
        let params = ParameterVector::new(clamped.clone());
        match self.engine.evaluate(&params, &EvalRequest::value_only()) {
            Ok(result) => {
                self.tracker.borrow_mut().record(&clamped, result.loglik);
                // The simplex minimizes while the engine maximizes.
                if result.loglik.is_finite() {
                    Ok(-result.loglik)
                } else {
                    Ok(1e10)
                }
            }
            Err(error) => {
                log::warn!("objective evaluation failed: {error}; returning a large finite cost");
                Ok(1e10)
            }
        }
    }
}

fn run_nelder_mead(
    engine: &MarginalEngine<'_>,
    tracker: &RefCell<Tracker>,
    initial: &Array1<f64>,
    bounds: &Array1<f64>,
    options: &FitOptions,
) -> Result<(bool, u64), EstimationError> {
    let dim = initial.len();
    let mut simplex = Vec::with_capacity(dim + 1);
    simplex.push(initial.to_vec());
    for i in 0..dim {
        let mut vertex = initial.to_vec();
        vertex[i] += 0.25 * vertex[i].abs().max(1.0);
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(options.outer_tolerance)
        .map_err(|e| EstimationError::OptimizerFailed(format!("invalid simplex tolerance: {e}")))?;
    let problem = SimplexProblem {
        engine,
        bounds,
        tracker,
    };

    match Executor::new(problem, solver)
        .configure(|state| state.max_iters(options.outer_max_iterations))
        .run()
    {
        Ok(result) => {
            let state = result.state();
            let converged = matches!(
                state.get_termination_status(),
                TerminationStatus::Terminated(TerminationReason::SolverConverged)
            );
            Ok((converged, state.get_iter()))
        }
        Err(error) => {
            log::warn!("simplex search failed: {error}; keeping the best iterate");
            let evaluations = tracker.borrow().evaluations as u64;
            Ok((false, evaluations))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::Family;
    use crate::model::{CovarianceTemplate, ModelInputs, SparseDesign};
    use ndarray::{Array1, Array2};

    fn small_structure() -> ModelStructure {
        let per_group = 4;
        let groups = 5;
        let n = per_group * groups;
        let triplets: Vec<(usize, usize, f64)> =
            (0..n).map(|i| (i / per_group, i, 1.0)).collect();
        let zt = SparseDesign::from_triplets(groups, n, &triplets).unwrap();
        let y = Array1::from_shape_fn(n, |i| {
            0.5 + ((i / per_group) as f64 - 2.0) * 0.6 + 0.2 * ((i % per_group) as f64 - 1.5)
        });
        ModelStructure::new(ModelInputs {
            y,
            trials: None,
            x: Array2::ones((n, 1)),
            x_names: vec!["(Intercept)".to_string()],
            zt,
            covariance: CovarianceTemplate::shared_diagonal(groups),
            factor_blocks: vec![],
            weight_groupings: vec![],
            families: vec![Family::Gaussian],
        })
        .unwrap()
    }

    #[test]
    fn best_loglik_trace_is_non_decreasing() {
        let structure = small_structure();
        let fitted = fit(&structure, &FitOptions::default()).unwrap();
        for window in fitted.loglik_trace.windows(2) {
            assert!(
                window[1] >= window[0],
                "best log-likelihood decreased: {} -> {}",
                window[0],
                window[1]
            );
        }
        assert!(fitted.loglik >= *fitted.loglik_trace.last().unwrap() - 1e-9);
    }

    #[test]
    fn out_of_bounds_starting_values_are_clamped_with_a_warning() {
        let structure = small_structure();
        let mut options = FitOptions::default();
        options.initial = Some(ParameterVector::new(ndarray::array![-2.0, 0.0]));
        let fitted = fit(&structure, &options).unwrap();
        assert!(fitted
            .warnings
            .iter()
            .any(|w| matches!(w, FitWarning::StartingValuesClamped { indices } if indices == &vec![0])));
        assert!(fitted.loglik.is_finite());
    }

    #[test]
    fn quasi_newton_and_simplex_agree_on_a_gaussian_model() {
        let structure = small_structure();
        let newton = fit(&structure, &FitOptions::default()).unwrap();
        let mut options = FitOptions::default();
        options.strategy = OptimizerStrategy::NelderMead;
        options.outer_max_iterations = 500;
        let simplex = fit(&structure, &options).unwrap();
        assert!(
            (newton.loglik - simplex.loglik).abs() < 1e-3,
            "strategies disagree: {} vs {}",
            newton.loglik,
            simplex.loglik
        );
    }

    #[test]
    fn wrong_initial_length_is_a_configuration_error() {
        let structure = small_structure();
        let mut options = FitOptions::default();
        options.initial = Some(ParameterVector::zeros(5));
        let err = fit(&structure, &options).unwrap_err();
        assert!(matches!(err, EstimationError::Configuration(_)));
    }
}
