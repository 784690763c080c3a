//! # Downstream Numeric Outputs
//!
//! Residuals, fitted values and degrees-of-freedom bookkeeping consumed by
//! the excluded summary/plot collaborators, plus the assembly of the final
//! `FittedModel` artifact from the best parameter vector and the one
//! high-fidelity engine evaluation performed after the outer search stops.

use crate::estimate::EstimationError;
use crate::likelihood::{EvaluationResult, MarginalEngine};
use crate::model::{FitWarning, FittedModel, ModelStructure};
use crate::types::ParameterVector;
use ndarray::{Array1, Array2};

/// Pearson residuals `(y - mu) / sqrt(Var(y))` at a fitted linear predictor.
pub fn pearson_residuals(
    structure: &ModelStructure,
    eta: &Array1<f64>,
    omega: &Array1<f64>,
    dispersion: f64,
) -> Array1<f64> {
    Array1::from_shape_fn(structure.n_obs(), |i| {
        let family = structure.family(i);
        let mu = family.mean(eta[i]);
        family.pearson_residual(
            structure.y()[i],
            mu,
            structure.trial_count(i),
            omega[i],
            dispersion,
        )
    })
}

/// Signed-root deviance residuals at a fitted linear predictor.
pub fn deviance_residuals(
    structure: &ModelStructure,
    eta: &Array1<f64>,
    omega: &Array1<f64>,
    dispersion: f64,
) -> Array1<f64> {
    Array1::from_shape_fn(structure.n_obs(), |i| {
        let family = structure.family(i);
        let mu = family.mean(eta[i]);
        family.deviance_residual(
            structure.y()[i],
            mu,
            structure.trial_count(i),
            omega[i],
            dispersion,
        )
    })
}

/// Total degrees of freedom: one per outer parameter, plus one for the
/// profiled residual dispersion when the model is all-Gaussian.
pub fn degrees_of_freedom(structure: &ModelStructure) -> usize {
    structure.layout().total() + usize::from(structure.all_gaussian())
}

/// Builds the final artifact. Called exactly once per fit, after the outer
/// optimizer has terminated and the engine has produced its final
/// gradient-and-Hessian evaluation at the optimum.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assemble_fitted_model(
    structure: &ModelStructure,
    engine: &MarginalEngine<'_>,
    params: &ParameterVector,
    evaluation: &EvaluationResult,
    converged: bool,
    iterations: u64,
    loglik_trace: Vec<f64>,
    warnings: Vec<FitWarning>,
) -> Result<FittedModel, EstimationError> {
    let layout = structure.layout();
    let (fitted_fixed, fitted, omega, lower) = engine.final_state(params)?;
    let fitted_fixed = fitted_fixed.into_inner();
    let fitted = fitted.into_inner();
    let mode_original = lower.dot(&evaluation.mode);

    let pearson = pearson_residuals(structure, &fitted, &omega, evaluation.dispersion);
    let deviance = deviance_residuals(structure, &fitted, &omega, evaluation.dispersion);

    let gradient = evaluation
        .gradient
        .clone()
        .unwrap_or_else(|| Array1::zeros(layout.total()));
    let hessian = evaluation
        .hessian
        .clone()
        .unwrap_or_else(|| Array2::zeros((layout.total(), layout.total())));

    Ok(FittedModel {
        names: layout.names().to_vec(),
        parameters: params.0.clone(),
        loglik: evaluation.loglik,
        dispersion: evaluation.dispersion,
        gradient,
        hessian,
        mode_standardized: evaluation.mode.clone(),
        mode_original,
        fitted,
        fitted_fixed,
        pearson_residuals: pearson,
        deviance_residuals: deviance,
        degrees_of_freedom: degrees_of_freedom(structure),
        converged,
        iterations,
        loglik_trace,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::Family;
    use crate::model::{CovarianceTemplate, ModelInputs, SparseDesign};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn structure_with_families(families: Vec<Family>) -> ModelStructure {
        let n = 4;
        let zt = SparseDesign::from_triplets(
            2,
            n,
            &[(0, 0, 1.0), (0, 1, 1.0), (1, 2, 1.0), (1, 3, 1.0)],
        )
        .unwrap();
        ModelStructure::new(ModelInputs {
            y: array![0.5, 0.5, 1.0, 0.0],
            trials: None,
            x: Array2::ones((n, 1)),
            x_names: vec!["(Intercept)".to_string()],
            zt,
            covariance: CovarianceTemplate::shared_diagonal(2),
            factor_blocks: vec![],
            weight_groupings: vec![],
            families,
        })
        .unwrap()
    }

    #[test]
    fn gaussian_pearson_residuals_vanish_at_a_perfect_fit() {
        let structure = structure_with_families(vec![Family::Gaussian]);
        let eta = structure.y().clone();
        let omega = Array1::ones(4);
        let residuals = pearson_residuals(&structure, &eta, &omega, 1.0);
        for r in residuals.iter() {
            assert_abs_diff_eq!(*r, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn degrees_of_freedom_counts_the_profiled_dispersion() {
        let gaussian = structure_with_families(vec![Family::Gaussian]);
        // theta_0 and the intercept, plus the profiled dispersion.
        assert_eq!(degrees_of_freedom(&gaussian), 3);

        let binomial = structure_with_families(vec![Family::Binomial]);
        assert_eq!(degrees_of_freedom(&binomial), 2);
    }

    #[test]
    fn deviance_residual_signs_follow_the_raw_residual() {
        let structure = structure_with_families(vec![Family::Binomial]);
        let eta = array![0.0, 0.0, 0.0, 0.0];
        let omega = Array1::ones(4);
        let residuals = deviance_residuals(&structure, &eta, &omega, 1.0);
        // y = 1 above mu = 0.5 gives a positive residual, y = 0 a negative one.
        assert!(residuals[2] > 0.0);
        assert!(residuals[3] < 0.0);
    }
}
