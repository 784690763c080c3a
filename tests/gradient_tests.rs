//! Analytic-versus-finite-difference gradient verification.
//!
//! The engine's gradient differentiates through the inner conditional-modes
//! solve; these tests compare every component against central finite
//! differences of the evaluated log-likelihood, on models that exercise all
//! four parameter segments for both engine paths (profiled Gaussian and
//! general Laplace).

use approx::assert_relative_eq;
use lodestar::{
    CovarianceTemplate, EvalRequest, Family, FactorBlock, InnerOptions, InteractionSpec,
    LoadingTemplate, MarginalEngine, ModelInputs, ModelStructure, ParameterVector, SparseDesign,
};
use ndarray::{Array1, Array2};

fn tight_inner() -> InnerOptions {
    InnerOptions {
        max_iterations: 200,
        tolerance: 1e-13,
    }
}

fn finite_difference_gradient(
    engine: &MarginalEngine<'_>,
    params: &ParameterVector,
) -> Array1<f64> {
    let mut fd = Array1::zeros(params.len());
    for k in 0..params.len() {
        let step = 1e-5 * params[k].abs().max(1.0);
        let mut plus = params.clone();
        plus[k] += step;
        let mut minus = params.clone();
        minus[k] -= step;
        let f_plus = engine
            .evaluate(&plus, &EvalRequest::value_only())
            .unwrap()
            .loglik;
        let f_minus = engine
            .evaluate(&minus, &EvalRequest::value_only())
            .unwrap()
            .loglik;
        fd[k] = (f_plus - f_minus) / (2.0 * step);
    }
    fd
}

fn compare(analytic: &Array1<f64>, fd: &Array1<f64>, names: &[String]) {
    for k in 0..analytic.len() {
        assert_relative_eq!(analytic[k], fd[k], max_relative = 1e-3, epsilon = 1e-5);
        // Redundant with the assert, but the failure message names the entry.
        assert!(
            (analytic[k] - fd[k]).abs() <= 1e-5 + 1e-3 * analytic[k].abs().max(fd[k].abs()),
            "gradient mismatch for {}: analytic {} vs finite-difference {}",
            names[k],
            analytic[k],
            fd[k]
        );
    }
}

/// Gaussian random-intercept model with a heteroscedastic weight group:
/// exercises theta, beta and weights on the profiled-dispersion path.
#[test]
fn profiled_gaussian_gradient_matches_finite_differences() {
    let per_group = 5;
    let groups = 6;
    let n = per_group * groups;
    let triplets: Vec<(usize, usize, f64)> = (0..n).map(|i| (i / per_group, i, 1.0)).collect();
    let zt = SparseDesign::from_triplets(groups, n, &triplets).unwrap();
    let y = Array1::from_shape_fn(n, |i| {
        0.4 + 0.9 * ((i / per_group) as f64 - 2.5) / 2.5 + 0.35 * (((i * 7) % 11) as f64 / 11.0 - 0.5)
    });
    let mut x = Array2::ones((n, 2));
    for i in 0..n {
        x[[i, 1]] = (i % per_group) as f64 / per_group as f64 - 0.5;
    }
    // The second half of every group gets its own residual-variance group.
    let weight_group: Vec<Option<usize>> = (0..n)
        .map(|i| if i % per_group >= 2 { Some(0) } else { None })
        .collect();

    let structure = ModelStructure::new(ModelInputs {
        y,
        trials: None,
        x,
        x_names: vec!["(Intercept)".to_string(), "slope".to_string()],
        zt,
        covariance: CovarianceTemplate::shared_diagonal(groups),
        factor_blocks: vec![],
        weight_groupings: vec![weight_group],
        families: vec![Family::Gaussian],
    })
    .unwrap();

    let engine = MarginalEngine::new(&structure, tight_inner());
    // theta, intercept, slope, weight: every segment away from zero.
    let params = ParameterVector::new(ndarray::array![1.2, 0.3, -0.4, 1.7]);

    let analytic = engine
        .evaluate(&params, &EvalRequest::with_gradient())
        .unwrap()
        .gradient
        .unwrap();
    let fd = finite_difference_gradient(&engine, &params);
    compare(&analytic, &fd, structure.layout().names());
}

/// Mixed binomial/Gaussian latent-variable model with an anchored loading
/// template, a loading-by-covariate interaction and a weight group:
/// exercises every segment on the general Laplace path.
#[test]
fn general_laplace_gradient_matches_finite_differences() {
    let subjects = 5;
    let items = 3;
    let n = subjects * items;
    let item_of_obs: Vec<usize> = (0..n).map(|i| i % items).collect();

    // One latent coordinate per subject, loading onto all of its items.
    let triplets: Vec<(usize, usize, f64)> = (0..n).map(|i| (i / items, i, 1.0)).collect();
    let zt = SparseDesign::from_triplets(subjects, n, &triplets).unwrap();

    // Item-indicator fixed design; the third column doubles as the
    // loading-scaled covariate of the Gaussian item.
    let mut x = Array2::zeros((n, items));
    for i in 0..n {
        x[[i, item_of_obs[i]]] = 1.0;
    }

    let families: Vec<Family> = item_of_obs
        .iter()
        .map(|&item| {
            if item < 2 {
                Family::Binomial
            } else {
                Family::Gaussian
            }
        })
        .collect();

    let y = Array1::from_shape_fn(n, |i| match item_of_obs[i] {
        0 => {
            if i % 2 == 0 {
                1.0
            } else {
                0.0
            }
        }
        1 => {
            if (i / 2) % 2 == 0 {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.6 + 0.3 * ((i as f64) / (n as f64) - 0.5),
    });

    let covariate = Array2::from_shape_fn((n, 1), |(i, _)| ((i % 7) as f64) / 7.0 - 0.4);
    let template =
        LoadingTemplate::new(items, 1, vec![Some(1.0), None, None]).unwrap();
    let block = FactorBlock {
        template,
        row_of_obs: item_of_obs.clone(),
        x_cols: vec![Some(2)],
        zt_rows: vec![(0..subjects).collect()],
        interactions: vec![Some(InteractionSpec {
            covariates: covariate,
        })],
    };

    let weight_group: Vec<Option<usize>> = item_of_obs
        .iter()
        .map(|&item| if item == 2 { Some(0) } else { None })
        .collect();

    let structure = ModelStructure::new(ModelInputs {
        y,
        trials: None,
        x,
        x_names: vec![
            "item_0".to_string(),
            "item_1".to_string(),
            "item_2".to_string(),
        ],
        zt,
        covariance: CovarianceTemplate::shared_diagonal(subjects),
        factor_blocks: vec![block],
        weight_groupings: vec![weight_group],
        families,
    })
    .unwrap();

    // [theta | beta x3 | lambda x2 | lambda_interaction | weights]
    assert_eq!(structure.layout().total(), 8);

    let engine = MarginalEngine::new(&structure, tight_inner());
    let params = ParameterVector::new(ndarray::array![
        0.8, 0.3, -0.2, 0.5, 1.3, 0.7, 0.25, 1.6
    ]);

    let analytic = engine
        .evaluate(&params, &EvalRequest::with_gradient())
        .unwrap()
        .gradient
        .unwrap();
    let fd = finite_difference_gradient(&engine, &params);
    compare(&analytic, &fd, structure.layout().names());
}
