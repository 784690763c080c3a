//! # Parameter Index Layout
//!
//! The outer parameter vector is a single flat array split into four
//! contiguous segments, always in the order `[theta | beta | lambda |
//! weights]`. The layout is computed once from the model structure and never
//! changes during a fit; every component that touches the flat vector goes
//! through it rather than hard-coding offsets.

use crate::types::ParameterVector;
use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Segment boundaries and per-entry names for the outer parameter vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterLayout {
    pub theta: Range<usize>,
    pub beta: Range<usize>,
    pub lambda: Range<usize>,
    /// Plain free loadings, a prefix of `lambda`.
    pub lambda_main: Range<usize>,
    /// Loading-by-covariate interaction coefficients, the rest of `lambda`.
    pub lambda_interaction: Range<usize>,
    pub weights: Range<usize>,
    names: Vec<String>,
}

impl ParameterLayout {
    /// Builds the layout from the four segment sizes. Zero-length segments
    /// are valid (a model without a weights formula has an empty `weights`
    /// segment).
    pub fn new(
        n_theta: usize,
        beta_names: &[String],
        n_lambda_main: usize,
        n_lambda_interaction: usize,
        n_weights: usize,
    ) -> Self {
        let n_beta = beta_names.len();
        let theta = 0..n_theta;
        let beta = theta.end..theta.end + n_beta;
        let lambda_main = beta.end..beta.end + n_lambda_main;
        let lambda_interaction = lambda_main.end..lambda_main.end + n_lambda_interaction;
        let lambda = lambda_main.start..lambda_interaction.end;
        let weights = lambda.end..lambda.end + n_weights;

        let mut names = Vec::with_capacity(weights.end);
        for i in 0..n_theta {
            names.push(format!("theta_{i}"));
        }
        names.extend(beta_names.iter().cloned());
        for i in 0..n_lambda_main {
            names.push(format!("lambda_{i}"));
        }
        for i in 0..n_lambda_interaction {
            names.push(format!("lambda_interaction_{i}"));
        }
        for i in 0..n_weights {
            names.push(format!("weights_{i}"));
        }
        debug_assert_eq!(names.len(), weights.end);

        Self {
            theta,
            beta,
            lambda,
            lambda_main,
            lambda_interaction,
            weights,
            names,
        }
    }

    /// Total length of the outer parameter vector.
    pub fn total(&self) -> usize {
        self.weights.end
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn theta_slice<'a>(&self, params: &'a ParameterVector) -> ArrayView1<'a, f64> {
        params.0.slice(s![self.theta.clone()])
    }

    pub fn beta_slice<'a>(&self, params: &'a ParameterVector) -> ArrayView1<'a, f64> {
        params.0.slice(s![self.beta.clone()])
    }

    pub fn lambda_slice<'a>(&self, params: &'a ParameterVector) -> ArrayView1<'a, f64> {
        params.0.slice(s![self.lambda.clone()])
    }

    pub fn weights_slice<'a>(&self, params: &'a ParameterVector) -> ArrayView1<'a, f64> {
        params.0.slice(s![self.weights.clone()])
    }

    /// Per-parameter lower bounds: non-negative for theta entries mapped to a
    /// diagonal template position and for the weights segment, unbounded
    /// elsewhere.
    pub fn lower_bounds(&self, theta_diag: &[bool]) -> Array1<f64> {
        let mut bounds = Array1::from_elem(self.total(), f64::NEG_INFINITY);
        for (offset, &diag) in theta_diag.iter().enumerate() {
            if diag {
                bounds[self.theta.start + offset] = 0.0;
            }
        }
        for idx in self.weights.clone() {
            bounds[idx] = 0.0;
        }
        bounds
    }
}
