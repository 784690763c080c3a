//! # Model Structure and Fitted-Model Artifact
//!
//! `ModelStructure` is the immutable numeric contract between the external
//! model-structure builder and the likelihood engine: design matrices, the
//! sparse random-effect design, the covariance Cholesky template, the
//! compiled loading map, weight-group assignments and per-observation family
//! tags. It is validated once, before any optimization starts, and every
//! validation failure is a fail-fast `ConfigurationError`.
//!
//! `FittedModel` is the artifact assembled after the outer optimization
//! terminates; it carries serde derives so downstream summary/plot
//! collaborators can persist it, but no I/O happens here.

use crate::families::Family;
use crate::layout::ParameterLayout;
use crate::loadings::{build_loading_map, FactorBlock, LoadingMap};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structurally invalid model input. Always fatal, always raised before
/// the first likelihood evaluation.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("the model has no observations")]
    EmptyData,
    #[error("{what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("family tags must number one (shared) or one per observation; got {found} for {expected} observations")]
    FamilyCountMismatch { expected: usize, found: usize },
    #[error("weights structures with {found} grouping terms are not supported; supply at most one")]
    UnsupportedWeightStructure { found: usize },
    #[error("invalid weights grouping: {detail}")]
    WeightGroupIndex { detail: String },
    #[error("invalid covariance template: {detail}")]
    InvalidCovarianceTemplate { detail: String },
    #[error("invalid sparse random-effect design: {detail}")]
    InvalidSparseDesign { detail: String },
    #[error("invalid trial counts: {detail}")]
    InvalidTrials { detail: String },
}

/// A numerical-quality condition attached to an otherwise complete result.
/// Warnings never abort a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitWarning {
    /// An iterative stage hit its iteration cap before reaching tolerance;
    /// the best available iterate was kept.
    NumericalNonConvergence {
        stage: String,
        iterations: usize,
        last_change: f64,
    },
    /// Supplied starting values violated the parameter bounds and were
    /// clamped to the nearest bound.
    StartingValuesClamped { indices: Vec<usize> },
}

/// Compressed-column arena for the transposed random-effect design:
/// rows are random-effect coordinates, columns are observations. Built once;
/// the index structure is shared read-only across every evaluation, only a
/// caller-owned copy of `values` changes when loadings are materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseDesign {
    n_rows: usize,
    n_cols: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseDesign {
    pub fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self, ConfigurationError> {
        let mut sorted: Vec<(usize, usize, f64)> = triplets.to_vec();
        sorted.sort_by_key(|&(row, col, _)| (col, row));
        for window in sorted.windows(2) {
            if window[0].0 == window[1].0 && window[0].1 == window[1].1 {
                return Err(ConfigurationError::InvalidSparseDesign {
                    detail: format!(
                        "duplicate entry at coordinate {}, observation {}",
                        window[0].0, window[0].1
                    ),
                });
            }
        }
        let mut col_ptr = vec![0usize; n_cols + 1];
        let mut row_idx = Vec::with_capacity(sorted.len());
        let mut values = Vec::with_capacity(sorted.len());
        for &(row, col, value) in &sorted {
            if row >= n_rows || col >= n_cols {
                return Err(ConfigurationError::InvalidSparseDesign {
                    detail: format!(
                        "entry ({row}, {col}) outside {n_rows}x{n_cols} design"
                    ),
                });
            }
            col_ptr[col + 1] += 1;
            row_idx.push(row);
            values.push(value);
        }
        for col in 0..n_cols {
            col_ptr[col + 1] += col_ptr[col];
        }
        Ok(Self {
            n_rows,
            n_cols,
            col_ptr,
            row_idx,
            values,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nnz(&self) -> usize {
        self.row_idx.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// All nonzeros in one coordinate row, as `(value index, observation)`.
    pub fn row_nonzeros(&self, row: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for col in 0..self.n_cols {
            for nz in self.col_ptr[col]..self.col_ptr[col + 1] {
                if self.row_idx[nz] == row {
                    out.push((nz, col));
                }
            }
        }
        out
    }

    /// The observation (column) owning a value-arena index.
    pub fn obs_of_nonzero(&self, nz_index: usize) -> usize {
        debug_assert!(nz_index < self.nnz());
        match self.col_ptr.binary_search(&nz_index) {
            // nz_index is the first entry of column `col`; later empty
            // columns share the same pointer, so step back over them.
            Ok(mut col) => {
                while col + 1 < self.col_ptr.len() && self.col_ptr[col + 1] == nz_index {
                    col += 1;
                }
                col
            }
            Err(insertion) => insertion - 1,
        }
    }

    /// Densifies the transposed design (observations by coordinates) from a
    /// caller-supplied value arena, normally the loading-materialized copy.
    pub fn to_dense_transposed(&self, values: &[f64]) -> Array2<f64> {
        debug_assert_eq!(values.len(), self.nnz());
        let mut dense = Array2::zeros((self.n_cols, self.n_rows));
        for col in 0..self.n_cols {
            for nz in self.col_ptr[col]..self.col_ptr[col + 1] {
                dense[[col, self.row_idx[nz]]] = values[nz];
            }
        }
        dense
    }
}

/// One nonzero of the covariance Cholesky template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovarianceEntry {
    pub row: usize,
    pub col: usize,
    pub theta_index: usize,
}

/// Sparsity template of the lower-triangular covariance Cholesky factor,
/// with each nonzero mapped to a `theta` index. Several nonzeros may share
/// one index (e.g. a variance repeated across grouping levels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovarianceTemplate {
    dim: usize,
    entries: Vec<CovarianceEntry>,
}

impl CovarianceTemplate {
    pub fn new(dim: usize, entries: Vec<CovarianceEntry>) -> Result<Self, ConfigurationError> {
        if entries.is_empty() {
            return Err(ConfigurationError::InvalidCovarianceTemplate {
                detail: "template has no nonzeros".to_string(),
            });
        }
        let mut max_theta = 0usize;
        for entry in &entries {
            if entry.col > entry.row || entry.row >= dim {
                return Err(ConfigurationError::InvalidCovarianceTemplate {
                    detail: format!(
                        "entry ({}, {}) outside the {dim}x{dim} lower triangle",
                        entry.row, entry.col
                    ),
                });
            }
            max_theta = max_theta.max(entry.theta_index);
        }
        let mut used = vec![false; max_theta + 1];
        for entry in &entries {
            used[entry.theta_index] = true;
        }
        if let Some(missing) = used.iter().position(|&u| !u) {
            return Err(ConfigurationError::InvalidCovarianceTemplate {
                detail: format!("theta index {missing} is never referenced"),
            });
        }
        Ok(Self { dim, entries })
    }

    /// Template for independent standardized effects sharing one standard
    /// deviation, the usual single-grouping-factor random-intercept shape.
    pub fn shared_diagonal(dim: usize) -> Self {
        let entries = (0..dim)
            .map(|i| CovarianceEntry {
                row: i,
                col: i,
                theta_index: 0,
            })
            .collect();
        Self { dim, entries }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn entries(&self) -> &[CovarianceEntry] {
        &self.entries
    }

    pub fn n_theta(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.theta_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Whether each theta index maps to at least one diagonal position,
    /// which is what makes it bounded below by zero.
    pub fn theta_diag_flags(&self) -> Vec<bool> {
        let mut flags = vec![false; self.n_theta()];
        for entry in &self.entries {
            if entry.row == entry.col {
                flags[entry.theta_index] = true;
            }
        }
        flags
    }

    /// Dense lower-triangular factor at the given theta segment.
    pub fn materialize(&self, theta: ArrayView1<f64>) -> Array2<f64> {
        let mut lower = Array2::zeros((self.dim, self.dim));
        for entry in &self.entries {
            lower[[entry.row, entry.col]] = theta[entry.theta_index];
        }
        lower
    }
}

/// Raw inputs handed over by the external model-structure and
/// factor-specification collaborators.
pub struct ModelInputs {
    pub y: Array1<f64>,
    pub trials: Option<Array1<f64>>,
    pub x: Array2<f64>,
    pub x_names: Vec<String>,
    pub zt: SparseDesign,
    pub covariance: CovarianceTemplate,
    pub factor_blocks: Vec<FactorBlock>,
    /// At most one grouping term; `None` per observation means "ungrouped,
    /// no weight".
    pub weight_groupings: Vec<Vec<Option<usize>>>,
    pub families: Vec<Family>,
}

/// The validated, immutable structure shared by every evaluation of one fit.
#[derive(Debug)]
pub struct ModelStructure {
    y: Array1<f64>,
    trials: Option<Array1<f64>>,
    x: Array2<f64>,
    zt: SparseDesign,
    covariance: CovarianceTemplate,
    loading_map: LoadingMap,
    weight_group: Vec<Option<usize>>,
    n_weight_groups: usize,
    families: Vec<Family>,
    layout: ParameterLayout,
}

impl ModelStructure {
    pub fn new(inputs: ModelInputs) -> Result<Self, crate::estimate::EstimationError> {
        let n = inputs.y.len();
        if n == 0 {
            return Err(ConfigurationError::EmptyData.into());
        }
        if inputs.x.nrows() != n {
            return Err(ConfigurationError::DimensionMismatch {
                what: "fixed-effect design rows",
                expected: n,
                found: inputs.x.nrows(),
            }
            .into());
        }
        if inputs.x_names.len() != inputs.x.ncols() {
            return Err(ConfigurationError::DimensionMismatch {
                what: "fixed-effect column names",
                expected: inputs.x.ncols(),
                found: inputs.x_names.len(),
            }
            .into());
        }
        if inputs.zt.n_cols() != n {
            return Err(ConfigurationError::DimensionMismatch {
                what: "random-effect design columns",
                expected: n,
                found: inputs.zt.n_cols(),
            }
            .into());
        }
        if inputs.zt.n_rows() == 0 {
            return Err(ConfigurationError::InvalidSparseDesign {
                detail: "the random-effect design has no coordinates".to_string(),
            }
            .into());
        }
        if inputs.covariance.dim() != inputs.zt.n_rows() {
            return Err(ConfigurationError::DimensionMismatch {
                what: "covariance template dimension",
                expected: inputs.zt.n_rows(),
                found: inputs.covariance.dim(),
            }
            .into());
        }

        let families = match inputs.families.len() {
            1 => vec![inputs.families[0]; n],
            len if len == n => inputs.families,
            len => {
                return Err(ConfigurationError::FamilyCountMismatch {
                    expected: n,
                    found: len,
                }
                .into());
            }
        };

        if let Some(trials) = &inputs.trials {
            if trials.len() != n {
                return Err(ConfigurationError::DimensionMismatch {
                    what: "trial counts",
                    expected: n,
                    found: trials.len(),
                }
                .into());
            }
            if let Some(bad) = trials.iter().find(|&&m| !(m > 0.0) || !m.is_finite()) {
                return Err(ConfigurationError::InvalidTrials {
                    detail: format!("trial count {bad} is not a positive finite number"),
                }
                .into());
            }
        }

        // Weights are restricted to a single grouping term; more is a
        // configuration error, never silently generalized.
        if inputs.weight_groupings.len() > 1 {
            return Err(ConfigurationError::UnsupportedWeightStructure {
                found: inputs.weight_groupings.len(),
            }
            .into());
        }
        let weight_group = inputs
            .weight_groupings
            .into_iter()
            .next()
            .unwrap_or_else(|| vec![None; n]);
        if weight_group.len() != n {
            return Err(ConfigurationError::DimensionMismatch {
                what: "weights grouping",
                expected: n,
                found: weight_group.len(),
            }
            .into());
        }
        let n_weight_groups = match weight_group.iter().flatten().max() {
            Some(&max_idx) => {
                let mut used = vec![false; max_idx + 1];
                for &g in weight_group.iter().flatten() {
                    used[g] = true;
                }
                if let Some(missing) = used.iter().position(|&u| !u) {
                    return Err(ConfigurationError::WeightGroupIndex {
                        detail: format!("group index {missing} has no observations"),
                    }
                    .into());
                }
                max_idx + 1
            }
            None => 0,
        };

        let loading_map =
            build_loading_map(&inputs.factor_blocks, n, inputs.x.ncols(), &inputs.zt)?;

        let layout = ParameterLayout::new(
            inputs.covariance.n_theta(),
            &inputs.x_names,
            loading_map.n_free,
            loading_map.n_interaction,
            n_weight_groups,
        );

        Ok(Self {
            y: inputs.y,
            trials: inputs.trials,
            x: inputs.x,
            zt: inputs.zt,
            covariance: inputs.covariance,
            loading_map,
            weight_group,
            n_weight_groups,
            families,
            layout,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn trial_count(&self, obs: usize) -> f64 {
        self.trials.as_ref().map_or(1.0, |m| m[obs])
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn zt(&self) -> &SparseDesign {
        &self.zt
    }

    pub fn covariance(&self) -> &CovarianceTemplate {
        &self.covariance
    }

    pub fn loading_map(&self) -> &LoadingMap {
        &self.loading_map
    }

    pub fn weight_group(&self) -> &[Option<usize>] {
        &self.weight_group
    }

    pub fn n_weight_groups(&self) -> usize {
        self.n_weight_groups
    }

    pub fn family(&self, obs: usize) -> Family {
        self.families[obs]
    }

    pub fn all_gaussian(&self) -> bool {
        self.families.iter().all(|f| *f == Family::Gaussian)
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    /// Default starting values: unit variances and loadings, zero elsewhere.
    pub fn default_initial(&self) -> crate::types::ParameterVector {
        let layout = &self.layout;
        let mut values = Array1::zeros(layout.total());
        let diag_flags = self.covariance.theta_diag_flags();
        for (offset, &diag) in diag_flags.iter().enumerate() {
            if diag {
                values[layout.theta.start + offset] = 1.0;
            }
        }
        for idx in layout.lambda_main.clone() {
            values[idx] = 1.0;
        }
        for idx in layout.weights.clone() {
            values[idx] = 1.0;
        }
        crate::types::ParameterVector::new(values)
    }
}

/// The fitted-model artifact assembled once, after optimization terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    /// Names per entry of `parameters`, in layout order.
    pub names: Vec<String>,
    pub parameters: Array1<f64>,
    pub loglik: f64,
    pub dispersion: f64,
    pub gradient: Array1<f64>,
    /// Full Hessian of the marginal log-likelihood at the optimum.
    pub hessian: Array2<f64>,
    /// Conditional modes in the standardized parametrization.
    pub mode_standardized: Array1<f64>,
    /// Conditional modes on the original covariance scale.
    pub mode_original: Array1<f64>,
    /// Linear predictor including the random-effect contribution.
    pub fitted: Array1<f64>,
    /// Linear predictor from the fixed part only.
    pub fitted_fixed: Array1<f64>,
    pub pearson_residuals: Array1<f64>,
    pub deviance_residuals: Array1<f64>,
    pub degrees_of_freedom: usize,
    pub converged: bool,
    pub iterations: u64,
    /// Best log-likelihood after each outer objective evaluation;
    /// non-decreasing by construction.
    pub loglik_trace: Vec<f64>,
    pub warnings: Vec<FitWarning>,
}
