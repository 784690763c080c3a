//! # Factor-Loading Mapping Builder
//!
//! Compiles loading-matrix templates, the grouping variable that ties design
//! rows to template rows, and optional loading-by-covariate interaction
//! specifications into structural-entry descriptors. The descriptors are the
//! only bridge between the `lambda` parameter segment and the design
//! matrices: they are built once, before optimization, and consumed read-only
//! by every likelihood evaluation.
//!
//! Each descriptor is an explicit tagged variant rather than a sentinel
//! integer, so every code path over structural entries is exhaustive: a
//! position is either never materialized (`Zero`), pinned for identifiability
//! (`FixedValue`), a single free loading (`Parameter`), or a linear
//! combination of free coefficients against observed covariate values
//! (`LinearCombination`).

use crate::model::SparseDesign;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A loading template incompatible with the supplied grouping or targets.
/// Raised during mapping construction, before any optimization starts.
#[derive(Error, Debug)]
pub enum StructuralMismatch {
    #[error("grouping variable has {found} entries but the model has {expected} observations")]
    GroupingLength { expected: usize, found: usize },
    #[error(
        "grouping levels do not align one-to-one with the {rows} template rows: {detail}"
    )]
    GroupLevels { rows: usize, detail: String },
    #[error("template has {cols} columns but {found} column targets were supplied")]
    ColumnTargets { cols: usize, found: usize },
    #[error(
        "interaction covariates for template column {column} have {found} rows, expected {expected}"
    )]
    InteractionRows {
        column: usize,
        expected: usize,
        found: usize,
    },
    #[error("design position targeted by more than one template column: {detail}")]
    DuplicateTarget { detail: String },
    #[error("target {detail} lies outside the design dimensions")]
    TargetOutOfRange { detail: String },
    #[error("loading template declared as {rows}x{cols} but {len} entries were supplied")]
    TemplateShape {
        rows: usize,
        cols: usize,
        len: usize,
    },
}

/// One structural position touched by a factor loading.
///
/// `FixedValue` entries never appear in the gradient or Hessian; only
/// `Parameter` and `LinearCombination` reference the `lambda` segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StructuralEntry {
    /// Structurally absent; the design entry is never materialized.
    Zero,
    /// Pinned constant, e.g. the identifiability anchor loading of 1.
    FixedValue(f64),
    /// A single free loading at the given `lambda` index.
    Parameter(usize),
    /// A linear combination `sum_k lambda[idx_k] * coef_k`, used for
    /// loading-by-covariate interaction terms.
    LinearCombination(Vec<(usize, f64)>),
}

impl StructuralEntry {
    /// The multiplier this entry contributes at the given `lambda` segment.
    pub fn value(&self, lambda: ArrayView1<f64>) -> f64 {
        match self {
            StructuralEntry::Zero => 0.0,
            StructuralEntry::FixedValue(v) => *v,
            StructuralEntry::Parameter(idx) => lambda[*idx],
            StructuralEntry::LinearCombination(terms) => {
                terms.iter().map(|&(idx, coef)| lambda[idx] * coef).sum()
            }
        }
    }

    /// Derivative of `value` with respect to `lambda[index]`.
    pub fn partial(&self, index: usize) -> f64 {
        match self {
            StructuralEntry::Zero | StructuralEntry::FixedValue(_) => 0.0,
            StructuralEntry::Parameter(idx) => {
                if *idx == index {
                    1.0
                } else {
                    0.0
                }
            }
            StructuralEntry::LinearCombination(terms) => terms
                .iter()
                .filter(|&&(idx, _)| idx == index)
                .map(|&(_, coef)| coef)
                .sum(),
        }
    }

    /// Whether this entry references any free loading.
    pub fn is_free(&self) -> bool {
        matches!(
            self,
            StructuralEntry::Parameter(_) | StructuralEntry::LinearCombination(_)
        )
    }
}

/// A loading-matrix template: `Some(v)` pins the loading to `v`, `None`
/// declares a free loading to be estimated. Stored row-major.
#[derive(Debug, Clone)]
pub struct LoadingTemplate {
    nrows: usize,
    ncols: usize,
    entries: Vec<Option<f64>>,
}

impl LoadingTemplate {
    pub fn new(
        nrows: usize,
        ncols: usize,
        entries: Vec<Option<f64>>,
    ) -> Result<Self, StructuralMismatch> {
        if entries.len() != nrows * ncols {
            return Err(StructuralMismatch::TemplateShape {
                rows: nrows,
                cols: ncols,
                len: entries.len(),
            });
        }
        Ok(Self {
            nrows,
            ncols,
            entries,
        })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.entries[row * self.ncols + col]
    }
}

/// Per-template-column interaction specification: a design of observed
/// covariate values (one row per observation) whose coefficients become part
/// of the `lambda` interaction sub-segment.
#[derive(Debug, Clone)]
pub struct InteractionSpec {
    pub covariates: Array2<f64>,
}

/// One latent-factor block: the template, the grouping that selects a
/// template row for each observation, and the design positions each template
/// column scales.
#[derive(Debug, Clone)]
pub struct FactorBlock {
    pub template: LoadingTemplate,
    /// Template row applying to each observation (the grouping variable,
    /// already coded as 0-based level indices).
    pub row_of_obs: Vec<usize>,
    /// Fixed-effect design column scaled by each template column, if any.
    pub x_cols: Vec<Option<usize>>,
    /// Random-effect coordinate rows (rows of the transposed sparse design)
    /// scaled by each template column.
    pub zt_rows: Vec<Vec<usize>>,
    /// Optional interaction specification per template column.
    pub interactions: Vec<Option<InteractionSpec>>,
}

/// Descriptor for one affected fixed-effect design position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XEntry {
    pub row: usize,
    pub col: usize,
    pub entry: StructuralEntry,
}

/// Descriptor for one affected nonzero of the sparse random-effect design,
/// addressed by its index in the value arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZtEntry {
    pub nz_index: usize,
    pub entry: StructuralEntry,
}

/// The compiled loading map: every structural position touched by a loading,
/// plus the sizes of the two `lambda` sub-segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadingMap {
    pub x_entries: Vec<XEntry>,
    pub zt_entries: Vec<ZtEntry>,
    /// Number of free loading parameters (main sub-segment).
    pub n_free: usize,
    /// Number of loading-by-covariate interaction coefficients.
    pub n_interaction: usize,
}

impl LoadingMap {
    /// An empty map for models without latent-factor blocks.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Compiles factor blocks into a loading map.
///
/// Free template entries receive sequential `Parameter` indices in
/// first-appearance order of a column-major traversal, matching the order the
/// design-matrix builder lays columns out; duplicate structural positions
/// referencing the same free template entry share one index. Interaction
/// coefficients are appended after all plain loadings so they form a
/// distinguishable sub-segment.
pub fn build_loading_map(
    blocks: &[FactorBlock],
    n_obs: usize,
    n_x_cols: usize,
    zt: &SparseDesign,
) -> Result<LoadingMap, StructuralMismatch> {
    // Pass 1: validate shapes and assign plain indices column-major.
    let mut plain_index: Vec<HashMap<(usize, usize), usize>> = Vec::with_capacity(blocks.len());
    let mut n_free = 0usize;
    for block in blocks {
        validate_block(block, n_obs, n_x_cols, zt)?;
        let mut assigned = HashMap::new();
        for col in 0..block.template.ncols() {
            for row in 0..block.template.nrows() {
                if block.template.get(row, col).is_none() {
                    assigned.entry((row, col)).or_insert_with(|| {
                        let idx = n_free;
                        n_free += 1;
                        idx
                    });
                }
            }
        }
        plain_index.push(assigned);
    }

    // Interaction coefficients follow all plain loadings.
    let mut interaction_index: Vec<Vec<Option<usize>>> = Vec::with_capacity(blocks.len());
    let mut n_interaction = 0usize;
    for block in blocks {
        let mut per_column = Vec::with_capacity(block.template.ncols());
        for spec in &block.interactions {
            match spec {
                Some(spec) => {
                    per_column.push(Some(n_free + n_interaction));
                    n_interaction += spec.covariates.ncols();
                }
                None => per_column.push(None),
            }
        }
        interaction_index.push(per_column);
    }

    // Pass 2: emit descriptors, again column-major per template.
    let mut x_entries = Vec::new();
    let mut zt_entries = Vec::new();
    let mut claimed_x_cols: HashMap<usize, usize> = HashMap::new();
    let mut claimed_zt_rows: HashMap<usize, usize> = HashMap::new();

    for (b, block) in blocks.iter().enumerate() {
        for col in 0..block.template.ncols() {
            if let Some(x_col) = block.x_cols[col] {
                if claimed_x_cols.insert(x_col, b).is_some() {
                    return Err(StructuralMismatch::DuplicateTarget {
                        detail: format!("fixed-effect column {x_col}"),
                    });
                }
                for obs in 0..n_obs {
                    let row = block.row_of_obs[obs];
                    let entry =
                        describe_entry(block, &plain_index[b], &interaction_index[b], row, col, obs);
                    x_entries.push(XEntry {
                        row: obs,
                        col: x_col,
                        entry,
                    });
                }
            }
            for &coord in &block.zt_rows[col] {
                if claimed_zt_rows.insert(coord, b).is_some() {
                    return Err(StructuralMismatch::DuplicateTarget {
                        detail: format!("random-effect coordinate {coord}"),
                    });
                }
                for (nz_index, obs) in zt.row_nonzeros(coord) {
                    let row = block.row_of_obs[obs];
                    let entry =
                        describe_entry(block, &plain_index[b], &interaction_index[b], row, col, obs);
                    zt_entries.push(ZtEntry { nz_index, entry });
                }
            }
        }
    }

    Ok(LoadingMap {
        x_entries,
        zt_entries,
        n_free,
        n_interaction,
    })
}

fn describe_entry(
    block: &FactorBlock,
    plain: &HashMap<(usize, usize), usize>,
    interaction: &[Option<usize>],
    row: usize,
    col: usize,
    obs: usize,
) -> StructuralEntry {
    match block.template.get(row, col) {
        Some(v) if v == 0.0 => StructuralEntry::Zero,
        Some(v) => StructuralEntry::FixedValue(v),
        None => {
            let base = plain[&(row, col)];
            match (&block.interactions[col], interaction[col]) {
                (Some(spec), Some(first_idx)) => {
                    let mut terms = vec![(base, 1.0)];
                    for t in 0..spec.covariates.ncols() {
                        terms.push((first_idx + t, spec.covariates[[obs, t]]));
                    }
                    StructuralEntry::LinearCombination(terms)
                }
                _ => StructuralEntry::Parameter(base),
            }
        }
    }
}

fn validate_block(
    block: &FactorBlock,
    n_obs: usize,
    n_x_cols: usize,
    zt: &SparseDesign,
) -> Result<(), StructuralMismatch> {
    let ncols = block.template.ncols();
    let nrows = block.template.nrows();
    if block.row_of_obs.len() != n_obs {
        return Err(StructuralMismatch::GroupingLength {
            expected: n_obs,
            found: block.row_of_obs.len(),
        });
    }
    if block.x_cols.len() != ncols || block.zt_rows.len() != ncols || block.interactions.len() != ncols
    {
        let found = block
            .x_cols
            .len()
            .max(block.zt_rows.len())
            .max(block.interactions.len());
        return Err(StructuralMismatch::ColumnTargets { cols: ncols, found });
    }

    // Grouping levels must align one-to-one with template rows.
    let mut seen = vec![false; nrows];
    for &level in &block.row_of_obs {
        if level >= nrows {
            return Err(StructuralMismatch::GroupLevels {
                rows: nrows,
                detail: format!("level {level} has no template row"),
            });
        }
        seen[level] = true;
    }
    if let Some(missing) = seen.iter().position(|&s| !s) {
        return Err(StructuralMismatch::GroupLevels {
            rows: nrows,
            detail: format!("template row {missing} matches no observation"),
        });
    }

    for (col, spec) in block.interactions.iter().enumerate() {
        if let Some(spec) = spec {
            if spec.covariates.nrows() != n_obs {
                return Err(StructuralMismatch::InteractionRows {
                    column: col,
                    expected: n_obs,
                    found: spec.covariates.nrows(),
                });
            }
        }
    }
    for x_col in block.x_cols.iter().flatten() {
        if *x_col >= n_x_cols {
            return Err(StructuralMismatch::TargetOutOfRange {
                detail: format!("fixed-effect column {x_col} (design has {n_x_cols})"),
            });
        }
    }
    for coords in &block.zt_rows {
        for &coord in coords {
            if coord >= zt.n_rows() {
                return Err(StructuralMismatch::TargetOutOfRange {
                    detail: format!(
                        "random-effect coordinate {coord} (design has {})",
                        zt.n_rows()
                    ),
                });
            }
        }
    }
    Ok(())
}
