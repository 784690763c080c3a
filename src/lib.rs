//! # lodestar
//!
//! A marginal-likelihood engine for generalized latent-variable mixed
//! models: regression models whose linear predictor combines fixed effects,
//! random effects and latent factors loading onto multiple measured
//! outcomes, possibly from different response-distribution families.
//!
//! The crate implements the nested optimization at the heart of such fits:
//! a penalized-IRLS inner solve for the conditional modes of the
//! random/latent effects, wrapped in a Laplace approximation to the marginal
//! log-likelihood, wrapped in a bound-constrained outer search over the flat
//! parameter vector `[theta | beta | lambda | weights]`. Formula parsing,
//! basis construction, summaries and I/O are deliberately out of scope:
//! collaborators hand this crate already-built numeric structures and
//! consume numeric results.

#![allow(non_snake_case)]

pub mod diagnostics;
pub mod estimate;
pub mod families;
pub mod layout;
pub mod likelihood;
pub mod loadings;
pub mod model;
pub mod pirls;
pub mod types;

pub use diagnostics::{degrees_of_freedom, deviance_residuals, pearson_residuals};
pub use estimate::{fit, EstimationError, FitOptions, OptimizerStrategy};
pub use families::Family;
pub use layout::ParameterLayout;
pub use likelihood::{EvalRequest, EvaluationResult, HessianRequest, MarginalEngine};
pub use loadings::{
    build_loading_map, FactorBlock, InteractionSpec, LoadingMap, LoadingTemplate,
    StructuralEntry, StructuralMismatch,
};
pub use model::{
    ConfigurationError, CovarianceEntry, CovarianceTemplate, FitWarning, FittedModel,
    ModelInputs, ModelStructure, SparseDesign,
};
pub use pirls::{solve_conditional_modes, InnerFit, InnerOptions};
pub use types::{LinearPredictor, ParameterVector};
