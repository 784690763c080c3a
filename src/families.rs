//! # Response-Distribution Families
//!
//! Each supported family bundles its canonical link, variance function, score
//! and information weight for the penalized IRLS solver, and deviance helpers
//! for residual reporting. The family is carried as an explicit enum on every
//! observation and passed by value into the inner solver; nothing is resolved
//! by name at call time.
//!
//! Conventions:
//! - Binomial responses are stored as proportions in `[0, 1]` together with an
//!   optional trial count (default 1).
//! - Gaussian observations carry a variance multiplier `omega` (the
//!   heteroscedastic weight for their group, 1.0 when ungrouped); `omega` is
//!   ignored by the discrete families.
//! - All log-densities are reported up to a family-specific additive constant,
//!   which cancels in every comparison the engine performs.

use serde::{Deserialize, Serialize};

/// Floor applied to IRLS information weights.
const MIN_WEIGHT: f64 = 1e-10;

/// Largest magnitude allowed for a logit-scale linear predictor.
const MAX_LOGIT_ETA: f64 = 700.0;

/// Largest magnitude allowed for a log-scale linear predictor.
const MAX_LOG_ETA: f64 = 30.0;

/// A response-distribution family with its canonical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Identity link, optional per-group residual-variance multiplier.
    Gaussian,
    /// Logit link; response is a proportion with an optional trial count.
    Binomial,
    /// Log link.
    Poisson,
}

impl Family {
    /// Clamps the linear predictor to the range where the inverse link is
    /// numerically safe.
    pub fn clamp_eta(self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Binomial => eta.clamp(-MAX_LOGIT_ETA, MAX_LOGIT_ETA),
            Family::Poisson => eta.clamp(-MAX_LOG_ETA, MAX_LOG_ETA),
        }
    }

    /// Inverse canonical link.
    pub fn mean(self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Binomial => {
                let e = self.clamp_eta(eta);
                1.0 / (1.0 + (-e).exp())
            }
            Family::Poisson => self.clamp_eta(eta).exp(),
        }
    }

    /// Unit variance function `V(mu)`.
    pub fn variance(self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => 1.0,
            Family::Binomial => mu * (1.0 - mu),
            Family::Poisson => mu,
        }
    }

    /// Score `d log p / d eta` at the canonical link.
    pub fn score(self, y: f64, mu: f64, trials: f64, omega: f64) -> f64 {
        match self {
            Family::Gaussian => (y - mu) / omega,
            Family::Binomial => trials * (y - mu),
            Family::Poisson => y - mu,
        }
    }

    /// IRLS information weight `-d^2 log p / d eta^2` (observed equals
    /// expected for canonical links), floored for stability.
    pub fn info_weight(self, mu: f64, trials: f64, omega: f64) -> f64 {
        let w = match self {
            Family::Gaussian => 1.0 / omega,
            Family::Binomial => trials * mu * (1.0 - mu),
            Family::Poisson => mu,
        };
        w.max(MIN_WEIGHT)
    }

    /// Derivative of the information weight with respect to eta. Required by
    /// the log-determinant term of the marginal-likelihood gradient.
    pub fn info_weight_eta_derivative(self, mu: f64, trials: f64) -> f64 {
        match self {
            Family::Gaussian => 0.0,
            Family::Binomial => trials * mu * (1.0 - mu) * (1.0 - 2.0 * mu),
            Family::Poisson => mu,
        }
    }

    /// Log-density up to an additive constant that does not depend on the
    /// linear predictor or on `omega`.
    pub fn log_density(self, y: f64, eta: f64, trials: f64, omega: f64) -> f64 {
        const EPS: f64 = 1e-12;
        match self {
            Family::Gaussian => {
                let r = y - eta;
                -0.5 * (r * r / omega + (2.0 * std::f64::consts::PI * omega).ln())
            }
            Family::Binomial => {
                let mu = self.mean(eta).clamp(EPS, 1.0 - EPS);
                trials * (y * mu.ln() + (1.0 - y) * (1.0 - mu).ln())
            }
            Family::Poisson => {
                let e = self.clamp_eta(eta);
                y * e - e.exp()
            }
        }
    }

    /// Unit deviance `d(y, mu)`; zero when the fit is exact.
    pub fn unit_deviance(self, y: f64, mu: f64, trials: f64) -> f64 {
        const EPS: f64 = 1e-12;
        match self {
            Family::Gaussian => {
                let r = y - mu;
                r * r
            }
            Family::Binomial => {
                let mu_c = mu.clamp(EPS, 1.0 - EPS);
                let term1 = if y > EPS { y * (y / mu_c).ln() } else { 0.0 };
                let term2 = if y < 1.0 - EPS {
                    (1.0 - y) * ((1.0 - y) / (1.0 - mu_c)).ln()
                } else {
                    0.0
                };
                2.0 * trials * (term1 + term2)
            }
            Family::Poisson => {
                let mu_c = mu.max(EPS);
                let term = if y > EPS { y * (y / mu_c).ln() } else { 0.0 };
                2.0 * (term - (y - mu_c))
            }
        }
    }

    /// Pearson residual `(y - mu) / sqrt(Var(y))`.
    pub fn pearson_residual(
        self,
        y: f64,
        mu: f64,
        trials: f64,
        omega: f64,
        dispersion: f64,
    ) -> f64 {
        let var = match self {
            Family::Gaussian => omega * dispersion,
            Family::Binomial => (mu * (1.0 - mu) / trials).max(MIN_WEIGHT),
            Family::Poisson => mu.max(MIN_WEIGHT),
        };
        (y - mu) / var.sqrt()
    }

    /// Signed square root of the (scaled) unit deviance.
    pub fn deviance_residual(
        self,
        y: f64,
        mu: f64,
        trials: f64,
        omega: f64,
        dispersion: f64,
    ) -> f64 {
        let scale = match self {
            Family::Gaussian => omega * dispersion,
            _ => 1.0,
        };
        let d = self.unit_deviance(y, mu, trials) / scale;
        (y - mu).signum() * d.max(0.0).sqrt()
    }

    /// Whether the family carries a free residual dispersion.
    pub fn has_dispersion(self) -> bool {
        matches!(self, Family::Gaussian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn binomial_mean_is_logistic() {
        assert_abs_diff_eq!(Family::Binomial.mean(0.0), 0.5, epsilon = 1e-12);
        assert!(Family::Binomial.mean(40.0) > 0.999_999);
        assert!(Family::Binomial.mean(-40.0) < 1e-6);
    }

    #[test]
    fn info_weight_eta_derivative_matches_finite_differences() {
        let h = 1e-6;
        for family in [Family::Binomial, Family::Poisson] {
            for &eta in &[-1.3, -0.2, 0.0, 0.4, 2.1] {
                let trials = 3.0;
                let w_plus = family.info_weight(family.mean(eta + h), trials, 1.0);
                let w_minus = family.info_weight(family.mean(eta - h), trials, 1.0);
                let fd = (w_plus - w_minus) / (2.0 * h);
                let analytic = family.info_weight_eta_derivative(family.mean(eta), trials);
                assert_abs_diff_eq!(fd, analytic, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn score_is_eta_derivative_of_log_density() {
        let h = 1e-6;
        let cases = [
            (Family::Gaussian, 0.7, 1.0, 2.0),
            (Family::Binomial, 1.0, 4.0, 1.0),
            (Family::Binomial, 0.25, 4.0, 1.0),
            (Family::Poisson, 3.0, 1.0, 1.0),
        ];
        for (family, y, trials, omega) in cases {
            for &eta in &[-0.8, 0.1, 1.2] {
                let fd = (family.log_density(y, eta + h, trials, omega)
                    - family.log_density(y, eta - h, trials, omega))
                    / (2.0 * h);
                let analytic = family.score(y, family.mean(eta), trials, omega);
                assert_abs_diff_eq!(fd, analytic, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn unit_deviance_is_zero_at_perfect_fit() {
        assert_abs_diff_eq!(Family::Gaussian.unit_deviance(1.5, 1.5, 1.0), 0.0);
        assert_abs_diff_eq!(
            Family::Binomial.unit_deviance(0.25, 0.25, 4.0),
            0.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(Family::Poisson.unit_deviance(2.0, 2.0, 1.0), 0.0, epsilon = 1e-9);
    }
}
