use ndarray::{Array1, ArrayView1};
use std::ops::{Deref, DerefMut};

/// The flat outer parameter vector `[theta | beta | lambda | weights]`.
///
/// Segment boundaries live in `layout::ParameterLayout`; this wrapper only
/// guards against mixing the outer vector with other index spaces.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterVector(pub Array1<f64>);

impl ParameterVector {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }

    /// Bit-exact identity key used by the engine's single-slot cache.
    pub fn identity_key(&self) -> Vec<u64> {
        self.0.iter().map(|v| v.to_bits()).collect()
    }
}

impl Deref for ParameterVector {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ParameterVector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for ParameterVector {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<ParameterVector> for Array1<f64> {
    fn from(values: ParameterVector) -> Self {
        values.0
    }
}

/// A linear predictor vector, one entry per observation.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPredictor(pub Array1<f64>);

impl LinearPredictor {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for LinearPredictor {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Array1<f64>> for LinearPredictor {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identity_key_distinguishes_negative_zero() {
        let a = ParameterVector::new(array![0.0, 1.0]);
        let b = ParameterVector::new(array![-0.0, 1.0]);
        assert_ne!(a.identity_key(), b.identity_key());
        assert_eq!(a.identity_key(), a.clone().identity_key());
    }
}
