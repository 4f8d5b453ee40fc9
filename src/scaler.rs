//! Data scaling between the dataset range and the range the score model was trained on.

use ndarray::ArrayD;

/// Affine map applied to data before likelihood evaluation, inverted after sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataScaler {
    /// Data already lives in model space.
    #[default]
    Identity,
    /// `[0, 1] -> [-1, 1]`.
    Centered,
}

impl DataScaler {
    #[inline]
    pub fn scale_scalar(self, v: f64) -> f64 {
        match self {
            DataScaler::Identity => v,
            DataScaler::Centered => 2.0 * v - 1.0,
        }
    }

    #[inline]
    pub fn inverse_scalar(self, v: f64) -> f64 {
        match self {
            DataScaler::Identity => v,
            DataScaler::Centered => (v + 1.0) / 2.0,
        }
    }

    pub fn scale(self, x: &ArrayD<f64>) -> ArrayD<f64> {
        match self {
            DataScaler::Identity => x.clone(),
            DataScaler::Centered => x.mapv(|v| self.scale_scalar(v)),
        }
    }

    pub fn inverse(self, x: &ArrayD<f64>) -> ArrayD<f64> {
        match self {
            DataScaler::Identity => x.clone(),
            DataScaler::Centered => x.mapv(|v| self.inverse_scalar(v)),
        }
    }

    /// Bits/dim offset for 8-bit data dequantized with uniform noise.
    ///
    /// `7 - inverse(-1)`: 8 bits when the model sees `[0, 1]`, 7 when it sees `[-1, 1]`
    /// (the map doubles the volume).
    pub fn dequantization_offset(self) -> f64 {
        7.0 - self.inverse_scalar(-1.0)
    }
}
