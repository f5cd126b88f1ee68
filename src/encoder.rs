//! Fixed-point encoding of floating point tensors into the ring Z_2^64.

use std::num::Wrapping;

use serde::{Deserialize, Serialize};

use crate::{
    ring::{Ring, RingTensor},
    value::Tensor,
};

/// Encodes `x` as `round(x * 2^precision_bits)` in two's complement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPointEncoder {
    precision_bits: u32,
}

impl Default for FixedPointEncoder {
    fn default() -> Self {
        Self::new(16)
    }
}

impl FixedPointEncoder {
    /// Creates an encoder with the given number of fractional bits (at most 32).
    pub fn new(precision_bits: u32) -> Self {
        Self {
            precision_bits: precision_bits.min(32),
        }
    }

    /// The number of fractional bits.
    pub fn precision_bits(&self) -> u32 {
        self.precision_bits
    }

    /// The scaling factor `2^precision_bits`.
    pub fn scale(&self) -> u64 {
        1 << self.precision_bits
    }

    /// Encodes a single value.
    pub fn encode_scalar(&self, x: f64) -> Ring {
        Wrapping((x * self.scale() as f64).round() as i64 as u64)
    }

    /// Decodes a single ring element.
    pub fn decode_scalar(&self, x: Ring) -> f64 {
        x.0 as i64 as f64 / self.scale() as f64
    }

    /// Encodes every element of the tensor.
    pub fn encode(&self, x: &Tensor) -> RingTensor {
        x.mapv(|v| self.encode_scalar(v))
    }

    /// Decodes every element of the ring tensor.
    pub fn decode(&self, x: &RingTensor) -> Tensor {
        x.mapv(|v| self.decode_scalar(v))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use proptest::prelude::*;

    use super::FixedPointEncoder;

    #[test]
    fn negative_values_use_twos_complement() {
        let encoder = FixedPointEncoder::default();
        assert_eq!(encoder.encode_scalar(-1.0).0, u64::MAX - (1 << 16) + 1);
        assert_eq!(encoder.decode_scalar(encoder.encode_scalar(-2.5)), -2.5);
    }

    #[test]
    fn precision_is_capped() {
        assert_eq!(FixedPointEncoder::new(60).precision_bits(), 32);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(values in prop::collection::vec(-1e9f64..1e9, 1..32)) {
            let encoder = FixedPointEncoder::default();
            let x = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values).unwrap();
            let y = encoder.decode(&encoder.encode(&x));
            for (a, b) in x.iter().zip(y.iter()) {
                prop_assert!((a - b).abs() <= 1.0 / encoder.scale() as f64);
            }
        }
    }
}
