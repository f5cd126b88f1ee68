//! Tensors over the ring Z_2^64 that hold the local shares.

use std::num::Wrapping;

use ndarray::{ArrayD, Ix2, IxDyn};
use rand::Rng;

use crate::error::Error;

/// An element of Z_2^64.
pub type Ring = Wrapping<u64>;

/// A tensor of ring elements.
pub type RingTensor = ArrayD<Ring>;

pub(crate) fn zeros(shape: &[usize]) -> RingTensor {
    ArrayD::from_elem(IxDyn(shape), Wrapping(0))
}

pub(crate) fn filled(shape: &[usize], value: Ring) -> RingTensor {
    ArrayD::from_elem(IxDyn(shape), value)
}

/// Samples a uniformly random ring tensor.
pub(crate) fn random(rng: &mut impl Rng, shape: &[usize]) -> RingTensor {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || Wrapping(rng.random()))
}

/// Samples a ring tensor whose elements are uniform in `[0, 2^bits)`.
pub(crate) fn random_bits(rng: &mut impl Rng, shape: &[usize], bits: u32) -> RingTensor {
    let mask = low_mask(bits);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || Wrapping(rng.random::<u64>() & mask))
}

pub(crate) fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

pub(crate) fn check_same_shape(left: &[usize], right: &[usize]) -> Result<(), Error> {
    if left == right {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            left: left.to_vec(),
            right: right.to_vec(),
        })
    }
}

/// The shape of `a @ b` for two matrices.
pub(crate) fn matmul_shape(left: &[usize], right: &[usize]) -> Result<Vec<usize>, Error> {
    match (left, right) {
        ([m, k], [k2, n]) if k == k2 => Ok(vec![*m, *n]),
        _ => Err(Error::ShapeMismatch {
            left: left.to_vec(),
            right: right.to_vec(),
        }),
    }
}

/// Matrix product of two 2-dimensional ring tensors (wrapping arithmetic).
pub(crate) fn matmul(a: &RingTensor, b: &RingTensor) -> Result<RingTensor, Error> {
    matmul_shape(a.shape(), b.shape())?;
    let shape_err = || Error::ShapeMismatch {
        left: a.shape().to_vec(),
        right: b.shape().to_vec(),
    };
    let a = a.view().into_dimensionality::<Ix2>().map_err(|_| shape_err())?;
    let b = b.view().into_dimensionality::<Ix2>().map_err(|_| shape_err())?;
    Ok(a.dot(&b).into_dyn())
}

/// Splits `value` into `parties` additive shares and keeps the share of `rank`.
///
/// Every party must call this with the same generator state: all `parties - 1` random masks are
/// drawn regardless of `rank`.
pub(crate) fn additive_share(
    rng: &mut impl Rng,
    value: &RingTensor,
    rank: usize,
    parties: usize,
) -> RingTensor {
    let mut last = value.clone();
    let mut own = None;
    for i in 0..parties.saturating_sub(1) {
        let mask = random(rng, value.shape());
        last = &last - &mask;
        if i == rank {
            own = Some(mask);
        }
    }
    own.unwrap_or(last)
}

/// Splits `value` into `parties` XOR shares and keeps the share of `rank`.
pub(crate) fn xor_share(
    rng: &mut impl Rng,
    value: &RingTensor,
    rank: usize,
    parties: usize,
) -> RingTensor {
    let mut last = value.clone();
    let mut own = None;
    for i in 0..parties.saturating_sub(1) {
        let mask = random(rng, value.shape());
        last = &last ^ &mask;
        if i == rank {
            own = Some(mask);
        }
    }
    own.unwrap_or(last)
}

/// Wrapping sum of the shares of all parties, which must agree in shape.
pub(crate) fn sum_all(shares: &[RingTensor]) -> Result<RingTensor, Error> {
    combine(shares, |acc, s| acc + s)
}

/// XOR of the shares of all parties, which must agree in shape.
pub(crate) fn xor_all(shares: &[RingTensor]) -> Result<RingTensor, Error> {
    combine(shares, |acc, s| acc ^ s)
}

fn combine(
    shares: &[RingTensor],
    op: impl Fn(RingTensor, &RingTensor) -> RingTensor,
) -> Result<RingTensor, Error> {
    let (first, rest) = shares
        .split_first()
        .ok_or_else(|| Error::InvalidInput("no shares to combine".into()))?;
    let mut acc = first.clone();
    for s in rest {
        check_same_shape(first.shape(), s.shape())?;
        acc = op(acc, s);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use std::num::Wrapping;

    use ndarray::{ArrayD, IxDyn};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::{additive_share, matmul, random_bits, sum_all, xor_all, xor_share};

    fn shares_of(value: &ArrayD<Wrapping<u64>>, parties: usize, xor: bool) -> Vec<ArrayD<Wrapping<u64>>> {
        (0..parties)
            .map(|rank| {
                let mut rng = ChaCha20Rng::seed_from_u64(7);
                if xor {
                    xor_share(&mut rng, value, rank, parties)
                } else {
                    additive_share(&mut rng, value, rank, parties)
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn shares_reconstruct(values in prop::collection::vec(any::<u64>(), 1..16), parties in 1usize..6) {
            let value = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.into_iter().map(Wrapping).collect()).unwrap();
            prop_assert_eq!(sum_all(&shares_of(&value, parties, false)).unwrap(), value.clone());
            prop_assert_eq!(xor_all(&shares_of(&value, parties, true)).unwrap(), value);
        }
    }

    #[test]
    fn random_bits_are_bounded() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let r = random_bits(&mut rng, &[64], 5);
        assert!(r.iter().all(|v| v.0 < 32));
    }

    #[test]
    fn ring_matmul_wraps() {
        let a = ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![Wrapping(u64::MAX), Wrapping(2)]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[2, 1]), vec![Wrapping(3), Wrapping(4)]).unwrap();
        let c = matmul(&a, &b).unwrap();
        // -1 * 3 + 2 * 4
        assert_eq!(c.into_raw_vec(), vec![Wrapping(5)]);
        assert!(matmul(&b, &b).is_err());
    }
}
