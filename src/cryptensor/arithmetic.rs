//! Additive sharing over Z_2^64: `x = sum of all shares`.

use std::num::Wrapping;

use ndarray::{Axis, Zip};
use tracing::{Level, instrument};

use crate::{
    channel::Channel,
    context::Context,
    error::Error,
    provider::TripleOp,
    ring::{self, Ring, RingTensor},
};

/// Adds a public value to a share; only party 0 applies it.
pub(super) fn add_public<C: Channel>(
    ctx: &Context<C>,
    share: &RingTensor,
    public: &RingTensor,
) -> Result<RingTensor, Error> {
    ring::check_same_shape(share.shape(), public.shape())?;
    if ctx.rank() == 0 {
        Ok(share + public)
    } else {
        Ok(share.clone())
    }
}

pub(super) fn add_public_scalar<C: Channel>(
    ctx: &Context<C>,
    share: &RingTensor,
    public: Ring,
) -> RingTensor {
    if ctx.rank() == 0 {
        share.mapv(|v| v + public)
    } else {
        share.clone()
    }
}

/// Opens a shared value to all parties.
pub(super) async fn reveal<C: Channel>(
    ctx: &Context<C>,
    share: &RingTensor,
    phase: &str,
) -> Result<RingTensor, Error> {
    let shares = ctx.comm().all_gather(share.clone(), phase).await?;
    ring::sum_all(&shares)
}

/// Multiplies (elementwise or as matrices) two shared values with a Beaver triple.
///
/// The result carries twice the fixed-point precision and must be truncated.
#[instrument(level = Level::TRACE, skip_all, err)]
pub(super) async fn beaver<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
    y: &RingTensor,
    op: TripleOp,
) -> Result<RingTensor, Error> {
    match op {
        TripleOp::Mul => ring::check_same_shape(x.shape(), y.shape())?,
        TripleOp::Matmul => {
            ring::matmul_shape(x.shape(), y.shape())?;
        }
    }
    let (a, b, c) = ctx.triple(op, x.shape(), y.shape())?;
    let masked = (x - &a, y - &b);
    let opened = ctx.comm().all_gather(masked, "beaver").await?;
    let (eps, delta): (Vec<_>, Vec<_>) = opened.into_iter().unzip();
    let eps = ring::sum_all(&eps)?;
    let delta = ring::sum_all(&delta)?;

    let product = |l: &RingTensor, r: &RingTensor| match op {
        TripleOp::Mul => Ok(l * r),
        TripleOp::Matmul => ring::matmul(l, r),
    };
    let z = c + &product(&eps, &b)? + &product(&a, &delta)?;
    if ctx.rank() == 0 {
        Ok(z + &product(&eps, &delta)?)
    } else {
        Ok(z)
    }
}

/// Squares a shared value with a `(r, r * r)` tuple.
///
/// The result carries twice the fixed-point precision and must be truncated.
pub(super) async fn square<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
) -> Result<RingTensor, Error> {
    let (r, r2) = ctx.square(x.shape())?;
    let eps = reveal(ctx, &(x - &r), "square").await?;
    // x^2 = r^2 + 2 eps r + eps^2
    let z = r2 + &(&r * &eps).mapv(|v| v * Wrapping(2));
    add_public(ctx, &z, &(&eps * &eps))
}

/// Divides a shared value by `2^bits` using a truncation pair.
///
/// The value must be smaller than `2^60` in absolute value; the result may be off by one.
#[instrument(level = Level::TRACE, skip(ctx, x), err)]
pub(super) async fn truncate<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
    bits: u32,
) -> Result<RingTensor, Error> {
    if bits == 0 {
        return Ok(x.clone());
    }
    let (r, shifted) = ctx.trunc_pair(x.shape(), bits)?;
    let masked = add_public_scalar(ctx, &(x + &r), Wrapping(1 << 61));
    let c = reveal(ctx, &masked, "truncation").await?;
    let bits = bits as usize;
    let public = c.mapv(|v| (v >> bits) - Wrapping(1 << (61 - bits)));
    add_public(ctx, &shifted.mapv(|v| -v), &public)
}

/// Shares of `1` where `x < 0` and of `0` elsewhere (without fixed-point scaling).
pub(super) async fn ltz<C: Channel>(ctx: &Context<C>, x: &RingTensor) -> Result<RingTensor, Error> {
    let binary = super::binary::from_arithmetic(ctx, x).await?;
    let sign = binary.mapv(|v| v >> 63usize);
    super::binary::bits_to_arithmetic(ctx, &sign).await
}

/// A shared fixed-point value uniform in `[0, 1)`.
pub(super) fn rand<C: Channel>(ctx: &Context<C>, shape: &[usize]) -> Result<RingTensor, Error> {
    let bits = ctx.encoder().precision_bits() as usize;
    let mut bits_shape = vec![bits];
    bits_shape.extend_from_slice(shape);
    let (planes, _) = ctx.b2a_bits(&bits_shape)?;
    let mut value = ring::zeros(shape);
    for (i, plane) in planes.axis_iter(Axis(0)).enumerate() {
        value = value + plane.mapv(|v| v << i);
    }
    Ok(value)
}

/// A shared fixed-point value approximately following the standard normal distribution.
///
/// Sums 12 uniform values and subtracts 6 (Irwin-Hall).
pub(super) fn randn<C: Channel>(ctx: &Context<C>, shape: &[usize]) -> Result<RingTensor, Error> {
    let mut uniform_shape = vec![12];
    uniform_shape.extend_from_slice(shape);
    let uniform = rand(ctx, &uniform_shape)?;
    let sum = uniform.fold_axis(Axis(0), Wrapping(0), |acc, v| acc + v);
    Ok(add_public_scalar(ctx, &sum, ctx.encoder().encode_scalar(-6.0)))
}

/// Multiplies the shares of a `{0, 1}` value by the fixed-point scale.
pub(super) fn scale_bits<C: Channel>(ctx: &Context<C>, bits: &RingTensor) -> RingTensor {
    let scale = Wrapping(ctx.encoder().scale());
    bits.mapv(|v| v * scale)
}

/// `public - x`, e.g. `1 - b` for a shared bit `b`.
pub(super) fn sub_from_public<C: Channel>(
    ctx: &Context<C>,
    public: Ring,
    x: &RingTensor,
) -> RingTensor {
    add_public_scalar(ctx, &x.mapv(|v| -v), public)
}

/// Sums an arithmetic share with the XOR-opened bit `c`: `c + r - 2 c r` for shared bits `r`.
pub(super) fn flip_bits<C: Channel>(
    ctx: &Context<C>,
    r: &RingTensor,
    c: &RingTensor,
) -> Result<RingTensor, Error> {
    ring::check_same_shape(r.shape(), c.shape())?;
    let flipped = Zip::from(r)
        .and(c)
        .map_collect(|r, c| if c.0 & 1 == 1 { -*r } else { *r });
    add_public(ctx, &flipped, c)
}

#[cfg(test)]
mod tests {
    use std::num::Wrapping;

    use futures::future::try_join_all;
    use ndarray::{ArrayD, IxDyn};

    use crate::{
        Config, Context, channel::SimpleChannel, provider::TripleOp, ring, ring::RingTensor,
    };

    async fn contexts(parties: usize) -> Vec<Context<SimpleChannel>> {
        try_join_all(
            SimpleChannel::channels(parties)
                .into_iter()
                .enumerate()
                .map(|(rank, ch)| Context::init(ch, rank, parties, Config::default())),
        )
        .await
        .unwrap()
    }

    fn share(ctxs: &[Context<SimpleChannel>], values: &[i64]) -> Vec<RingTensor> {
        let value: RingTensor =
            ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.iter().map(|v| Wrapping(*v as u64)).collect())
                .unwrap();
        ctxs.iter()
            .map(|c| {
                let zero = c.zero_share(&[values.len()]);
                if c.rank() == 0 { zero + &value } else { zero }
            })
            .collect()
    }

    fn open(shares: &[RingTensor]) -> Vec<i64> {
        ring::sum_all(shares).unwrap().iter().map(|v| v.0 as i64).collect()
    }

    #[tokio::test]
    async fn beaver_multiplies() {
        let ctxs = contexts(3).await;
        let x = share(&ctxs, &[3, -4, 5]);
        let y = share(&ctxs, &[-2, -2, 7]);
        let z = try_join_all(
            ctxs.iter()
                .enumerate()
                .map(|(i, c)| super::beaver(c, &x[i], &y[i], TripleOp::Mul)),
        )
        .await
        .unwrap();
        assert_eq!(open(&z), vec![-6, 8, 35]);
    }

    #[tokio::test]
    async fn truncation_is_off_by_at_most_one() {
        let ctxs = contexts(2).await;
        let values = [1 << 20, -(1 << 20), 12345 << 16, -7];
        let x = share(&ctxs, &values);
        let z = try_join_all(
            ctxs.iter()
                .enumerate()
                .map(|(i, c)| super::truncate(c, &x[i], 16)),
        )
        .await
        .unwrap();
        for (got, v) in open(&z).into_iter().zip(values) {
            assert!((got - (v >> 16)).abs() <= 1, "{got} vs {}", v >> 16);
        }
    }

    #[tokio::test]
    async fn ltz_extracts_the_sign() {
        let ctxs = contexts(3).await;
        let x = share(&ctxs, &[-5, 0, 9, i64::MIN / 4]);
        let bits = try_join_all(ctxs.iter().enumerate().map(|(i, c)| super::ltz(c, &x[i])))
            .await
            .unwrap();
        assert_eq!(open(&bits), vec![1, 0, 0, 1]);
    }

    #[tokio::test]
    async fn rand_is_a_fraction() {
        let ctxs = contexts(2).await;
        let shares: Vec<_> = ctxs.iter().map(|c| super::rand(c, &[32]).unwrap()).collect();
        assert!(open(&shares).iter().all(|v| (0..1 << 16).contains(v)));
    }
}
