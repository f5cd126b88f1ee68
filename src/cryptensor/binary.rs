//! XOR sharing of 64-bit words: `x = XOR of all shares`.

use std::num::Wrapping;

use ndarray::{Axis, Slice, concatenate, stack};
use tracing::{Level, instrument};

use crate::{
    channel::Channel,
    context::Context,
    error::Error,
    ring::{self, Ring, RingTensor},
};

/// XORs a public value into a share; only party 0 applies it.
pub(super) fn xor_public<C: Channel>(
    ctx: &Context<C>,
    share: &RingTensor,
    public: &RingTensor,
) -> Result<RingTensor, Error> {
    ring::check_same_shape(share.shape(), public.shape())?;
    if ctx.rank() == 0 {
        Ok(share ^ public)
    } else {
        Ok(share.clone())
    }
}

/// The share of a public value: the value itself on party 0, zero elsewhere.
pub(super) fn public_share<C: Channel>(ctx: &Context<C>, public: &RingTensor) -> RingTensor {
    if ctx.rank() == 0 {
        public.clone()
    } else {
        ring::zeros(public.shape())
    }
}

pub(super) fn not<C: Channel>(ctx: &Context<C>, share: &RingTensor) -> RingTensor {
    if ctx.rank() == 0 {
        share.mapv(|v| !v)
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
    ring::xor_all(&shares)
}

/// Bitwise AND of two shared values with a binary Beaver triple.
pub(super) async fn and<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    ring::check_same_shape(x.shape(), y.shape())?;
    let (a, b, c) = ctx.binary_triple(x.shape())?;
    let opened = ctx.comm().all_gather((x ^ &a, y ^ &b), "binary and").await?;
    let (eps, delta): (Vec<_>, Vec<_>) = opened.into_iter().unzip();
    let eps = ring::xor_all(&eps)?;
    let delta = ring::xor_all(&delta)?;
    let z = c ^ &(&eps & &b) ^ &(&a & &delta);
    xor_public(ctx, &z, &(&eps & &delta))
}

/// Wrapping addition of two shared values with a Kogge-Stone adder (6 rounds of AND).
#[instrument(level = Level::TRACE, skip_all, err)]
pub(super) async fn add<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    let mut generate = and(ctx, x, y).await?;
    let mut propagate = x ^ y;
    let sum = propagate.clone();
    for round in 0..6 {
        let shift = 1usize << round;
        let generate_shifted = generate.mapv(|v| v << shift);
        let propagate_shifted = propagate.mapv(|v| v << shift);
        // both ANDs of a round share one opening
        let lhs = stack(Axis(0), &[propagate.view(), propagate.view()])?;
        let rhs = stack(Axis(0), &[generate_shifted.view(), propagate_shifted.view()])?;
        let products = and(ctx, &lhs, &rhs).await?;
        generate = generate ^ &products.index_axis(Axis(0), 0);
        propagate = products.index_axis(Axis(0), 1).to_owned();
    }
    Ok(sum ^ &generate.mapv(|v| v << 1usize))
}

/// Two's complement negation `!x + 1`.
pub(super) async fn neg<C: Channel>(ctx: &Context<C>, x: &RingTensor) -> Result<RingTensor, Error> {
    let one = public_share(ctx, &ring::filled(x.shape(), Wrapping(1)));
    add(ctx, &not(ctx, x), &one).await
}

pub(super) async fn sub<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
    y: &RingTensor,
) -> Result<RingTensor, Error> {
    let neg_y = neg(ctx, y).await?;
    add(ctx, x, &neg_y).await
}

/// Converts an additive sharing into a XOR sharing of the same value.
///
/// Every party XOR-shares its own additive share, then all of them are summed with the adder, two
/// at a time per level.
#[instrument(level = Level::TRACE, skip_all, err)]
pub(super) async fn from_arithmetic<C: Channel>(
    ctx: &Context<C>,
    share: &RingTensor,
) -> Result<RingTensor, Error> {
    let terms: Vec<RingTensor> = (0..ctx.world_size())
        .map(|party| {
            let mask = ctx.zero_xor_share(share.shape());
            if party == ctx.rank() { mask ^ share } else { mask }
        })
        .collect();
    let views: Vec<_> = terms.iter().map(|t| t.view()).collect();
    let mut terms = stack(Axis(0), &views)?;
    while terms.len_of(Axis(0)) > 1 {
        let n = terms.len_of(Axis(0));
        let half = n / 2;
        let lhs = terms.slice_axis(Axis(0), Slice::from(0..half)).to_owned();
        let rhs = terms.slice_axis(Axis(0), Slice::from(half..2 * half)).to_owned();
        let sums = add(ctx, &lhs, &rhs).await?;
        terms = if n % 2 == 1 {
            concatenate(
                Axis(0),
                &[sums.view(), terms.slice_axis(Axis(0), Slice::from(2 * half..n))],
            )?
        } else {
            sums
        };
    }
    Ok(terms.index_axis_move(Axis(0), 0))
}

/// Converts XOR shares of single bits (in the lowest bit) into additive shares of the bits.
pub(super) async fn bits_to_arithmetic<C: Channel>(
    ctx: &Context<C>,
    bits: &RingTensor,
) -> Result<RingTensor, Error> {
    let (r_arithmetic, r_binary) = ctx.b2a_bits(bits.shape())?;
    let c = reveal(ctx, &(bits ^ &r_binary), "bit conversion").await?;
    super::arithmetic::flip_bits(ctx, &r_arithmetic, &c)
}

/// Converts a XOR sharing into an additive sharing of the same value, one bit plane at a time.
#[instrument(level = Level::TRACE, skip_all, err)]
pub(super) async fn to_arithmetic<C: Channel>(
    ctx: &Context<C>,
    share: &RingTensor,
) -> Result<RingTensor, Error> {
    let planes: Vec<RingTensor> = (0..64usize)
        .map(|i| share.mapv(|v| (v >> i) & Wrapping(1)))
        .collect();
    let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
    let bits = bits_to_arithmetic(ctx, &stack(Axis(0), &views)?).await?;
    let mut value = ring::zeros(share.shape());
    for (i, plane) in bits.axis_iter(Axis(0)).enumerate() {
        value = value + plane.mapv(|v| v << i);
    }
    Ok(value)
}

/// The sign bit of `x` moved to the position of the fixed-point one: shares of `1.0` where
/// `x < 0`, of `0.0` elsewhere.
pub(super) fn sign_to_fixed_point(x: &RingTensor, precision_bits: u32) -> RingTensor {
    let precision_bits = precision_bits as usize;
    x.mapv(|v| (v >> 63usize) << precision_bits)
}

/// A shared fixed-point value uniform in `[0, 1)`; every party contributes local random bits.
pub(super) fn rand<C: Channel>(ctx: &Context<C>, shape: &[usize]) -> RingTensor {
    ctx.local_random_bits(shape, ctx.encoder().precision_bits())
}

/// XORs the public fixed-point one into a shared bit at the fixed-point position (`1 - b`).
pub(super) fn flip_fixed_point_bit<C: Channel>(
    ctx: &Context<C>,
    x: &RingTensor,
) -> Result<RingTensor, Error> {
    let one: Ring = Wrapping(ctx.encoder().scale());
    xor_public(ctx, x, &ring::filled(x.shape(), one))
}
