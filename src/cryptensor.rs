//! Encrypted tensors and the operations of their sharing schemes.
//!
//! A [`CrypTensor`] holds this party's share of a fixed-point encoded tensor. Operations take the
//! [`Context`] of the party; those that need interaction are `async` and must be called by all
//! parties in the same order.

mod arithmetic;
mod binary;

use ndarray::{ArrayD, Axis, IxDyn, concatenate, stack};
use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

use crate::{
    channel::Channel,
    context::Context,
    error::Error,
    provider::TripleOp,
    registry::SchemeKind,
    ring::{self, RingTensor},
    value::{Tensor, Value},
};

/// This party's share of a secret-shared tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrypTensor {
    kind: SchemeKind,
    type_name: String,
    share: RingTensor,
    src: Option<usize>,
    requires_grad: bool,
}

/// The right-hand side of a binary operation.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// Another encrypted tensor; converted to the scheme of the receiver if necessary.
    Encrypted(&'a CrypTensor),
    /// A plaintext tensor of the same shape as the receiver, known to all parties.
    Plain(&'a Tensor),
    /// A public scalar.
    Scalar(f64),
}

impl<'a> From<&'a CrypTensor> for Operand<'a> {
    fn from(t: &'a CrypTensor) -> Self {
        Operand::Encrypted(t)
    }
}

impl<'a> From<&'a Tensor> for Operand<'a> {
    fn from(t: &'a Tensor) -> Self {
        Operand::Plain(t)
    }
}

impl From<f64> for Operand<'_> {
    fn from(x: f64) -> Self {
        Operand::Scalar(x)
    }
}

impl<'a> From<&'a Value> for Operand<'a> {
    fn from(v: &'a Value) -> Self {
        match v {
            Value::Plain(t) => Operand::Plain(t),
            Value::Encrypted(t) => Operand::Encrypted(t),
        }
    }
}

/// An operand prepared for an elementwise operation.
enum Rhs {
    Shared { share: RingTensor, requires_grad: bool },
    Public(RingTensor),
}

impl Rhs {
    fn requires_grad(&self) -> bool {
        matches!(self, Rhs::Shared { requires_grad: true, .. })
    }

    /// A public value is shared by letting party 0 hold it; valid for both schemes.
    fn into_share<C: Channel>(self, ctx: &Context<C>) -> RingTensor {
        match self {
            Rhs::Shared { share, .. } => share,
            Rhs::Public(public) => binary::public_share(ctx, &public),
        }
    }
}

impl CrypTensor {
    /// Shares `data` of party `src`; the data of all other parties is only used for its shape.
    pub(crate) fn from_plain<C: Channel>(
        ctx: &Context<C>,
        data: &Tensor,
        src: usize,
        type_name: String,
        kind: SchemeKind,
        requires_grad: bool,
    ) -> Result<Self, Error> {
        ctx.comm().validate_src(src)?;
        let shape = data.shape();
        let share = match kind {
            SchemeKind::Arithmetic => {
                let zero = ctx.zero_share(shape);
                if ctx.rank() == src {
                    zero + &ctx.encoder().encode(data)
                } else {
                    zero
                }
            }
            SchemeKind::Binary => {
                let zero = ctx.zero_xor_share(shape);
                if ctx.rank() == src {
                    zero ^ &ctx.encoder().encode(data)
                } else {
                    zero
                }
            }
        };
        Ok(Self {
            kind,
            type_name,
            share,
            src: Some(src),
            requires_grad: requires_grad && ctx.is_grad_enabled(),
        })
    }

    /// The shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.share.shape()
    }

    /// The shape of the tensor (alias of [`CrypTensor::shape`]).
    pub fn size(&self) -> &[usize] {
        self.shape()
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.share.len()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.share.is_empty()
    }

    /// The sharing scheme.
    pub fn kind(&self) -> SchemeKind {
        self.kind
    }

    /// The registered name the tensor was created under.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The party the tensor was loaded or shared from, if known.
    pub fn src(&self) -> Option<usize> {
        self.src
    }

    pub(crate) fn with_src(mut self, src: usize) -> Self {
        self.src = Some(src);
        self
    }

    /// Whether gradients should be tracked for this tensor.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Marks the tensor as requiring gradients (or not).
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// This party's share. A single share reveals nothing about the plaintext.
    pub fn share(&self) -> &RingTensor {
        &self.share
    }

    fn derive<C: Channel>(&self, ctx: &Context<C>, share: RingTensor, other_grad: bool) -> Self {
        Self {
            kind: self.kind,
            type_name: self.type_name.clone(),
            share,
            src: None,
            requires_grad: ctx.is_grad_enabled() && (self.requires_grad || other_grad),
        }
    }

    fn with_share(&self, share: RingTensor) -> Self {
        Self {
            share,
            ..self.clone()
        }
    }

    fn unsupported(&self, op: &'static str) -> Error {
        Error::UnsupportedOperation {
            op,
            scheme: self.kind,
        }
    }

    /// This party's share of the same value in the sharing of `kind`.
    async fn share_as<C: Channel>(
        &self,
        ctx: &Context<C>,
        kind: SchemeKind,
    ) -> Result<RingTensor, Error> {
        match (self.kind, kind) {
            (SchemeKind::Arithmetic, SchemeKind::Binary) => {
                binary::from_arithmetic(ctx, &self.share).await
            }
            (SchemeKind::Binary, SchemeKind::Arithmetic) => {
                binary::to_arithmetic(ctx, &self.share).await
            }
            _ => Ok(self.share.clone()),
        }
    }

    async fn elementwise<C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: Operand<'_>,
    ) -> Result<Rhs, Error> {
        match rhs {
            Operand::Encrypted(t) => {
                ring::check_same_shape(self.shape(), t.shape())?;
                Ok(Rhs::Shared {
                    share: t.share_as(ctx, self.kind).await?,
                    requires_grad: t.requires_grad,
                })
            }
            Operand::Plain(t) => {
                ring::check_same_shape(self.shape(), t.shape())?;
                Ok(Rhs::Public(ctx.encoder().encode(t)))
            }
            Operand::Scalar(x) => Ok(Rhs::Public(ring::filled(
                self.shape(),
                ctx.encoder().encode_scalar(x),
            ))),
        }
    }

    /// Converts the tensor to the sharing of `kind`, named by the first name `kind` was
    /// registered under.
    #[instrument(level = Level::DEBUG, skip(self, ctx), err)]
    pub async fn convert<C: Channel>(
        &self,
        ctx: &Context<C>,
        kind: SchemeKind,
    ) -> Result<CrypTensor, Error> {
        if self.kind == kind {
            return Ok(self.clone());
        }
        let share = self.share_as(ctx, kind).await?;
        Ok(Self {
            kind,
            type_name: ctx.cryptensor_type_name(kind)?,
            share,
            src: self.src,
            requires_grad: self.requires_grad,
        })
    }

    /// Converts the tensor to XOR sharing.
    pub async fn to_binary<C: Channel>(&self, ctx: &Context<C>) -> Result<CrypTensor, Error> {
        self.convert(ctx, SchemeKind::Binary).await
    }

    /// Converts the tensor to additive sharing.
    pub async fn to_arithmetic<C: Channel>(&self, ctx: &Context<C>) -> Result<CrypTensor, Error> {
        self.convert(ctx, SchemeKind::Arithmetic).await
    }

    /// Opens the tensor to all parties.
    #[instrument(level = Level::DEBUG, skip_all, fields(shape = ?self.shape()), err)]
    pub async fn get_plain_text<C: Channel>(&self, ctx: &Context<C>) -> Result<Tensor, Error> {
        let value = match self.kind {
            SchemeKind::Arithmetic => arithmetic::reveal(ctx, &self.share, "plaintext").await?,
            SchemeKind::Binary => binary::reveal(ctx, &self.share, "plaintext").await?,
        };
        Ok(ctx.encoder().decode(&value))
    }

    /// Elementwise `self + rhs`.
    pub async fn add<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        let rhs = self.elementwise(ctx, rhs.into()).await?;
        let grad = rhs.requires_grad();
        let y = rhs.into_share(ctx);
        let share = match self.kind {
            SchemeKind::Arithmetic => &self.share + &y,
            SchemeKind::Binary => binary::add(ctx, &self.share, &y).await?,
        };
        Ok(self.derive(ctx, share, grad))
    }

    /// Elementwise `self - rhs`.
    pub async fn sub<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        let rhs = self.elementwise(ctx, rhs.into()).await?;
        let grad = rhs.requires_grad();
        let y = rhs.into_share(ctx);
        let share = match self.kind {
            SchemeKind::Arithmetic => &self.share - &y,
            SchemeKind::Binary => binary::sub(ctx, &self.share, &y).await?,
        };
        Ok(self.derive(ctx, share, grad))
    }

    /// Elementwise `-self`.
    pub async fn neg<C: Channel>(&self, ctx: &Context<C>) -> Result<CrypTensor, Error> {
        let share = match self.kind {
            SchemeKind::Arithmetic => self.share.mapv(|v| -v),
            SchemeKind::Binary => binary::neg(ctx, &self.share).await?,
        };
        Ok(self.derive(ctx, share, false))
    }

    /// Elementwise `self * rhs`. Only supported by additive sharing.
    pub async fn mul<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        if self.kind != SchemeKind::Arithmetic {
            return Err(self.unsupported("mul"));
        }
        let rhs = self.elementwise(ctx, rhs.into()).await?;
        let grad = rhs.requires_grad();
        let product = match rhs {
            Rhs::Shared { share, .. } => {
                arithmetic::beaver(ctx, &self.share, &share, TripleOp::Mul).await?
            }
            Rhs::Public(public) => &self.share * &public,
        };
        let bits = ctx.encoder().precision_bits();
        let share = arithmetic::truncate(ctx, &product, bits).await?;
        Ok(self.derive(ctx, share, grad))
    }

    /// Elementwise `self * self`. Only supported by additive sharing.
    pub async fn square<C: Channel>(&self, ctx: &Context<C>) -> Result<CrypTensor, Error> {
        if self.kind != SchemeKind::Arithmetic {
            return Err(self.unsupported("square"));
        }
        let product = arithmetic::square(ctx, &self.share).await?;
        let bits = ctx.encoder().precision_bits();
        let share = arithmetic::truncate(ctx, &product, bits).await?;
        Ok(self.derive(ctx, share, false))
    }

    /// Matrix product `self @ rhs` of two matrices. Only supported by additive sharing.
    pub async fn matmul<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        if self.kind != SchemeKind::Arithmetic {
            return Err(self.unsupported("matmul"));
        }
        let (product, grad) = match rhs.into() {
            Operand::Encrypted(t) => {
                let y = t.share_as(ctx, SchemeKind::Arithmetic).await?;
                let product = arithmetic::beaver(ctx, &self.share, &y, TripleOp::Matmul).await?;
                (product, t.requires_grad)
            }
            Operand::Plain(t) => (ring::matmul(&self.share, &ctx.encoder().encode(t))?, false),
            Operand::Scalar(_) => {
                return Err(Error::InvalidInput(
                    "matmul requires a matrix operand".into(),
                ));
            }
        };
        let bits = ctx.encoder().precision_bits();
        let share = arithmetic::truncate(ctx, &product, bits).await?;
        Ok(self.derive(ctx, share, grad))
    }

    /// Shares of `1.0` where `self < rhs` (or `rhs < self` if `reversed`), `0.0` elsewhere.
    async fn less_than<C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: Operand<'_>,
        reversed: bool,
    ) -> Result<RingTensor, Error> {
        let y = self.elementwise(ctx, rhs).await?.into_share(ctx);
        let (l, r) = if reversed {
            (&y, &self.share)
        } else {
            (&self.share, &y)
        };
        match self.kind {
            SchemeKind::Arithmetic => {
                let bits = arithmetic::ltz(ctx, &(l - r)).await?;
                Ok(arithmetic::scale_bits(ctx, &bits))
            }
            SchemeKind::Binary => {
                let diff = binary::sub(ctx, l, r).await?;
                Ok(binary::sign_to_fixed_point(
                    &diff,
                    ctx.encoder().precision_bits(),
                ))
            }
        }
    }

    fn not_fixed_point<C: Channel>(
        &self,
        ctx: &Context<C>,
        bits: &RingTensor,
    ) -> Result<RingTensor, Error> {
        match self.kind {
            SchemeKind::Arithmetic => Ok(arithmetic::sub_from_public(
                ctx,
                ctx.encoder().encode_scalar(1.0),
                bits,
            )),
            SchemeKind::Binary => binary::flip_fixed_point_bit(ctx, bits),
        }
    }

    /// Elementwise `self < rhs` as shares of `1.0` / `0.0`.
    pub async fn lt<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        let share = self.less_than(ctx, rhs.into(), false).await?;
        Ok(self.derive(ctx, share, false).detached())
    }

    /// Elementwise `self > rhs` as shares of `1.0` / `0.0`.
    pub async fn gt<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        let share = self.less_than(ctx, rhs.into(), true).await?;
        Ok(self.derive(ctx, share, false).detached())
    }

    /// Elementwise `self >= rhs` as shares of `1.0` / `0.0`.
    pub async fn ge<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        let lt = self.less_than(ctx, rhs.into(), false).await?;
        let share = self.not_fixed_point(ctx, &lt)?;
        Ok(self.derive(ctx, share, false).detached())
    }

    /// Elementwise `self <= rhs` as shares of `1.0` / `0.0`.
    pub async fn le<'a, C: Channel>(
        &self,
        ctx: &Context<C>,
        rhs: impl Into<Operand<'a>>,
    ) -> Result<CrypTensor, Error> {
        let gt = self.less_than(ctx, rhs.into(), true).await?;
        let share = self.not_fixed_point(ctx, &gt)?;
        Ok(self.derive(ctx, share, false).detached())
    }

    fn detached(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    /// Sums all elements (`axis == None`) or the elements along one axis.
    pub async fn sum<C: Channel>(
        &self,
        ctx: &Context<C>,
        axis: Option<usize>,
    ) -> Result<CrypTensor, Error> {
        if let Some(axis) = axis {
            self.check_axis(axis, self.share.ndim())?;
        }
        let additive = self.share_as(ctx, SchemeKind::Arithmetic).await?;
        let summed = match axis {
            Some(axis) => additive.fold_axis(Axis(axis), std::num::Wrapping(0), |acc, v| acc + v),
            None => ring::filled(&[], additive.fold(std::num::Wrapping(0), |acc, v| acc + v)),
        };
        let share = match self.kind {
            SchemeKind::Arithmetic => summed,
            SchemeKind::Binary => binary::from_arithmetic(ctx, &summed).await?,
        };
        Ok(self.derive(ctx, share, false))
    }

    fn check_axis(&self, axis: usize, bound: usize) -> Result<(), Error> {
        if axis < bound {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "dimension {axis} is out of range for a tensor of shape {:?}",
                self.shape()
            )))
        }
    }

    /// The same values in a different shape with the same number of elements.
    pub fn reshape(&self, shape: &[usize]) -> Result<CrypTensor, Error> {
        if shape.iter().product::<usize>() != self.len() {
            return Err(Error::ShapeMismatch {
                left: self.shape().to_vec(),
                right: shape.to_vec(),
            });
        }
        let share = ArrayD::from_shape_vec(IxDyn(shape), self.share.iter().copied().collect())?;
        Ok(self.with_share(share))
    }

    /// Inserts a dimension of length one at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<CrypTensor, Error> {
        self.check_axis(dim, self.share.ndim() + 1)?;
        Ok(self.with_share(self.share.clone().insert_axis(Axis(dim))))
    }

    /// The values as a one-dimensional tensor.
    pub fn flatten(&self) -> Result<CrypTensor, Error> {
        self.reshape(&[self.len()])
    }

    /// Reverses the order of the dimensions (the transpose of a matrix).
    pub fn transpose(&self) -> CrypTensor {
        self.with_share(self.share.t().to_owned())
    }

    fn check_same_type(tensors: &[CrypTensor], op: &str) -> Result<(), Error> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::InvalidInput(format!("{op} requires at least one tensor")))?;
        match tensors.iter().find(|t| t.type_name != first.type_name) {
            Some(other) => Err(Error::TypeMismatch(format!(
                "cannot {op} CrypTensors of types {} and {}",
                first.type_name, other.type_name
            ))),
            None => Ok(()),
        }
    }

    /// Concatenates tensors of the same type along an existing dimension.
    pub fn cat(tensors: &[CrypTensor], dim: usize) -> Result<CrypTensor, Error> {
        Self::check_same_type(tensors, "cat")?;
        let first = &tensors[0];
        first.check_axis(dim, first.share.ndim())?;
        let views: Vec<_> = tensors.iter().map(|t| t.share.view()).collect();
        let share = concatenate(Axis(dim), &views)?;
        Ok(Self {
            share,
            src: None,
            requires_grad: tensors.iter().any(|t| t.requires_grad),
            ..first.clone()
        })
    }

    /// Stacks tensors of the same type and shape along a new dimension.
    pub fn stack(tensors: &[CrypTensor], dim: usize) -> Result<CrypTensor, Error> {
        Self::check_same_type(tensors, "stack")?;
        let first = &tensors[0];
        first.check_axis(dim, first.share.ndim() + 1)?;
        let views: Vec<_> = tensors.iter().map(|t| t.share.view()).collect();
        let share = stack(Axis(dim), &views)?;
        Ok(Self {
            share,
            src: None,
            requires_grad: tensors.iter().any(|t| t.requires_grad),
            ..first.clone()
        })
    }

    /// A tensor of uniform values in `[0, 1)`.
    pub(crate) fn rand<C: Channel>(
        ctx: &Context<C>,
        shape: &[usize],
        type_name: String,
        kind: SchemeKind,
    ) -> Result<CrypTensor, Error> {
        let share = match kind {
            SchemeKind::Arithmetic => arithmetic::rand(ctx, shape)?,
            SchemeKind::Binary => binary::rand(ctx, shape),
        };
        Ok(Self {
            kind,
            type_name,
            share,
            src: None,
            requires_grad: false,
        })
    }

    /// A tensor of approximately standard normal values.
    pub(crate) async fn randn<C: Channel>(
        ctx: &Context<C>,
        shape: &[usize],
        type_name: String,
        kind: SchemeKind,
    ) -> Result<CrypTensor, Error> {
        let additive = arithmetic::randn(ctx, shape)?;
        let share = match kind {
            SchemeKind::Arithmetic => additive,
            SchemeKind::Binary => binary::from_arithmetic(ctx, &additive).await?,
        };
        Ok(Self {
            kind,
            type_name,
            share,
            src: None,
            requires_grad: false,
        })
    }
}
