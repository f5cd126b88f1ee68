//! Combinators over plaintext and encrypted values.

use ndarray::{Axis, concatenate};
use tracing::{Level, instrument};

use crate::{
    channel::Channel,
    context::Context,
    cryptensor::CrypTensor,
    error::Error,
    registry::SchemeKind,
    ring,
    value::Value,
};

/// Selects elements of `a` where `condition` is 1 and of `b` where it is 0.
///
/// Computes `condition * a + (1 - condition) * b`, so an encrypted condition reveals nothing about
/// the selected branch. Boolean conditions are coerced with [`Value::from_mask`]. Encrypted
/// operands are evaluated with additive sharing and the result is encrypted if any input is.
#[instrument(level = Level::DEBUG, skip_all, fields(shape = ?condition.shape()), err)]
pub async fn where_<C: Channel>(
    ctx: &Context<C>,
    condition: &Value,
    a: &Value,
    b: &Value,
) -> Result<Value, Error> {
    let (cond, not_cond) = match condition {
        Value::Encrypted(c) => {
            let c = c.to_arithmetic(ctx).await?;
            let not_c = c.neg(ctx).await?.add(ctx, 1.0).await?;
            (Value::from(c), Value::from(not_c))
        }
        Value::Plain(c) => (Value::Plain(c.clone()), Value::Plain(c.mapv(|v| 1.0 - v))),
    };
    let a = arithmetic(ctx, a).await?;
    let b = arithmetic(ctx, b).await?;
    let left = scaled(ctx, &cond, &a).await?;
    let right = scaled(ctx, &not_cond, &b).await?;
    sum(ctx, left, right).await
}

async fn arithmetic<C: Channel>(ctx: &Context<C>, v: &Value) -> Result<Value, Error> {
    match v {
        Value::Encrypted(t) if t.kind() == SchemeKind::Binary => {
            Ok(t.to_arithmetic(ctx).await?.into())
        }
        v => Ok(v.clone()),
    }
}

async fn scaled<C: Channel>(ctx: &Context<C>, w: &Value, x: &Value) -> Result<Value, Error> {
    match (w, x) {
        (Value::Encrypted(w), x) => Ok(w.mul(ctx, x).await?.into()),
        (w, Value::Encrypted(x)) => Ok(x.mul(ctx, w).await?.into()),
        (Value::Plain(w), Value::Plain(x)) => {
            ring::check_same_shape(w.shape(), x.shape())?;
            Ok(Value::Plain(w * x))
        }
    }
}

async fn sum<C: Channel>(ctx: &Context<C>, l: Value, r: Value) -> Result<Value, Error> {
    match (l, r) {
        (Value::Encrypted(l), r) => Ok(l.add(ctx, &r).await?.into()),
        (l, Value::Encrypted(r)) => Ok(r.add(ctx, &l).await?.into()),
        (Value::Plain(l), Value::Plain(r)) => {
            ring::check_same_shape(l.shape(), r.shape())?;
            Ok(Value::Plain(l + r))
        }
    }
}

fn all_encrypted(values: &[Value], op: &str) -> Result<Vec<CrypTensor>, Error> {
    values
        .iter()
        .map(|v| {
            v.as_encrypted().cloned().ok_or_else(|| {
                Error::TypeMismatch(format!("inputs to {op} must all be CrypTensors"))
            })
        })
        .collect()
}

/// Concatenates values along the existing dimension `dim`.
///
/// Plaintext lists are concatenated in plaintext. Encrypted lists must share one scheme. A single
/// value is returned unchanged.
pub fn cat(values: &[Value], dim: usize) -> Result<Value, Error> {
    if values.is_empty() {
        return Err(Error::InvalidInput("input to cat must be a non-empty list".into()));
    }
    let plain: Option<Vec<_>> = values.iter().map(|v| v.as_plain().map(|t| t.view())).collect();
    if let Some(views) = plain {
        return Ok(Value::Plain(concatenate(Axis(dim), &views)?));
    }
    let tensors = all_encrypted(values, "cat")?;
    match tensors.as_slice() {
        [single] => Ok(Value::Encrypted(single.clone())),
        tensors => Ok(CrypTensor::cat(tensors, dim)?.into()),
    }
}

/// Stacks encrypted values of one scheme along a new dimension `dim`.
///
/// A single value gets a new dimension of length one.
pub fn stack(values: &[Value], dim: usize) -> Result<Value, Error> {
    if values.is_empty() {
        return Err(Error::InvalidInput("input to stack must be a non-empty list".into()));
    }
    let tensors = all_encrypted(values, "stack")?;
    match tensors.as_slice() {
        [single] => Ok(single.unsqueeze(dim)?.into()),
        tensors => Ok(CrypTensor::stack(tensors, dim)?.into()),
    }
}

/// An encrypted tensor of values uniform in `[0, 1)`.
pub fn rand<C: Channel>(
    ctx: &Context<C>,
    shape: &[usize],
    cryptensor_type: Option<&str>,
) -> Result<CrypTensor, Error> {
    let _guard = ctx.no_grad();
    let (type_name, kind) = ctx.resolve_cryptensor_type(cryptensor_type)?;
    CrypTensor::rand(ctx, shape, type_name, kind)
}

/// An encrypted tensor of approximately standard normal values.
pub async fn randn<C: Channel>(
    ctx: &Context<C>,
    shape: &[usize],
    cryptensor_type: Option<&str>,
) -> Result<CrypTensor, Error> {
    let (type_name, kind) = ctx.resolve_cryptensor_type(cryptensor_type)?;
    let _guard = ctx.no_grad();
    CrypTensor::randn(ctx, shape, type_name, kind).await
}

/// Encrypted `{0, 1}` samples: element `i` is 1 with probability `probs[i]`.
///
/// Compares fresh encrypted uniform values against `probs`, so the draws are never revealed.
pub async fn bernoulli<C: Channel>(
    ctx: &Context<C>,
    probs: &Value,
    cryptensor_type: Option<&str>,
) -> Result<CrypTensor, Error> {
    let uniform = rand(ctx, probs.shape(), cryptensor_type)?;
    let _guard = ctx.no_grad();
    uniform.lt(ctx, probs).await
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, Axis, IxDyn, array};

    use super::{bernoulli, cat, rand, randn, stack, where_};
    use crate::{
        Config, Error,
        factory::{CryptensorArgs, cryptensor},
        registry::{BINARY, SchemeKind},
        simulate::simulate,
        value::{Tensor, Value},
    };

    fn assert_close(got: &Tensor, expected: &Tensor) {
        assert_eq!(got.shape(), expected.shape());
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-3, "{got} vs {expected}");
        }
    }

    #[tokio::test]
    async fn where_selects_elementwise() {
        let results = simulate(3, Config::default(), |ctx| async move {
            let cond = array![1.0, 0.0, 0.0, 1.0].into_dyn();
            let a = array![1.5, 2.0, -3.0, 4.25].into_dyn();
            let b = array![-1.0, 8.0, 9.5, 0.0].into_dyn();
            let enc_cond = Value::from(cryptensor(&ctx, &cond, CryptensorArgs::default())?);
            let enc_a = Value::from(cryptensor(&ctx, &a, CryptensorArgs::default())?);
            let bin_b = Value::from(cryptensor(
                &ctx,
                &b,
                CryptensorArgs {
                    cryptensor_type: Some(BINARY),
                    src: 1,
                    ..Default::default()
                },
            )?);

            let encrypted = where_(&ctx, &enc_cond, &enc_a, &bin_b).await?;
            let Value::Encrypted(encrypted) = encrypted else {
                panic!("expected an encrypted result");
            };
            let (plain_cond, plain_b) = (Value::Plain(cond.clone()), Value::Plain(b.clone()));
            let mixed = where_(&ctx, &plain_cond, &enc_a, &plain_b).await?;
            let Value::Encrypted(mixed) = mixed else {
                panic!("expected an encrypted result");
            };
            let plain_a = Value::Plain(a);
            let plain = where_(&ctx, &plain_cond, &plain_a, &plain_b).await?;
            Ok::<_, Error>((
                encrypted.get_plain_text(&ctx).await?,
                mixed.get_plain_text(&ctx).await?,
                plain.as_plain().cloned(),
            ))
        })
        .await
        .unwrap();
        let expected = array![1.5, 8.0, 9.5, 4.25].into_dyn();
        for (encrypted, mixed, plain) in results {
            assert_close(&encrypted, &expected);
            assert_close(&mixed, &expected);
            assert_eq!(plain.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn where_rejects_mismatched_shapes() {
        let results = simulate(2, Config::default(), |ctx| async move {
            let cond = Value::Plain(ArrayD::ones(IxDyn(&[2])));
            let a = Value::Plain(ArrayD::ones(IxDyn(&[3])));
            Ok::<_, Error>(where_(&ctx, &cond, &a, &a).await.err())
        })
        .await
        .unwrap();
        assert!(results.iter().all(|e| matches!(e, Some(Error::ShapeMismatch { .. }))));
    }

    #[tokio::test]
    async fn cat_and_stack() {
        let results = simulate(2, Config::default(), |ctx| async move {
            ctx.register_cryptensor_type("xor", SchemeKind::Binary)?;
            let x = cryptensor(&ctx, &array![[1.0, 2.0]].into_dyn(), CryptensorArgs::default())?;
            let y = cryptensor(&ctx, &array![[3.0, 4.0]].into_dyn(), CryptensorArgs::default())?;
            let z = cryptensor(
                &ctx,
                &array![[5.0, 6.0]].into_dyn(),
                CryptensorArgs {
                    cryptensor_type: Some("xor"),
                    ..Default::default()
                },
            )?;
            let (xv, yv, zv) = (Value::from(x.clone()), Value::from(y), Value::from(z));

            let Value::Encrypted(single) = cat(std::slice::from_ref(&xv), 1)? else {
                panic!("expected an encrypted result");
            };
            assert_eq!(single, x);
            let Value::Encrypted(unit) = stack(std::slice::from_ref(&xv), 0)? else {
                panic!("expected an encrypted result");
            };
            assert_eq!(unit.shape(), &[1, 1, 2]);

            assert!(matches!(
                cat(&[xv.clone(), zv.clone()], 0),
                Err(Error::TypeMismatch(_))
            ));
            assert!(matches!(
                stack(&[xv.clone(), zv], 0),
                Err(Error::TypeMismatch(_))
            ));
            let plain = Value::Plain(array![[0.0, 0.0]].into_dyn());
            assert!(matches!(
                cat(&[xv.clone(), plain.clone()], 0),
                Err(Error::TypeMismatch(_))
            ));
            assert!(matches!(stack(&[plain.clone()], 0), Err(Error::TypeMismatch(_))));
            assert!(matches!(cat(&[], 0), Err(Error::InvalidInput(_))));
            assert!(matches!(stack(&[], 0), Err(Error::InvalidInput(_))));

            let Value::Plain(plain_cat) = cat(&[plain.clone(), plain], 0)? else {
                panic!("expected a plaintext result");
            };
            assert_eq!(plain_cat.shape(), &[2, 2]);

            let Value::Encrypted(rows) = cat(&[xv.clone(), yv.clone()], 0)? else {
                panic!("expected an encrypted result");
            };
            let Value::Encrypted(stacked) = stack(&[xv, yv], 1)? else {
                panic!("expected an encrypted result");
            };
            Ok::<_, Error>((
                rows.get_plain_text(&ctx).await?,
                stacked.get_plain_text(&ctx).await?,
            ))
        })
        .await
        .unwrap();
        for (rows, stacked) in results {
            assert_close(&rows, &array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
            assert_close(&stacked, &array![[[1.0, 2.0], [3.0, 4.0]]].into_dyn());
        }
    }

    #[tokio::test]
    async fn random_tensors() {
        let results = simulate(2, Config::default(), |ctx| async move {
            let uniform = rand(&ctx, &[4, 64], None)?;
            let binary = rand(&ctx, &[64], Some(BINARY))?;
            let normal = randn(&ctx, &[256], None).await?;
            let binary_normal = randn(&ctx, &[512], Some(BINARY)).await?;
            assert_eq!(binary_normal.kind(), SchemeKind::Binary);
            assert!(!uniform.requires_grad());
            assert!(matches!(rand(&ctx, &[1], Some("nope")), Err(Error::UnknownType(_))));
            Ok::<_, Error>((
                uniform.get_plain_text(&ctx).await?,
                binary.get_plain_text(&ctx).await?,
                normal.get_plain_text(&ctx).await?,
                binary_normal.get_plain_text(&ctx).await?,
            ))
        })
        .await
        .unwrap();
        let (uniform, binary, normal, binary_normal) = &results[0];
        assert_eq!(uniform, &results[1].0);
        assert_eq!(uniform.shape(), &[4, 64]);
        assert!(uniform.iter().chain(binary).all(|v| (0.0..1.0).contains(v)));
        assert!(normal.iter().all(|v| (-6.0..=6.0).contains(v)));
        let mean = normal.sum() / normal.len() as f64;
        assert!(mean.abs() < 0.5, "mean {mean}");
        assert!(binary_normal.iter().all(|v| (-6.0..=6.0).contains(v)));
        let mean = binary_normal.sum() / binary_normal.len() as f64;
        let var = binary_normal.mapv(|v| (v - mean).powi(2)).sum() / binary_normal.len() as f64;
        assert!(mean.abs() < 0.3, "mean {mean}");
        assert!((0.5..1.5).contains(&var), "variance {var}");
    }

    #[tokio::test]
    async fn bernoulli_follows_the_probabilities() {
        let results = simulate(2, Config::default(), |ctx| async move {
            let mut probs = ArrayD::from_elem(IxDyn(&[2, 64]), 0.0);
            probs.index_axis_mut(Axis(0), 1).fill(1.0);
            let samples = bernoulli(&ctx, &Value::Plain(probs), None).await?;
            samples.get_plain_text(&ctx).await
        })
        .await
        .unwrap();
        let samples = &results[0];
        assert!(samples.index_axis(Axis(0), 0).iter().all(|v| *v == 0.0));
        assert!(samples.index_axis(Axis(0), 1).iter().all(|v| *v == 1.0));
    }
}
