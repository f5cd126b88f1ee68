//! Creating encrypted tensors and asking values about their scheme.

use crate::{
    channel::Channel, context::Context, cryptensor::CrypTensor, error::Error,
    value::{MaybeEncrypted, Tensor},
};

/// Options of [`cryptensor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptensorArgs<'a> {
    /// The party whose data is shared; the data of all other parties only provides the shape.
    pub src: usize,
    /// The registered scheme name, or `None` for the default scheme.
    pub cryptensor_type: Option<&'a str>,
    /// Whether gradients should be tracked for the new tensor.
    pub requires_grad: bool,
}

/// Secret-shares `data` with the scheme registered under `args.cryptensor_type`.
///
/// Fails with [`Error::UnknownType`] if no such scheme is registered and with
/// [`Error::InvalidSource`] if `args.src` is not a party.
pub fn cryptensor<C: Channel>(
    ctx: &Context<C>,
    data: &Tensor,
    args: CryptensorArgs<'_>,
) -> Result<CrypTensor, Error> {
    let (type_name, kind) = ctx.resolve_cryptensor_type(args.cryptensor_type)?;
    CrypTensor::from_plain(ctx, data, args.src, type_name, kind, args.requires_grad)
}

/// Whether `value` is an encrypted tensor.
pub fn is_encrypted_tensor<T: MaybeEncrypted + ?Sized>(value: &T) -> bool {
    value.is_encrypted()
}

/// The name of the scheme used when no `cryptensor_type` is specified.
pub fn get_default_cryptensor_type<C: Channel>(ctx: &Context<C>) -> String {
    ctx.get_default_cryptensor_type()
}

/// The registered name of the scheme of an encrypted tensor.
///
/// Fails with [`Error::NotACrypTensor`] for plaintext values and with
/// [`Error::UnregisteredType`] if the name of the tensor is not (or no longer) registered for its
/// scheme.
pub fn get_cryptensor_type<C: Channel, T: MaybeEncrypted + ?Sized>(
    ctx: &Context<C>,
    value: &T,
) -> Result<String, Error> {
    let tensor = value
        .as_cryptensor()
        .ok_or_else(|| Error::NotACrypTensor(value.kind()))?;
    match ctx.registry().get(tensor.type_name()) {
        Some(kind) if kind == tensor.kind() => Ok(tensor.type_name().to_string()),
        _ => Err(Error::UnregisteredType(tensor.type_name().to_string())),
    }
}
