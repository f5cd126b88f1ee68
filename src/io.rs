//! Collective loading and saving.
//!
//! [`load_from_party`] and [`save_from_party`] move plaintext between one party and the group,
//! [`load`] and [`save`] let every party read or write its own shares.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::{Level, debug, instrument};

use crate::{
    channel::Channel,
    context::Context,
    error::Error,
    factory::{CryptensorArgs, cryptensor},
    value::{Envelope, LoadFailure, Loaded, MaybeEncrypted, Object, Placeholder},
};

/// Produces the object to be loaded on the source party.
pub type Reader<'a> = Box<dyn FnOnce() -> Result<Object, Error> + Send + 'a>;

/// Arguments of [`load_from_party`].
#[derive(Default)]
pub struct LoadFromParty<'a> {
    /// Reads the object on the source party. Exactly one of `reader` and `preloaded` must be
    /// supplied on the source party; both are ignored elsewhere.
    pub reader: Option<Reader<'a>>,
    /// An object already in memory on the source party.
    pub preloaded: Option<Object>,
    /// A model class the receiving parties accept from the source party.
    pub model_class: Option<&'a str>,
    /// The party that holds the object.
    pub src: usize,
    /// The scheme used to share a loaded tensor, or `None` for the default scheme.
    pub cryptensor_type: Option<&'a str>,
}

impl std::fmt::Debug for LoadFromParty<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadFromParty")
            .field("reader", &self.reader.is_some())
            .field("preloaded", &self.preloaded.as_ref().map(|o| o.kind()))
            .field("model_class", &self.model_class)
            .field("src", &self.src)
            .field("cryptensor_type", &self.cryptensor_type)
            .finish()
    }
}

impl LoadFailure {
    fn of(e: &Error) -> Self {
        match e {
            Error::UnsupportedLoadType(t) => LoadFailure::UnsupportedType(t.clone()),
            Error::AmbiguousInput => LoadFailure::AmbiguousInput,
            e => LoadFailure::ReadFailed(e.to_string()),
        }
    }
}

fn obtain(
    reader: Option<Reader<'_>>,
    preloaded: Option<Object>,
) -> Result<(Object, Placeholder), Error> {
    let obj = match (reader, preloaded) {
        (Some(reader), None) => reader()?,
        (None, Some(obj)) => obj,
        _ => return Err(Error::AmbiguousInput),
    };
    match Placeholder::of(&obj) {
        Some(placeholder) => Ok((obj, placeholder)),
        None => Err(Error::UnsupportedLoadType(obj.kind())),
    }
}

/// Loads an object on party `args.src` and distributes it to all parties.
///
/// The source party broadcasts a shape-only [`Placeholder`] of the object, never its values. A
/// tensor is then secret-shared from the source party, so every party receives an encrypted
/// handle; a model is returned in plaintext, real on the source party and zeroed elsewhere.
/// Every result is tagged with `src`.
///
/// Failures only the source party can detect (ambiguous input, a failing reader, an unsupported
/// object) are broadcast, so all parties fail together.
#[instrument(level = Level::DEBUG, skip_all, fields(rank = ctx.rank(), src = args.src), err)]
pub async fn load_from_party<C: Channel>(
    ctx: &Context<C>,
    args: LoadFromParty<'_>,
) -> Result<Loaded, Error> {
    let LoadFromParty {
        reader,
        preloaded,
        model_class,
        src,
        cryptensor_type,
    } = args;
    ctx.comm().validate_src(src)?;
    ctx.resolve_cryptensor_type(cryptensor_type)?;

    let obj = if ctx.rank() == src {
        let outcome = obtain(reader, preloaded);
        let envelope = match &outcome {
            Ok((_, placeholder)) => Envelope::Ready(placeholder.clone()),
            Err(e) => Envelope::Failed(LoadFailure::of(e)),
        };
        ctx.comm()
            .broadcast_obj(Some(envelope), src, "load placeholder")
            .await?;
        outcome?.0
    } else {
        if let Some(class) = model_class {
            ctx.register_safe_class(class);
        }
        match ctx
            .comm()
            .broadcast_obj::<Envelope>(None, src, "load placeholder")
            .await?
        {
            Envelope::Ready(Placeholder::Model { class, .. }) if !ctx.is_safe_class(&class) => {
                return Err(Error::UnsafeClass(class));
            }
            Envelope::Ready(placeholder) => placeholder.zeroed(),
            Envelope::Failed(LoadFailure::UnsupportedType(t)) => {
                return Err(Error::UnsupportedLoadType(t));
            }
            Envelope::Failed(failure) => {
                return Err(Error::SourceFailed {
                    src,
                    reason: failure.to_string(),
                });
            }
        }
    };
    debug!(kind = obj.kind(), "Loaded object");

    match obj {
        Object::Tensor(t) => {
            let args = CryptensorArgs {
                src,
                cryptensor_type,
                requires_grad: false,
            };
            Ok(Loaded::Encrypted(cryptensor(ctx, &t, args)?.with_src(src)))
        }
        Object::Model(mut model) => {
            model.src = Some(src);
            Ok(Loaded::Model(model))
        }
        other => Err(Error::UnsupportedLoadType(other.kind())),
    }
}

/// Loads shares written by [`save`]. Every party reads its own shares, without communication.
///
/// Fails with [`Error::InvalidUsage`] if a source party is given, which only applies to
/// [`load_from_party`].
pub fn load<T>(reader: impl FnOnce() -> Result<T, Error>, src: Option<usize>) -> Result<T, Error> {
    if src.is_some() {
        return Err(Error::InvalidUsage(
            "load() does not take a source party, use load_from_party() instead".into(),
        ));
    }
    reader()
}

/// Writes a plaintext object on party `src`, then synchronizes all parties.
///
/// No party returns before the object is written. If writing fails, every party fails.
#[instrument(level = Level::DEBUG, skip_all, fields(rank = ctx.rank(), src = src), err)]
pub async fn save_from_party<C, T, W>(
    ctx: &Context<C>,
    obj: &T,
    writer: W,
    src: usize,
) -> Result<(), Error>
where
    C: Channel,
    T: MaybeEncrypted + Sync + ?Sized,
    W: FnOnce(&T) -> Result<(), Error> + Send,
{
    if obj.is_encrypted() {
        return Err(Error::UnsupportedSaveType(obj.kind()));
    }
    ctx.comm().validate_src(src)?;
    let written = if ctx.rank() == src {
        writer(obj)
    } else {
        Ok(())
    };
    let status = written.as_ref().err().map(ToString::to_string);
    let statuses = ctx.comm().all_gather(status, "save status").await?;
    written?;
    match statuses.into_iter().nth(src).flatten() {
        Some(reason) => Err(Error::SourceFailed { src, reason }),
        None => Ok(()),
    }
}

/// Every party writes its own value (usually its shares), then all parties synchronize.
pub async fn save<C, T, W>(ctx: &Context<C>, obj: &T, writer: W) -> Result<(), Error>
where
    C: Channel,
    T: Sync + ?Sized,
    W: FnOnce(&T) -> Result<(), Error> + Send,
{
    let written = writer(obj);
    ctx.comm().barrier().await?;
    written
}

/// Writes `value` to `path` with bincode.
pub fn save_file<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<(), Error> {
    let file = BufWriter::new(File::create(path)?);
    bincode::serialize_into(file, value)?;
    Ok(())
}

/// Reads a value written by [`save_file`].
pub fn load_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let file = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(file)?)
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::{LoadFromParty, load, load_file, load_from_party, save_file};
    use crate::{
        Config, Error,
        simulate::simulate,
        value::{Model, Object, Tensor},
    };

    #[test]
    fn load_rejects_a_source_party() {
        let result = load(|| Ok(1), Some(0));
        assert!(matches!(result, Err(Error::InvalidUsage(_))));
        assert_eq!(load(|| Ok(1), None).unwrap(), 1);
    }

    #[test]
    fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tensor.bin");
        let t: Tensor = ArrayD::from_elem(IxDyn(&[2, 2]), 7.0);
        save_file(&path, &Object::Tensor(t.clone())).unwrap();
        let Object::Tensor(loaded) = load_file::<Object>(&path).unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(loaded, t);
        assert!(matches!(
            load_file::<Object>(dir.path().join("missing.bin")),
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn ambiguous_input_fails_everywhere() {
        let results = simulate(3, Config::default(), |ctx| async move {
            let result = load_from_party(
                &ctx,
                LoadFromParty {
                    src: 2,
                    ..Default::default()
                },
            )
            .await;
            Ok::<_, Error>(result.err().map(|e| e.to_string()))
        })
        .await
        .unwrap();
        assert_eq!(
            results[2].as_deref(),
            Some("exactly one of reader and preloaded must be supplied")
        );
        assert!(results[0].as_deref().unwrap().starts_with("source party 2 failed"));
        assert!(results[1].is_some());
    }

    #[tokio::test]
    async fn reader_errors_are_forwarded() {
        let results = simulate(2, Config::default(), |ctx| async move {
            let result = load_from_party(
                &ctx,
                LoadFromParty {
                    reader: Some(Box::new(|| load_file::<Object>("/nonexistent/tensor.bin"))),
                    ..Default::default()
                },
            )
            .await;
            Ok::<_, Error>(result.err())
        })
        .await
        .unwrap();
        assert!(matches!(results[0], Some(Error::Io(_))));
        assert!(matches!(results[1], Some(Error::SourceFailed { src: 0, .. })));
    }

    #[tokio::test]
    async fn models_need_an_allowlisted_class() {
        let results = simulate(3, Config::default(), |ctx| async move {
            let model = Model::new(
                "Linear",
                vec![("weight".to_string(), ArrayD::from_elem(IxDyn(&[2]), 3.0))],
            );
            let result = load_from_party(
                &ctx,
                LoadFromParty {
                    preloaded: (ctx.rank() == 0).then(|| Object::Model(model)),
                    model_class: (ctx.rank() == 1).then_some("Linear"),
                    ..Default::default()
                },
            )
            .await;
            Ok::<_, Error>(result.map(|l| l.into_model()))
        })
        .await
        .unwrap();
        let mut results = results.into_iter();
        let source = results.next().unwrap().unwrap().unwrap();
        assert_eq!(source.src, Some(0));
        assert_eq!(source.parameters[0].1[0], 3.0);
        let allowed = results.next().unwrap().unwrap().unwrap();
        assert_eq!(allowed.class, "Linear");
        assert_eq!(allowed.src, Some(0));
        assert!(allowed.parameters[0].1.iter().all(|v| *v == 0.0));
        assert!(matches!(
            results.next().unwrap(),
            Err(Error::UnsafeClass(class)) if class == "Linear"
        ));
    }
}
