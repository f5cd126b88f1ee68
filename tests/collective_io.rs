use std::{num::Wrapping, path::PathBuf};

use cryptensor::{
    Config, CrypTensor, Error, Object,
    factory::{CryptensorArgs, cryptensor},
    io::{LoadFromParty, load, load_file, load_from_party, save, save_file, save_from_party},
    ring::RingTensor,
    simulate::simulate,
};
use ndarray::{ArrayD, IxDyn, array};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn source_party_shares_a_loaded_tensor() -> Result<(), Error> {
    init_tracing();
    let results = simulate(3, Config::default(), |ctx| async move {
        let sevens = ArrayD::from_elem(IxDyn(&[2, 2]), 7.0);
        let loaded = load_from_party(
            &ctx,
            LoadFromParty {
                preloaded: (ctx.rank() == 1).then(|| Object::Tensor(sevens)),
                src: 1,
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(loaded.src(), Some(1));
        let Some(tensor) = loaded.into_encrypted() else {
            panic!("expected an encrypted tensor");
        };
        let plain = tensor.get_plain_text(&ctx).await?;
        Ok::<_, Error>((tensor, plain))
    })
    .await?;

    let encoded_seven = Wrapping(7u64 << 16);
    let mut total: RingTensor = ArrayD::from_elem(IxDyn(&[2, 2]), Wrapping(0));
    for (rank, (tensor, plain)) in results.iter().enumerate() {
        assert_eq!(tensor.src(), Some(1));
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(plain, &ArrayD::from_elem(IxDyn(&[2, 2]), 7.0));
        if rank != 1 {
            assert!(tensor.share().iter().all(|v| *v != encoded_seven));
        }
        total = total + tensor.share();
    }
    assert!(total.iter().all(|v| *v == encoded_seven));
    Ok(())
}

#[tokio::test]
async fn saved_plaintext_can_be_loaded_from_a_party() -> Result<(), Error> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("weights.bin");
    let results = simulate(3, Config::default(), move |ctx| {
        let path = path.clone();
        async move {
            let weights = Object::Tensor(array![[1.0, -2.5], [0.25, 4.0]].into_dyn());
            let write_path = path.clone();
            save_from_party(&ctx, &weights, |w| save_file(&write_path, w), 2).await?;
            // the file exists on every party once the barrier has passed
            assert!(path.exists());

            let loaded = load_from_party(
                &ctx,
                LoadFromParty {
                    reader: Some(Box::new(|| load_file::<Object>(&path))),
                    src: 2,
                    ..Default::default()
                },
            )
            .await?;
            let tensor = loaded.into_encrypted().ok_or(Error::InvalidUsage("no tensor".into()))?;
            Ok::<_, Error>((tensor.src(), tensor.get_plain_text(&ctx).await?))
        }
    })
    .await?;
    for (src, plain) in results {
        assert_eq!(src, Some(2));
        assert_eq!(plain, array![[1.0, -2.5], [0.25, 4.0]].into_dyn());
    }
    Ok(())
}

#[tokio::test]
async fn shares_survive_save_and_load() -> Result<(), Error> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let dir_path = dir.path().to_path_buf();
    let results = simulate(2, Config::default(), move |ctx| {
        let path: PathBuf = dir_path.join(format!("share-{}.bin", ctx.rank()));
        async move {
            let x = cryptensor(&ctx, &array![3.0, -1.0].into_dyn(), CryptensorArgs::default())?;
            save(&ctx, &x, |x| save_file(&path, x)).await?;
            let loaded: CrypTensor = load(|| load_file(&path), None)?;
            assert_eq!(loaded, x);
            assert!(matches!(
                load(|| load_file::<CrypTensor>(&path), Some(0)),
                Err(Error::InvalidUsage(_))
            ));
            loaded.get_plain_text(&ctx).await
        }
    })
    .await?;
    for plain in results {
        assert_eq!(plain, array![3.0, -1.0].into_dyn());
    }
    Ok(())
}

#[tokio::test]
async fn encrypted_values_cannot_be_saved_from_a_party() -> Result<(), Error> {
    let results = simulate(2, Config::default(), |ctx| async move {
        let x = cryptensor(&ctx, &array![1.0].into_dyn(), CryptensorArgs::default())?;
        let result = save_from_party(&ctx, &x, |_| Ok(()), 0).await;
        Ok::<_, Error>(result.err())
    })
    .await?;
    for err in results {
        assert!(matches!(err, Some(Error::UnsupportedSaveType(_))));
    }
    Ok(())
}

#[tokio::test]
async fn failed_writes_fail_every_party() -> Result<(), Error> {
    let results = simulate(3, Config::default(), |ctx| async move {
        let obj = Object::Tensor(array![1.0].into_dyn());
        let result = save_from_party(
            &ctx,
            &obj,
            |o| save_file("/nonexistent/dir/out.bin", o),
            1,
        )
        .await;
        Ok::<_, Error>(result.err())
    })
    .await?;
    assert!(matches!(results[1], Some(Error::Io(_))));
    assert!(matches!(results[0], Some(Error::SourceFailed { src: 1, .. })));
    assert!(matches!(results[2], Some(Error::SourceFailed { src: 1, .. })));
    Ok(())
}

#[tokio::test]
async fn invalid_and_unsupported_loads() -> Result<(), Error> {
    let results = simulate(2, Config::default(), |ctx| async move {
        let invalid_src = load_from_party(
            &ctx,
            LoadFromParty {
                src: 2,
                ..Default::default()
            },
        )
        .await;
        let unsupported = load_from_party(
            &ctx,
            LoadFromParty {
                preloaded: Some(Object::Other {
                    type_name: "String".to_string(),
                }),
                ..Default::default()
            },
        )
        .await;
        let share = cryptensor(&ctx, &array![1.0, 2.0].into_dyn(), CryptensorArgs::default())?;
        let encrypted = load_from_party(
            &ctx,
            LoadFromParty {
                preloaded: (ctx.rank() == 0).then(|| Object::Encrypted(share)),
                ..Default::default()
            },
        )
        .await;
        let rounds = ctx.comm().stats().rounds;
        let unknown_type = load_from_party(
            &ctx,
            LoadFromParty {
                preloaded: Some(Object::Tensor(array![1.0].into_dyn())),
                cryptensor_type: Some("nope"),
                ..Default::default()
            },
        )
        .await;
        // rejected before any message is exchanged
        assert_eq!(ctx.comm().stats().rounds, rounds);
        Ok::<_, Error>((
            invalid_src.err(),
            unsupported.err(),
            encrypted.err(),
            unknown_type.err(),
        ))
    })
    .await?;
    for (invalid_src, unsupported, encrypted, unknown_type) in results {
        assert!(matches!(
            invalid_src,
            Some(Error::InvalidSource {
                src: 2,
                world_size: 2
            })
        ));
        assert!(matches!(
            unsupported,
            Some(Error::UnsupportedLoadType(t)) if t == "String"
        ));
        assert!(matches!(
            encrypted,
            Some(Error::UnsupportedLoadType(t)) if t == "CrypTensor(arithmetic)"
        ));
        assert!(matches!(unknown_type, Some(Error::UnknownType(t)) if t == "nope"));
    }
    Ok(())
}
