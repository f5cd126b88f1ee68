use anyhow::{Context as _, Error, bail};
use clap::Parser;
use cryptensor::{
    Config, Object, Value,
    io::{LoadFromParty, load_from_party},
    ops::{bernoulli, where_},
    print::{PrintOpts, log, print},
    simulate::simulate,
};
use ndarray::{ArrayD, IxDyn};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Simulates an MPC session in which one party shares a tensor with all others.
#[derive(Debug, Parser)]
#[command(name = "cryptensor-demo")]
struct Cli {
    /// The number of simulated parties.
    #[arg(long, short, default_value_t = 3)]
    parties: usize,
    /// The party that loads the tensor.
    #[arg(long, short, default_value_t = 1)]
    source: usize,
    /// The value of every element of the tensor.
    #[arg(long, short, default_value_t = 7.0)]
    value: f64,
    /// The number of rows of the tensor.
    #[arg(long, default_value_t = 2)]
    rows: usize,
    /// The number of columns of the tensor.
    #[arg(long, default_value_t = 2)]
    cols: usize,
    /// The number of fractional bits of the fixed-point encoding.
    #[arg(long, default_value_t = 16)]
    precision_bits: u32,
    /// The scheme used for the shared tensor.
    #[arg(long, default_value = "arithmetic")]
    cryptensor_type: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("CRYPTENSOR_LOG"))
        .init();

    let Cli {
        parties,
        source,
        value,
        rows,
        cols,
        precision_bits,
        cryptensor_type,
    } = Cli::parse();
    if source >= parties {
        bail!("the source party must be one of the {parties} parties");
    }
    let config = Config {
        precision_bits,
        default_cryptensor_type: cryptensor_type,
        trace_tuples: true,
    };

    let results = simulate(parties, config, move |ctx| async move {
        let shape = IxDyn(&[rows, cols]);
        let data = ArrayD::from_elem(shape.clone(), value);
        let loaded = load_from_party(
            &ctx,
            LoadFromParty {
                preloaded: (ctx.rank() == source).then(|| Object::Tensor(data)),
                src: source,
                ..Default::default()
            },
        )
        .await?;
        let Some(x) = loaded.into_encrypted() else {
            return Err(cryptensor::Error::UnsupportedLoadType("Model".into()));
        };
        let share = format!("party {} holds the share {:?}", ctx.rank(), x.share());
        print(&ctx, &share, &PrintOpts::in_order()).await?;

        let revealed = x.get_plain_text(&ctx).await?;
        print(&ctx, &format!("revealed:\n{revealed}"), &PrintOpts::default()).await?;

        let probs = Value::Plain(ArrayD::from_elem(shape.clone(), 0.5));
        let coins = bernoulli(&ctx, &probs, None).await?;
        let zeros = Value::Plain(ArrayD::zeros(shape));
        let masked = match where_(&ctx, &coins.into(), &x.into(), &zeros).await? {
            Value::Encrypted(t) => t.get_plain_text(&ctx).await?,
            Value::Plain(t) => t,
        };
        log(&ctx, &format!("randomly masked:\n{masked}"), &PrintOpts::dst(source)).await?;

        let requests = ctx.with_provider(|p| p.requests().len());
        Ok((ctx.comm().stats(), requests))
    })
    .await
    .context("simulation failed")?;

    for (rank, (stats, requests)) in results.into_iter().enumerate() {
        info!(
            rank,
            rounds = stats.rounds,
            bytes_sent = stats.bytes_sent,
            requests,
            "Party finished"
        );
    }
    Ok(())
}
