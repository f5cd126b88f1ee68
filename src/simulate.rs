//! Runs all parties of a computation as tasks of one tokio runtime, connected by [`SimpleChannel`]s.

use std::{future::Future, sync::Arc};

use futures::future::try_join_all;
use tokio::task;
use tracing::{Instrument, info_span};

use crate::{channel::SimpleChannel, config::Config, context::Context, error::Error};

/// Sets up `world_size` parties and runs `f` as every one of them.
///
/// Returns the results of all parties, indexed by rank, or the first error in rank order. A party
/// that fails without its peers noticing leaves them waiting for the channel timeout.
pub async fn simulate<T, F, Fut>(world_size: usize, config: Config, f: F) -> Result<Vec<T>, Error>
where
    T: Send + 'static,
    F: Fn(Context<SimpleChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    if world_size == 0 {
        return Err(Error::InvalidRank {
            rank: 0,
            world_size,
        });
    }
    let f = Arc::new(f);
    let handles = SimpleChannel::channels(world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, channel)| {
            let f = Arc::clone(&f);
            let config = config.clone();
            let span = info_span!("party", rank);
            task::spawn(
                async move {
                    let ctx = Context::init(channel, rank, world_size, config).await?;
                    f(ctx).await
                }
                .instrument(span),
            )
        });
    let results = try_join_all(handles).await?;
    results.into_iter().collect()
}
