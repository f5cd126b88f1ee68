//! Printing and logging from several parties without interleaved output.

use tracing::info;

use crate::{channel::Channel, context::Context, error::Error};

/// The parties that print when output is not in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dst {
    /// A single party.
    One(usize),
    /// A set of parties.
    Many(Vec<usize>),
}

impl Dst {
    fn contains(&self, rank: usize) -> bool {
        match self {
            Dst::One(dst) => *dst == rank,
            Dst::Many(dst) => dst.contains(&rank),
        }
    }
}

impl Default for Dst {
    fn default() -> Self {
        Dst::One(0)
    }
}

impl From<usize> for Dst {
    fn from(rank: usize) -> Self {
        Dst::One(rank)
    }
}

impl From<Vec<usize>> for Dst {
    fn from(ranks: Vec<usize>) -> Self {
        Dst::Many(ranks)
    }
}

/// Options of [`print`] and [`log`].
#[derive(Debug, Clone, Default)]
pub struct PrintOpts {
    /// Every party prints, one after the other in rank order.
    pub in_order: bool,
    /// The printing parties if `in_order` is false.
    pub dst: Dst,
}

impl PrintOpts {
    /// Every party prints, in rank order.
    pub fn in_order() -> Self {
        Self {
            in_order: true,
            ..Default::default()
        }
    }

    /// Only the parties in `dst` print.
    pub fn dst(dst: impl Into<Dst>) -> Self {
        Self {
            in_order: false,
            dst: dst.into(),
        }
    }
}

/// Runs `action` on the parties selected by `opts`.
///
/// With `in_order` every party must call this function: party `i` runs `action` after the barrier
/// that follows party `i - 1`. Otherwise only the parties in `opts.dst` run `action` and no
/// communication takes place.
pub async fn multiprocess_print_helper<C: Channel>(
    ctx: &Context<C>,
    opts: &PrintOpts,
    mut action: impl FnMut(),
) -> Result<(), Error> {
    let comm = ctx.comm();
    if opts.in_order {
        for rank in 0..comm.get_world_size() {
            if comm.get_rank() == rank {
                action();
            }
            comm.barrier().await?;
        }
    } else if opts.dst.contains(comm.get_rank()) {
        action();
    }
    Ok(())
}

/// Writes `msg` to stdout from the parties selected by `opts`.
pub async fn print<C: Channel>(ctx: &Context<C>, msg: &str, opts: &PrintOpts) -> Result<(), Error> {
    multiprocess_print_helper(ctx, opts, || println!("{msg}")).await
}

/// Emits `msg` as an `info` event from the parties selected by `opts`.
pub async fn log<C: Channel>(ctx: &Context<C>, msg: &str, opts: &PrintOpts) -> Result<(), Error> {
    let rank = ctx.rank();
    multiprocess_print_helper(ctx, opts, || info!(rank, "{msg}")).await
}
