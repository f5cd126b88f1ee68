//! The party group: identity, topology and the collective primitives built on a [`Channel`].
//!
//! Every collective must be called by all parties in the same order. Since the channel delivers
//! the messages between two parties in order, this is enough to match up the messages of
//! consecutive collectives without any tagging.

use std::sync::{Mutex, PoisonError};

use futures::future::{try_join, try_join_all};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{Level, instrument, trace};

use crate::{
    channel::{self, Channel, recv_from, send_bytes_to},
    error::Error,
};

/// Communication counters of one party.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommStats {
    /// Number of collective or point-to-point operations performed.
    pub rounds: usize,
    /// Number of (serialized) bytes sent to other parties.
    pub bytes_sent: usize,
}

/// The handle of one party to the party group.
#[derive(Debug)]
pub struct Communicator<C> {
    channel: C,
    rank: usize,
    world_size: usize,
    stats: Mutex<CommStats>,
}

impl<C: Channel> Communicator<C> {
    /// Wraps the channel of party `rank` in a group of `world_size` parties.
    pub fn new(channel: C, rank: usize, world_size: usize) -> Result<Self, Error> {
        if rank >= world_size {
            return Err(Error::InvalidRank { rank, world_size });
        }
        Ok(Self {
            channel,
            rank,
            world_size,
            stats: Mutex::new(CommStats::default()),
        })
    }

    /// The rank of this party, in `[0, world_size)`.
    pub fn get_rank(&self) -> usize {
        self.rank
    }

    /// The number of parties.
    pub fn get_world_size(&self) -> usize {
        self.world_size
    }

    /// Fails with [`Error::InvalidSource`] unless `src` is a valid rank.
    pub fn validate_src(&self, src: usize) -> Result<(), Error> {
        if src < self.world_size {
            Ok(())
        } else {
            Err(Error::InvalidSource {
                src,
                world_size: self.world_size,
            })
        }
    }

    /// The communication counters since creation or the last reset.
    pub fn stats(&self) -> CommStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets the communication counters.
    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = CommStats::default();
    }

    fn record(&self, bytes_sent: usize) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.rounds += 1;
        stats.bytes_sent += bytes_sent;
    }

    fn others(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.world_size).filter(|p| *p != self.rank)
    }

    /// Sends a value to a single party.
    pub async fn send_obj<T: Serialize + ?Sized>(
        &self,
        value: &T,
        dst: usize,
        phase: &str,
    ) -> Result<(), Error> {
        let bytes = channel::send_to(&self.channel, dst, phase, value).await?;
        self.record(bytes);
        Ok(())
    }

    /// Receives a value sent by a single party with [`Communicator::send_obj`].
    pub async fn recv_obj<T: DeserializeOwned>(&self, src: usize, phase: &str) -> Result<T, Error> {
        let value = recv_from(&self.channel, src, phase).await?;
        self.record(0);
        Ok(value)
    }

    /// Sends `value` from party `src` to all parties and returns it on every party.
    ///
    /// The source party must pass `Some(value)`; the argument is ignored on all other parties.
    #[instrument(level = Level::DEBUG, skip(self, value), fields(rank = self.rank), err)]
    pub async fn broadcast_obj<T: Serialize + DeserializeOwned>(
        &self,
        value: Option<T>,
        src: usize,
        phase: &str,
    ) -> Result<T, Error> {
        self.validate_src(src)?;
        if self.rank == src {
            let value = value.ok_or_else(|| {
                Error::InvalidUsage("the source party of a broadcast must supply a value".into())
            })?;
            let msg = bincode::serialize(&value)?;
            trace!(bytes = msg.len(), "Broadcasting {phase}");
            let sent = try_join_all(
                self.others()
                    .map(|p| send_bytes_to(&self.channel, p, phase, msg.clone())),
            )
            .await?;
            self.record(sent.iter().sum());
            Ok(value)
        } else {
            let value = recv_from(&self.channel, src, phase).await?;
            self.record(0);
            Ok(value)
        }
    }

    /// Sends `value` to all parties and returns the values of all parties, indexed by rank.
    pub async fn all_gather<T: Serialize + DeserializeOwned>(
        &self,
        value: T,
        phase: &str,
    ) -> Result<Vec<T>, Error> {
        let msg = bincode::serialize(&value)?;
        let send_all = try_join_all(
            self.others()
                .map(|p| send_bytes_to(&self.channel, p, phase, msg.clone())),
        );
        let recv_all = try_join_all(self.others().map(|p| recv_from::<T>(&self.channel, p, phase)));
        let (sent, received) = try_join(send_all, recv_all).await?;
        self.record(sent.iter().sum());

        let mut received = received.into_iter();
        let mut all = Vec::with_capacity(self.world_size);
        for p in 0..self.world_size {
            if p == self.rank {
                all.push(None);
            } else {
                all.push(received.next());
            }
        }
        all[self.rank] = Some(value);
        Ok(all.into_iter().flatten().collect())
    }

    /// Blocks until every party has reached the barrier.
    #[instrument(level = Level::TRACE, skip(self), fields(rank = self.rank), err)]
    pub async fn barrier(&self) -> Result<(), Error> {
        self.all_gather((), "barrier").await?;
        Ok(())
    }
}
