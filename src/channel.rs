//! A communication channel used to send/receive messages to/from the other parties.

use std::{fmt, future::Future, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::{
        Mutex,
        mpsc::{Receiver, Sender, channel},
    },
    time::timeout,
};
use tracing::trace;

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug, thiserror::Error)]
#[error("channel error during {phase}: {reason:?}")]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    SendError(String),
    /// The message could not be (de-)serialized.
    SerdeError(String),
}

/// A communication channel used to send/receive messages to/from another party.
///
/// Implementations must deliver the messages between any two parties in the order they were
/// sent. Every collective operation of this crate relies on this ordering.
pub trait Channel: Send + Sync {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index (must be between `0..participants`).
    fn send_bytes_to(
        &self,
        party: usize,
        msg: Vec<u8>,
        phase: &str,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits a response from the party with the given index (must be between `0..participants`).
    fn recv_bytes_from(
        &self,
        party: usize,
        phase: &str,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;
}

/// Serializes and sends a message to the other party, returning the number of bytes sent.
pub(crate) async fn send_to<S: Serialize + ?Sized>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: &S,
) -> Result<usize, Error> {
    let msg = bincode::serialize(msg).map_err(|e| Error {
        phase: format!("sending {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    send_bytes_to(channel, party, phase, msg).await
}

/// Sends an already serialized message, returning the number of bytes sent.
pub(crate) async fn send_bytes_to(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: Vec<u8>,
) -> Result<usize, Error> {
    let len = msg.len();
    channel
        .send_bytes_to(party, msg, phase)
        .await
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::SendError(format!("{e:?}")),
        })?;
    Ok(len)
}

/// Receives and deserializes a message from the other party.
pub(crate) async fn recv_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
) -> Result<T, Error> {
    let msg = channel
        .recv_bytes_from(party, phase)
        .await
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::RecvError(format!("{e:?}")),
        })?;
    bincode::deserialize(&msg).map_err(|e| Error {
        phase: format!("receiving {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })
}

/// A simple in-process channel using tokio [`Sender`] and [`Receiver`].
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
    timeout: Duration,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels = vec![];
        for _ in 0..parties {
            let mut s = vec![];
            let mut r = vec![];
            for _ in 0..parties {
                s.push(None);
                r.push(None);
            }
            channels.push(SimpleChannel {
                s,
                r,
                timeout: Duration::from_secs(10 * 60),
            });
        }
        for a in 0..parties {
            for b in 0..parties {
                if a == b {
                    continue;
                }
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].r[a] = Some(Mutex::new(recv_a_to_b));
            }
        }
        channels
    }

    /// Sets how long a `recv` waits before failing with [`AsyncRecvError::TimeoutElapsed`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The error raised by `send` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncSendError {
    /// The channel has been closed.
    Closed,
    /// There is no channel to the given party.
    NoSuchParty(usize),
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncRecvError {
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
    /// There is no channel from the given party.
    NoSuchParty(usize),
}

impl Channel for SimpleChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&self, p: usize, msg: Vec<u8>, phase: &str) -> Result<(), AsyncSendError> {
        let kb = msg.len() as f64 / 1024.0;
        trace!("Sending msg {phase} to party {p} ({kb:.2}KB)...");
        self.s
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncSendError::NoSuchParty(p))?
            .send(msg)
            .await
            .map_err(|_| AsyncSendError::Closed)
    }

    async fn recv_bytes_from(&self, p: usize, _phase: &str) -> Result<Vec<u8>, AsyncRecvError> {
        let mut r = self
            .r
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncRecvError::NoSuchParty(p))?
            .lock()
            .await;
        match timeout(self.timeout, r.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(AsyncRecvError::Closed),
            Err(_) => Err(AsyncRecvError::TimeoutElapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AsyncRecvError, Channel, ErrorKind, SimpleChannel, recv_from, send_to};

    #[tokio::test]
    async fn messages_arrive_in_order() -> Result<(), super::Error> {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();
        send_to(&a, 1, "first", &vec![1u64, 2]).await?;
        send_to(&a, 1, "second", "hello").await?;
        let first: Vec<u64> = recv_from(&b, 0, "first").await?;
        let second: String = recv_from(&b, 0, "second").await?;
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_messages_are_rejected() {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();
        send_to(&a, 1, "byte", &7u8).await.unwrap();
        let err = recv_from::<String>(&b, 0, "byte").await.unwrap_err();
        assert!(matches!(err.reason, ErrorKind::SerdeError(_)));
        assert_eq!(err.phase, "receiving byte");
    }

    #[tokio::test]
    async fn recv_times_out() {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap().with_timeout(Duration::from_millis(10));
        let err = b.recv_bytes_from(0, "nothing").await.unwrap_err();
        assert!(matches!(err, AsyncRecvError::TimeoutElapsed));
        assert!(matches!(
            b.recv_bytes_from(1, "self").await.unwrap_err(),
            AsyncRecvError::NoSuchParty(1)
        ));
    }
}
