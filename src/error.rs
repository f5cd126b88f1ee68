//! The error type shared by all encrypted tensor operations.

use crate::{channel, registry::SchemeKind};

/// Errors raised by the factory, the collective I/O layer, the combinators and the schemes.
///
/// Validation errors are raised locally before any collective call, so all parties observe the
/// same outcome. Failures that only the source party of a collective can detect are forwarded to
/// the other parties (see [`crate::value::Envelope`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested CrypTensor scheme name is not registered.
    #[error("CrypTensor type {0} does not exist")]
    UnknownType(String),
    /// A scheme was registered twice under the same name.
    #[error("CrypTensor type {0} is already registered")]
    DuplicateRegistration(String),
    /// The value passed to an introspection function is not a CrypTensor.
    #[error("specified value is not a CrypTensor: {0}")]
    NotACrypTensor(String),
    /// No registry entry matches the scheme of the CrypTensor.
    #[error("unregistered CrypTensor type: {0}")]
    UnregisteredType(String),
    /// A source party outside of `[0, world_size)` was specified.
    #[error("source party {src} must be in [0, {world_size})")]
    InvalidSource {
        /// The requested source party.
        src: usize,
        /// The number of parties.
        world_size: usize,
    },
    /// The rank of this party does not fit the world size.
    #[error("rank {rank} must be in [0, {world_size})")]
    InvalidRank {
        /// The rank of this party.
        rank: usize,
        /// The number of parties.
        world_size: usize,
    },
    /// Both or neither of reader and preloaded value were given to `load_from_party`.
    #[error("exactly one of reader and preloaded must be supplied")]
    AmbiguousInput,
    /// The loaded object is of a kind that cannot be distributed by `load_from_party`.
    #[error("unrecognized load type {0}")]
    UnsupportedLoadType(String),
    /// The object is of a kind that cannot be written by `save_from_party`.
    #[error("saving {0} from a party is not supported")]
    UnsupportedSaveType(String),
    /// The `load` / `load_from_party` call conventions were mixed up.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    /// The arguments of a combinator are malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The arguments of a combinator mix encrypted and plaintext values or different schemes.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// The shapes of two operands are incompatible.
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        /// Shape of the left operand.
        left: Vec<usize>,
        /// Shape of the right operand.
        right: Vec<usize>,
    },
    /// An ndarray operation rejected the shapes of its operands.
    #[error("invalid shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    /// The scheme does not implement the requested operation.
    #[error("operation {op} is not supported by the {scheme:?} scheme")]
    UnsupportedOperation {
        /// The name of the operation.
        op: &'static str,
        /// The scheme of the receiver.
        scheme: SchemeKind,
    },
    /// A model class was received that is not allowlisted for deserialization.
    #[error("model class {0} is not registered as safe for deserialization")]
    UnsafeClass(String),
    /// The source party of a collective failed and notified the other parties.
    #[error("source party {src} failed: {reason}")]
    SourceFailed {
        /// The failing source party.
        src: usize,
        /// The reason reported by the source party.
        reason: String,
    },
    /// The tuple source answered a request with a tuple of the wrong kind.
    #[error("tuple source returned a tuple that is not a {expected}")]
    UnexpectedTuple {
        /// The kind of tuple that was requested.
        expected: &'static str,
    },
    /// The parties disagree about the registered schemes.
    #[error("CrypTensor registries differ between parties")]
    InconsistentRegistry,
    /// A message could not be sent or received.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// A file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A value could not be (de-)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] bincode::Error),
    /// A party task of a simulation panicked or was cancelled.
    #[error("party task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
