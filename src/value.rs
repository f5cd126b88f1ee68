//! Plaintext values, loadable objects and the shape-only payloads broadcast between parties.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::cryptensor::CrypTensor;

/// A dense plaintext tensor.
pub type Tensor = ArrayD<f64>;

/// Values that may or may not be encrypted.
pub trait MaybeEncrypted {
    /// The encrypted tensor, if the value is one.
    fn as_cryptensor(&self) -> Option<&CrypTensor>;

    /// Returns true if the value is an encrypted tensor.
    fn is_encrypted(&self) -> bool {
        self.as_cryptensor().is_some()
    }

    /// A short description of the kind of value, used in error messages.
    fn kind(&self) -> String;
}

impl MaybeEncrypted for Tensor {
    fn as_cryptensor(&self) -> Option<&CrypTensor> {
        None
    }

    fn kind(&self) -> String {
        "Tensor".to_string()
    }
}

impl MaybeEncrypted for CrypTensor {
    fn as_cryptensor(&self) -> Option<&CrypTensor> {
        Some(self)
    }

    fn kind(&self) -> String {
        format!("CrypTensor({})", self.type_name())
    }
}

/// Either a plaintext tensor or an encrypted tensor; the operand type of the combinators.
#[derive(Debug, Clone)]
pub enum Value {
    /// A plaintext tensor known to this party.
    Plain(Tensor),
    /// A secret-shared tensor.
    Encrypted(CrypTensor),
}

impl Value {
    /// Coerces a boolean mask into a floating point `Value` (true = 1.0).
    pub fn from_mask(mask: &ArrayD<bool>) -> Self {
        Value::Plain(mask.mapv(|b| if b { 1.0 } else { 0.0 }))
    }

    /// The shape of the value.
    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Plain(t) => t.shape(),
            Value::Encrypted(t) => t.shape(),
        }
    }

    /// The encrypted tensor, if the value is encrypted.
    pub fn as_encrypted(&self) -> Option<&CrypTensor> {
        match self {
            Value::Encrypted(t) => Some(t),
            Value::Plain(_) => None,
        }
    }

    /// The plaintext tensor, if the value is not encrypted.
    pub fn as_plain(&self) -> Option<&Tensor> {
        match self {
            Value::Plain(t) => Some(t),
            Value::Encrypted(_) => None,
        }
    }
}

impl MaybeEncrypted for Value {
    fn as_cryptensor(&self) -> Option<&CrypTensor> {
        self.as_encrypted()
    }

    fn kind(&self) -> String {
        match self {
            Value::Plain(t) => t.kind(),
            Value::Encrypted(t) => MaybeEncrypted::kind(t),
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Plain(t)
    }
}

impl From<CrypTensor> for Value {
    fn from(t: CrypTensor) -> Self {
        Value::Encrypted(t)
    }
}

/// A parametrized object (e.g. the weights of a network) identified by its class name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// The class name, checked against the safe-class allowlist of receiving parties.
    pub class: String,
    /// Named parameters.
    pub parameters: Vec<(String, Tensor)>,
    /// The party the model was loaded from.
    #[serde(skip)]
    pub src: Option<usize>,
}

impl Model {
    /// Creates a model without provenance.
    pub fn new(class: impl Into<String>, parameters: Vec<(String, Tensor)>) -> Self {
        Self {
            class: class.into(),
            parameters,
            src: None,
        }
    }
}

/// Everything a reader can produce and `save_from_party` can be asked to write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Object {
    /// A plaintext tensor.
    Tensor(Tensor),
    /// A parametrized object.
    Model(Model),
    /// Secret-shared material.
    Encrypted(CrypTensor),
    /// Anything else; only its type name is known.
    Other {
        /// The name of the unsupported type.
        type_name: String,
    },
}

impl MaybeEncrypted for Object {
    fn as_cryptensor(&self) -> Option<&CrypTensor> {
        match self {
            Object::Encrypted(t) => Some(t),
            _ => None,
        }
    }

    fn kind(&self) -> String {
        match self {
            Object::Tensor(t) => t.kind(),
            Object::Model(m) => format!("Model({})", m.class),
            Object::Encrypted(t) => MaybeEncrypted::kind(t),
            Object::Other { type_name } => type_name.clone(),
        }
    }
}

/// The shape-only stand-in broadcast by the source party of `load_from_party`.
///
/// It has no field that could carry the loaded values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placeholder {
    /// Stands in for a tensor of the given shape.
    Tensor {
        /// The shape of the loaded tensor.
        shape: Vec<usize>,
    },
    /// Stands in for a model with the given parameter shapes.
    Model {
        /// The class name of the model.
        class: String,
        /// Names and shapes of the parameters.
        shapes: Vec<(String, Vec<usize>)>,
    },
}

impl Placeholder {
    /// The placeholder of a loaded object, or `None` if it cannot be distributed.
    pub fn of(obj: &Object) -> Option<Self> {
        match obj {
            Object::Tensor(t) => Some(Placeholder::Tensor {
                shape: t.shape().to_vec(),
            }),
            Object::Model(m) => Some(Placeholder::Model {
                class: m.class.clone(),
                shapes: m
                    .parameters
                    .iter()
                    .map(|(name, p)| (name.clone(), p.shape().to_vec()))
                    .collect(),
            }),
            Object::Encrypted(_) | Object::Other { .. } => None,
        }
    }

    /// The object with the placeholder's shapes and every value set to zero.
    pub fn zeroed(&self) -> Object {
        match self {
            Placeholder::Tensor { shape } => Object::Tensor(Tensor::zeros(IxDyn(shape))),
            Placeholder::Model { class, shapes } => Object::Model(Model::new(
                class.clone(),
                shapes
                    .iter()
                    .map(|(name, shape)| (name.clone(), Tensor::zeros(IxDyn(shape))))
                    .collect(),
            )),
        }
    }
}

/// Why the source party of `load_from_party` could not produce a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum LoadFailure {
    /// The loaded object is of an unsupported kind.
    #[error("unrecognized load type {0}")]
    UnsupportedType(String),
    /// Reader and preloaded value were both or neither supplied.
    #[error("exactly one of reader and preloaded must be supplied")]
    AmbiguousInput,
    /// The reader failed.
    #[error("reading failed: {0}")]
    ReadFailed(String),
}

/// The tagged result broadcast by the source party of `load_from_party`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// The shape-only stand-in of the loaded object.
    Ready(Placeholder),
    /// The source party failed; all parties fail with it.
    Failed(LoadFailure),
}

/// The result of `load_from_party`, tagged with the source party.
#[derive(Debug, Clone)]
pub enum Loaded {
    /// A tensor, secret-shared from the source party.
    Encrypted(CrypTensor),
    /// A model; real at the source party, zeroed everywhere else.
    Model(Model),
}

impl Loaded {
    /// The party the value was loaded from.
    pub fn src(&self) -> Option<usize> {
        match self {
            Loaded::Encrypted(t) => t.src(),
            Loaded::Model(m) => m.src,
        }
    }

    /// The encrypted tensor, if a tensor was loaded.
    pub fn into_encrypted(self) -> Option<CrypTensor> {
        match self {
            Loaded::Encrypted(t) => Some(t),
            Loaded::Model(_) => None,
        }
    }

    /// The model, if a model was loaded.
    pub fn into_model(self) -> Option<Model> {
        match self {
            Loaded::Model(m) => Some(m),
            Loaded::Encrypted(_) => None,
        }
    }
}
