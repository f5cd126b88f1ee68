//! The registry mapping scheme names to the concrete encrypted tensor schemes.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name under which the additive sharing scheme is registered.
pub const ARITHMETIC: &str = "arithmetic";
/// Name under which the XOR sharing scheme is registered.
pub const BINARY: &str = "binary";

/// The concrete secret sharing schemes a [`crate::CrypTensor`] can be built with.
///
/// The registry maps names to these tags; every constructor and combinator dispatches on the tag
/// resolved through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemeKind {
    /// Additive sharing over Z_2^64 with fixed-point encoding.
    Arithmetic,
    /// XOR sharing of 64-bit words with fixed-point encoding.
    Binary,
}

/// Append-only mapping from scheme names to [`SchemeKind`]s with one default entry.
///
/// Encrypted tensors remember the name they were created under, so two names registered for the
/// same [`SchemeKind`] still count as two different types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    entries: Vec<(String, SchemeKind)>,
    default: String,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            entries: vec![
                (ARITHMETIC.to_string(), SchemeKind::Arithmetic),
                (BINARY.to_string(), SchemeKind::Binary),
            ],
            default: ARITHMETIC.to_string(),
        }
    }
}

impl Registry {
    /// Adds a scheme under `name`. A scheme may be registered under several names.
    pub fn register(&mut self, name: &str, kind: SchemeKind) -> Result<(), Error> {
        if self.get(name).is_some() {
            return Err(Error::DuplicateRegistration(name.to_string()));
        }
        self.entries.push((name.to_string(), kind));
        Ok(())
    }

    /// Looks up the scheme registered under `name`.
    pub fn get(&self, name: &str) -> Option<SchemeKind> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, kind)| *kind)
    }

    /// Resolves an explicit scheme name, or the default one if `name` is `None`.
    ///
    /// Returns the resolved name together with its scheme.
    pub fn resolve<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, SchemeKind), Error> {
        let name = name.unwrap_or(self.default.as_str());
        self.get(name)
            .map(|kind| (name, kind))
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    /// The first name under which `kind` was registered.
    pub fn name_of(&self, kind: SchemeKind) -> Result<&str, Error> {
        self.entries
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(n, _)| n.as_str())
            .ok_or_else(|| Error::UnregisteredType(format!("{kind:?}")))
    }

    /// The name of the default scheme.
    pub fn default_type(&self) -> &str {
        &self.default
    }

    /// Makes the scheme registered under `name` the default.
    pub fn set_default_type(&mut self, name: &str) -> Result<(), Error> {
        if self.get(name).is_none() {
            return Err(Error::UnknownType(name.to_string()));
        }
        self.default = name.to_string();
        Ok(())
    }

    /// All registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// A digest of the registered names, the schemes and the default entry.
    ///
    /// Parties compare digests before mixing their values (see
    /// [`crate::Context::verify_registry`]).
    pub fn digest(&self) -> Result<[u8; 32], Error> {
        let bytes = bincode::serialize(self)?;
        Ok(blake3::hash(&bytes).into())
    }
}
