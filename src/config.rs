//! Options used when setting up a [`crate::Context`].

use serde::{Deserialize, Serialize};

use crate::registry::ARITHMETIC;

/// Per-party options of an MPC session.
///
/// All parties must use the same options, otherwise their shares will not reconstruct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of fractional bits of the fixed-point encoding.
    pub precision_bits: u32,
    /// Name of the scheme used when no `cryptensor_type` is specified.
    pub default_cryptensor_type: String,
    /// Whether the tuple provider records requests from the start.
    pub trace_tuples: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            precision_bits: 16,
            default_cryptensor_type: ARITHMETIC.to_string(),
            trace_tuples: false,
        }
    }
}
