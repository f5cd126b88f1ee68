//! Encrypted tensors for secure multi-party computation (MPC).
//!
//! Every party holds a share of each encrypted tensor, a [`CrypTensor`]; no single share reveals
//! anything about the plaintext. Two sharing schemes are built in: additive sharing over
//! Z_2^64 (registered as `"arithmetic"`) and XOR sharing (registered as `"binary"`), both over a
//! fixed-point encoding of `f64` values. Further names can be registered for either scheme.
//!
//! ## Main Components
//!
//! * [`Context`]: the per-party handle threaded through all calls. It owns the [`comm`]
//!   communicator, the scheme [`registry`], the tuple [`provider`] and the local randomness.
//! * [`factory`]: creating encrypted tensors and asking values for their scheme.
//! * [`io`]: loading from and saving to a single party, with all parties kept in lock step.
//! * [`ops`]: `where_`, `cat`, `stack`, `rand`, `randn` and `bernoulli` over plaintext and
//!   encrypted values.
//! * [`print`]: printing and logging from several parties without interleaved output.
//! * [`channel`]: the transport between parties.
//!
//! Operations that need interaction are `async` and must be called by all parties in the same
//! order, as in any MPC protocol.
//!
//! ## Example
//!
//! ```no_run
//! use cryptensor::{
//!     Config, Error,
//!     factory::{CryptensorArgs, cryptensor},
//!     simulate::simulate,
//! };
//! use ndarray::{ArrayD, IxDyn};
//!
//! # async fn example() -> Result<(), Error> {
//! let sums = simulate(3, Config::default(), |ctx| async move {
//!     let x = ArrayD::from_elem(IxDyn(&[2, 2]), 1.5);
//!     let a = cryptensor(&ctx, &x, CryptensorArgs { src: 0, ..Default::default() })?;
//!     let b = cryptensor(&ctx, &x, CryptensorArgs { src: 1, ..Default::default() })?;
//!     a.add(&ctx, &b).await?.get_plain_text(&ctx).await
//! })
//! .await?;
//! assert_eq!(sums[0][[0, 0]], 3.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The schemes are secure against semi-honest parties. Correlated randomness comes from a
//! [`provider::TrustedDealer`] that every party runs locally from a shared seed, which is only
//! suitable for simulation and testing; other sources plug in through [`provider::TupleSource`].
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod comm;
pub mod config;
pub mod context;
pub mod cryptensor;
pub mod encoder;
pub mod error;
pub mod factory;
pub mod io;
pub mod ops;
pub mod print;
pub mod provider;
pub mod registry;
pub mod ring;
pub mod simulate;
pub mod value;

pub use config::Config;
pub use context::Context;
pub use cryptensor::{CrypTensor, Operand};
pub use error::Error;
pub use registry::SchemeKind;
pub use value::{Model, Object, Tensor, Value};
