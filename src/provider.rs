//! Correlated randomness (multiplication triples and friends) consumed by the secure protocols.
//!
//! The [`TupleProvider`] sits between the protocols and a [`TupleSource`]. It can record the
//! requests issued by a workload ([`TupleProvider::trace`]), generate all of them ahead of time
//! ([`TupleProvider::fill_cache`]) and then serve the next run of the same workload from the cache.

use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::{
    error::Error,
    ring::{self, RingTensor},
};

/// The operation a triple is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TripleOp {
    /// Elementwise multiplication, `c = a * b`.
    Mul,
    /// Matrix multiplication, `c = a @ b`.
    Matmul,
}

/// A request for one tuple of correlated randomness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Request {
    /// Additively shared `(a, b, c)` with `c = a op b`.
    AdditiveTriple {
        /// The operation relating `a` and `b` to `c`.
        op: TripleOp,
        /// Shape of `a`.
        a: Vec<usize>,
        /// Shape of `b`.
        b: Vec<usize>,
    },
    /// Additively shared `(r, r * r)`.
    Square {
        /// Shape of `r`.
        shape: Vec<usize>,
    },
    /// XOR shared `(a, b, c)` with `c = a & b`.
    BinaryTriple {
        /// Shape of `a`, `b` and `c`.
        shape: Vec<usize>,
    },
    /// Additively shared `(r, r >> bits)` with `r < 2^62`.
    TruncPair {
        /// Shape of `r`.
        shape: Vec<usize>,
        /// Number of bits to truncate.
        bits: u32,
    },
    /// Random bits shared both additively and by XOR.
    B2aBits {
        /// Shape of the bit tensor.
        shape: Vec<usize>,
    },
}

/// This party's shares of one tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tuple {
    /// See [`Request::AdditiveTriple`] and [`Request::BinaryTriple`].
    Triple {
        /// Share of `a`.
        a: RingTensor,
        /// Share of `b`.
        b: RingTensor,
        /// Share of `c`.
        c: RingTensor,
    },
    /// See [`Request::Square`].
    Square {
        /// Share of `r`.
        r: RingTensor,
        /// Share of `r * r`.
        r2: RingTensor,
    },
    /// See [`Request::TruncPair`].
    TruncPair {
        /// Share of `r`.
        r: RingTensor,
        /// Share of `r >> bits`.
        shifted: RingTensor,
    },
    /// See [`Request::B2aBits`].
    B2aBits {
        /// Additive share of the bits.
        arithmetic: RingTensor,
        /// XOR share of the bits.
        binary: RingTensor,
    },
}

/// Generates tuples on demand. Every party must be served tuples from matching sources.
pub trait TupleSource: Send {
    /// A short name used in logs.
    fn name(&self) -> &'static str;

    /// Generates this party's shares of a tuple for `request`.
    fn generate(&mut self, request: &Request) -> Result<Tuple, Error>;
}

/// A (semi-)trusted dealer simulated by every party from a common seed.
///
/// Every party draws the full tuple from the same stream and keeps only its own share, so all
/// parties stay in sync without communication. Since any party could recompute the other shares,
/// this source only models the protocol's data flow (like a trusted first party used for testing).
#[derive(Debug)]
pub struct TrustedDealer {
    rng: ChaCha20Rng,
    rank: usize,
    world_size: usize,
}

impl TrustedDealer {
    /// Creates the dealer stream for party `rank`; all parties must use the same `seed`.
    pub fn new(seed: [u8; 32], rank: usize, world_size: usize) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
            rank,
            world_size,
        }
    }

    fn additive(&mut self, value: &RingTensor) -> RingTensor {
        ring::additive_share(&mut self.rng, value, self.rank, self.world_size)
    }

    fn xor(&mut self, value: &RingTensor) -> RingTensor {
        ring::xor_share(&mut self.rng, value, self.rank, self.world_size)
    }
}

impl TupleSource for TrustedDealer {
    fn name(&self) -> &'static str {
        "trusted dealer"
    }

    fn generate(&mut self, request: &Request) -> Result<Tuple, Error> {
        let tuple = match request {
            Request::AdditiveTriple { op, a, b } => {
                let a = ring::random(&mut self.rng, a);
                let b = ring::random(&mut self.rng, b);
                let c = match op {
                    TripleOp::Mul => {
                        ring::check_same_shape(a.shape(), b.shape())?;
                        &a * &b
                    }
                    TripleOp::Matmul => ring::matmul(&a, &b)?,
                };
                Tuple::Triple {
                    a: self.additive(&a),
                    b: self.additive(&b),
                    c: self.additive(&c),
                }
            }
            Request::Square { shape } => {
                let r = ring::random(&mut self.rng, shape);
                let r2 = &r * &r;
                Tuple::Square {
                    r: self.additive(&r),
                    r2: self.additive(&r2),
                }
            }
            Request::BinaryTriple { shape } => {
                let a = ring::random(&mut self.rng, shape);
                let b = ring::random(&mut self.rng, shape);
                let c = &a & &b;
                Tuple::Triple {
                    a: self.xor(&a),
                    b: self.xor(&b),
                    c: self.xor(&c),
                }
            }
            Request::TruncPair { shape, bits } => {
                let r = ring::random_bits(&mut self.rng, shape, 62);
                let shifted = r.mapv(|v| v >> *bits as usize);
                Tuple::TruncPair {
                    r: self.additive(&r),
                    shifted: self.additive(&shifted),
                }
            }
            Request::B2aBits { shape } => {
                let bits = ring::random_bits(&mut self.rng, shape, 1);
                Tuple::B2aBits {
                    arithmetic: self.additive(&bits),
                    binary: self.xor(&bits),
                }
            }
        };
        Ok(tuple)
    }
}

/// Counters describing how requests were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Requests served from the cache.
    pub cache_hits: usize,
    /// Requests generated on demand.
    pub cache_misses: usize,
}

/// Serves tuples from a cache or a [`TupleSource`], optionally recording every request.
pub struct TupleProvider {
    source: Box<dyn TupleSource>,
    tracing: bool,
    requests: Vec<Request>,
    cache: HashMap<Request, VecDeque<Tuple>>,
    stats: ProviderStats,
}

impl std::fmt::Debug for TupleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleProvider")
            .field("source", &self.source.name())
            .field("tracing", &self.tracing)
            .field("requests", &self.requests.len())
            .field("cached", &self.cached())
            .field("stats", &self.stats)
            .finish()
    }
}

impl TupleProvider {
    /// Creates a provider without recorded requests or cached tuples.
    pub fn new(source: impl TupleSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            tracing: false,
            requests: vec![],
            cache: HashMap::new(),
            stats: ProviderStats::default(),
        }
    }

    /// Turns the recording of requests on or off.
    pub fn trace(&mut self, tracing: bool) {
        debug!(tracing, "Tuple tracing toggled");
        self.tracing = tracing;
    }

    /// Turns tracing on if no requests have been recorded yet, and off otherwise.
    pub fn trace_once(&mut self) {
        let untraced = self.requests.is_empty();
        self.trace(untraced);
    }

    /// Whether requests are currently being recorded.
    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    /// The recorded requests in the order they were issued.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// The number of cached tuples.
    pub fn cached(&self) -> usize {
        self.cache.values().map(VecDeque::len).sum()
    }

    /// Counters of cache hits and misses.
    pub fn stats(&self) -> ProviderStats {
        self.stats
    }

    /// Generates one tuple for every recorded request and adds it to the cache.
    ///
    /// The recorded requests are kept, so the cache can be refilled for every run of a workload.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn fill_cache(&mut self) -> Result<(), Error> {
        debug!(
            requests = self.requests.len(),
            source = self.source.name(),
            "Filling tuple cache"
        );
        for request in &self.requests {
            let tuple = self.source.generate(request)?;
            self.cache.entry(request.clone()).or_default().push_back(tuple);
        }
        Ok(())
    }

    /// Drops all cached tuples.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Serves a tuple for `request`, from the cache if possible.
    pub fn request(&mut self, request: Request) -> Result<Tuple, Error> {
        if let Some(tuple) = self.cache.get_mut(&request).and_then(VecDeque::pop_front) {
            self.stats.cache_hits += 1;
            if self.tracing {
                self.requests.push(request);
            }
            return Ok(tuple);
        }
        self.stats.cache_misses += 1;
        let tuple = self.source.generate(&request)?;
        if self.tracing {
            self.requests.push(request);
        }
        Ok(tuple)
    }

    /// Writes the recorded requests to `path`.
    pub fn save_requests(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let file = BufWriter::new(File::create(path)?);
        bincode::serialize_into(file, &self.requests)?;
        Ok(())
    }

    /// Replaces the recorded requests with the ones stored at `path`.
    pub fn load_requests(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let file = BufReader::new(File::open(path)?);
        self.requests = bincode::deserialize_from(file)?;
        debug!(requests = self.requests.len(), "Loaded tuple requests");
        Ok(())
    }
}

/// Draws a fresh 32-byte seed for a dealer stream.
pub(crate) fn random_seed() -> [u8; 32] {
    rand::rng().random()
}
