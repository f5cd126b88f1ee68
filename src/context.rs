//! The explicit per-party handle threaded through every operation.

use std::{
    collections::BTreeSet,
    path::Path,
    sync::{
        Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{Level, debug, instrument};

use crate::{
    channel::Channel,
    comm::Communicator,
    config::Config,
    encoder::FixedPointEncoder,
    error::Error,
    provider::{ProviderStats, Request, TripleOp, TrustedDealer, Tuple, TupleProvider, random_seed},
    registry::{Registry, SchemeKind},
    ring::{self, RingTensor},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Generators of pseudo-random zero shares.
///
/// `own` is seeded with this party's seed, `prev` with the seed of party `rank - 1`, so the
/// differences `own - prev` of all parties telescope to zero.
#[derive(Debug)]
struct Przs {
    own: ChaCha20Rng,
    prev: ChaCha20Rng,
}

impl Przs {
    fn additive(&mut self, shape: &[usize]) -> RingTensor {
        let own = ring::random(&mut self.own, shape);
        let prev = ring::random(&mut self.prev, shape);
        own - prev
    }

    fn xor(&mut self, shape: &[usize]) -> RingTensor {
        let own = ring::random(&mut self.own, shape);
        let prev = ring::random(&mut self.prev, shape);
        own ^ prev
    }
}

/// The state of one party: its place in the party group and all process-wide settings.
///
/// A `Context` replaces the global registry, default type, tuple provider and grad mode of a
/// single-process design. Every party creates its own context with [`Context::init`]; all
/// parties must do so at the same time since the setup exchanges seeds.
#[derive(Debug)]
pub struct Context<C> {
    comm: Communicator<C>,
    encoder: FixedPointEncoder,
    registry: RwLock<Registry>,
    provider: Mutex<TupleProvider>,
    przs: Mutex<Przs>,
    rng: Mutex<ChaCha20Rng>,
    no_grad_depth: AtomicUsize,
    safe_classes: RwLock<BTreeSet<String>>,
}

/// Disables gradient bookkeeping of a [`Context`] until dropped.
///
/// Guards nest and may be dropped in any order; grad mode returns once the last one is gone.
#[derive(Debug)]
pub struct NoGradGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for NoGradGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<C: Channel> Context<C> {
    /// Sets up party `rank` of `world_size` parties connected by `channel`.
    ///
    /// Exchanges the seeds of the zero-share generators with the neighbouring parties, receives
    /// the dealer seed from party 0 and checks that all parties use the same schemes.
    #[instrument(level = Level::DEBUG, skip(channel, config), err)]
    pub async fn init(
        channel: C,
        rank: usize,
        world_size: usize,
        config: Config,
    ) -> Result<Self, Error> {
        let comm = Communicator::new(channel, rank, world_size)?;
        let mut registry = Registry::default();
        registry.set_default_type(&config.default_cryptensor_type)?;

        let own_seed = random_seed();
        let prev_seed = if world_size == 1 {
            own_seed
        } else {
            let next = (rank + 1) % world_size;
            let prev = (rank + world_size - 1) % world_size;
            comm.send_obj(&own_seed, next, "zero share seed").await?;
            comm.recv_obj::<[u8; 32]>(prev, "zero share seed").await?
        };
        let dealer_seed = comm
            .broadcast_obj((rank == 0).then(random_seed), 0, "dealer seed")
            .await?;
        debug!(rank, world_size, "Exchanged seeds");

        let mut provider = TupleProvider::new(TrustedDealer::new(dealer_seed, rank, world_size));
        provider.trace(config.trace_tuples);

        let ctx = Self {
            comm,
            encoder: FixedPointEncoder::new(config.precision_bits),
            registry: RwLock::new(registry),
            provider: Mutex::new(provider),
            przs: Mutex::new(Przs {
                own: ChaCha20Rng::from_seed(own_seed),
                prev: ChaCha20Rng::from_seed(prev_seed),
            }),
            rng: Mutex::new(ChaCha20Rng::from_seed(random_seed())),
            no_grad_depth: AtomicUsize::new(0),
            safe_classes: RwLock::new(BTreeSet::new()),
        };
        ctx.verify_registry().await?;
        Ok(ctx)
    }

    /// The party group.
    pub fn comm(&self) -> &Communicator<C> {
        &self.comm
    }

    /// The rank of this party.
    pub fn rank(&self) -> usize {
        self.comm.get_rank()
    }

    /// The number of parties.
    pub fn world_size(&self) -> usize {
        self.comm.get_world_size()
    }

    /// The fixed-point encoder shared by all schemes.
    pub fn encoder(&self) -> &FixedPointEncoder {
        &self.encoder
    }

    /// Registers an additional scheme name.
    ///
    /// Registration is local; call [`Context::verify_registry`] once all parties are done.
    pub fn register_cryptensor_type(&self, name: &str, kind: SchemeKind) -> Result<(), Error> {
        write(&self.registry).register(name, kind)
    }

    /// The name of the default scheme.
    pub fn get_default_cryptensor_type(&self) -> String {
        read(&self.registry).default_type().to_string()
    }

    /// Makes the scheme registered under `name` the default.
    pub fn set_default_cryptensor_type(&self, name: &str) -> Result<(), Error> {
        write(&self.registry).set_default_type(name)
    }

    /// A snapshot of the registry.
    pub fn registry(&self) -> Registry {
        read(&self.registry).clone()
    }

    /// Resolves an explicit scheme name (or the default one) to its registered name and scheme.
    pub fn resolve_cryptensor_type(&self, name: Option<&str>) -> Result<(String, SchemeKind), Error> {
        let registry = read(&self.registry);
        let (name, kind) = registry.resolve(name)?;
        Ok((name.to_string(), kind))
    }

    /// The first name `kind` was registered under, used for the results of conversions.
    pub fn cryptensor_type_name(&self, kind: SchemeKind) -> Result<String, Error> {
        read(&self.registry).name_of(kind).map(str::to_string)
    }

    /// Compares the registries of all parties, failing with [`Error::InconsistentRegistry`] if
    /// any two differ.
    #[instrument(level = Level::DEBUG, skip_all, fields(rank = self.rank()), err)]
    pub async fn verify_registry(&self) -> Result<(), Error> {
        let digest = read(&self.registry).digest()?;
        let digests = self.comm.all_gather(digest, "registry digest").await?;
        if digests.iter().all(|d| *d == digest) {
            Ok(())
        } else {
            Err(Error::InconsistentRegistry)
        }
    }

    /// Disables gradient bookkeeping until the returned guard is dropped.
    pub fn no_grad(&self) -> NoGradGuard<'_> {
        self.no_grad_depth.fetch_add(1, Ordering::SeqCst);
        NoGradGuard {
            depth: &self.no_grad_depth,
        }
    }

    /// Whether newly created values may require gradients.
    pub fn is_grad_enabled(&self) -> bool {
        self.no_grad_depth.load(Ordering::SeqCst) == 0
    }

    /// Allows models of class `name` to be received by `load_from_party`.
    pub fn register_safe_class(&self, name: &str) {
        write(&self.safe_classes).insert(name.to_string());
    }

    /// Whether models of class `name` may be received by `load_from_party`.
    pub fn is_safe_class(&self, name: &str) -> bool {
        read(&self.safe_classes).contains(name)
    }

    /// Turns the recording of tuple requests on or off.
    pub fn trace(&self, tracing: bool) {
        lock(&self.provider).trace(tracing);
    }

    /// Records tuple requests only if none have been recorded yet.
    pub fn trace_once(&self) {
        lock(&self.provider).trace_once();
    }

    /// Generates a tuple for every recorded request ahead of time.
    pub fn fill_cache(&self) -> Result<(), Error> {
        lock(&self.provider).fill_cache()
    }

    /// Hit / miss counters of the tuple cache.
    pub fn provider_stats(&self) -> ProviderStats {
        lock(&self.provider).stats()
    }

    /// Writes the recorded tuple requests to `path`.
    pub fn save_requests(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        lock(&self.provider).save_requests(path)
    }

    /// Replaces the recorded tuple requests with the ones stored at `path`.
    pub fn load_requests(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        lock(&self.provider).load_requests(path)
    }

    /// Replaces the tuple provider, e.g. to plug in another [`crate::provider::TupleSource`].
    ///
    /// All parties must install matching providers.
    pub fn set_provider(&self, provider: TupleProvider) {
        *lock(&self.provider) = provider;
    }

    /// Runs `f` with exclusive access to the tuple provider.
    pub fn with_provider<T>(&self, f: impl FnOnce(&mut TupleProvider) -> T) -> T {
        f(&mut lock(&self.provider))
    }

    pub(crate) fn triple(
        &self,
        op: TripleOp,
        a: &[usize],
        b: &[usize],
    ) -> Result<(RingTensor, RingTensor, RingTensor), Error> {
        let request = Request::AdditiveTriple {
            op,
            a: a.to_vec(),
            b: b.to_vec(),
        };
        match lock(&self.provider).request(request)? {
            Tuple::Triple { a, b, c } => Ok((a, b, c)),
            _ => Err(Error::UnexpectedTuple { expected: "triple" }),
        }
    }

    pub(crate) fn binary_triple(
        &self,
        shape: &[usize],
    ) -> Result<(RingTensor, RingTensor, RingTensor), Error> {
        let request = Request::BinaryTriple {
            shape: shape.to_vec(),
        };
        match lock(&self.provider).request(request)? {
            Tuple::Triple { a, b, c } => Ok((a, b, c)),
            _ => Err(Error::UnexpectedTuple {
                expected: "binary triple",
            }),
        }
    }

    pub(crate) fn square(&self, shape: &[usize]) -> Result<(RingTensor, RingTensor), Error> {
        let request = Request::Square {
            shape: shape.to_vec(),
        };
        match lock(&self.provider).request(request)? {
            Tuple::Square { r, r2 } => Ok((r, r2)),
            _ => Err(Error::UnexpectedTuple { expected: "square" }),
        }
    }

    pub(crate) fn trunc_pair(
        &self,
        shape: &[usize],
        bits: u32,
    ) -> Result<(RingTensor, RingTensor), Error> {
        let request = Request::TruncPair {
            shape: shape.to_vec(),
            bits,
        };
        match lock(&self.provider).request(request)? {
            Tuple::TruncPair { r, shifted } => Ok((r, shifted)),
            _ => Err(Error::UnexpectedTuple {
                expected: "truncation pair",
            }),
        }
    }

    pub(crate) fn b2a_bits(&self, shape: &[usize]) -> Result<(RingTensor, RingTensor), Error> {
        let request = Request::B2aBits {
            shape: shape.to_vec(),
        };
        match lock(&self.provider).request(request)? {
            Tuple::B2aBits { arithmetic, binary } => Ok((arithmetic, binary)),
            _ => Err(Error::UnexpectedTuple {
                expected: "B2A bit tuple",
            }),
        }
    }

    /// This party's share of a fresh additive sharing of zero.
    pub(crate) fn zero_share(&self, shape: &[usize]) -> RingTensor {
        lock(&self.przs).additive(shape)
    }

    /// This party's share of a fresh XOR sharing of zero.
    pub(crate) fn zero_xor_share(&self, shape: &[usize]) -> RingTensor {
        lock(&self.przs).xor(shape)
    }

    /// Local (not shared) random words with only the lowest `bits` bits set.
    pub(crate) fn local_random_bits(&self, shape: &[usize], bits: u32) -> RingTensor {
        ring::random_bits(&mut *lock(&self.rng), shape, bits)
    }
}

#[cfg(test)]
mod tests {
    use futures::future::try_join_all;

    use crate::{
        Config, Context, Error,
        channel::SimpleChannel,
        registry::{BINARY, SchemeKind},
        ring,
    };

    async fn contexts(parties: usize) -> Vec<Context<SimpleChannel>> {
        try_join_all(
            SimpleChannel::channels(parties)
                .into_iter()
                .enumerate()
                .map(|(rank, ch)| Context::init(ch, rank, parties, Config::default())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn zero_shares_cancel_out() {
        for parties in [1, 2, 3, 5] {
            let ctxs = contexts(parties).await;
            let additive: Vec<_> = ctxs.iter().map(|c| c.zero_share(&[4, 2])).collect();
            let xor: Vec<_> = ctxs.iter().map(|c| c.zero_xor_share(&[3])).collect();
            assert!(ring::sum_all(&additive).unwrap().iter().all(|v| v.0 == 0));
            assert!(ring::xor_all(&xor).unwrap().iter().all(|v| v.0 == 0));
            if parties > 1 {
                assert!(additive[0].iter().any(|v| v.0 != 0));
            }
        }
    }

    #[tokio::test]
    async fn no_grad_is_scoped() {
        let ctx = contexts(1).await.pop().unwrap();
        assert!(ctx.is_grad_enabled());
        {
            let _outer = ctx.no_grad();
            {
                let _inner = ctx.no_grad();
                assert!(!ctx.is_grad_enabled());
            }
            assert!(!ctx.is_grad_enabled());
        }
        assert!(ctx.is_grad_enabled());
    }

    #[tokio::test]
    async fn no_grad_guards_drop_in_any_order() {
        let ctx = contexts(1).await.pop().unwrap();
        let first = ctx.no_grad();
        let second = ctx.no_grad();
        drop(first);
        assert!(!ctx.is_grad_enabled());
        drop(second);
        assert!(ctx.is_grad_enabled());

        let (a, b) = (ctx.no_grad(), ctx.no_grad());
        let (a, b) = (
            async move {
                tokio::task::yield_now().await;
                drop(a);
            },
            async move {
                drop(b);
            },
        );
        futures::join!(a, b);
        assert!(ctx.is_grad_enabled());
    }

    #[tokio::test]
    async fn registries_are_compared() {
        let ctxs = contexts(2).await;
        ctxs[0].register_cryptensor_type("scheme1", SchemeKind::Arithmetic).unwrap();
        let results = futures::future::join_all(ctxs.iter().map(|c| c.verify_registry())).await;
        assert!(results.iter().all(|r| matches!(r, Err(Error::InconsistentRegistry))));

        ctxs[1].register_cryptensor_type("scheme1", SchemeKind::Arithmetic).unwrap();
        try_join_all(ctxs.iter().map(|c| c.verify_registry())).await.unwrap();

        ctxs[0].set_default_cryptensor_type(BINARY).unwrap();
        assert_eq!(ctxs[0].get_default_cryptensor_type(), BINARY);
        assert!(matches!(
            ctxs[0].set_default_cryptensor_type("missing"),
            Err(Error::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn unknown_default_type_is_rejected() {
        let ch = SimpleChannel::channels(1).pop().unwrap();
        let config = Config {
            default_cryptensor_type: "missing".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            Context::init(ch, 0, 1, config).await,
            Err(Error::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn safe_classes() {
        let ctx = contexts(1).await.pop().unwrap();
        assert!(!ctx.is_safe_class("Linear"));
        ctx.register_safe_class("Linear");
        assert!(ctx.is_safe_class("Linear"));
    }
}
