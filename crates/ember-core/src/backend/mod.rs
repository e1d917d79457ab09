//! Backend dispatch.
//!
//! This module provides:
//! - [`BackendOps`] - one method per numeric operation; a method left at its
//!   default body returns [`Dispatch::Unsupported`], the "not implemented
//!   here" entry
//! - [`Backend`] - an ops table bound to a capability, a thread count and a
//!   preferred element type; every op falls back to the scalar table when the
//!   bound table does not implement it
//! - [`BackendRegistry`] - the compiled-in backends, looked up by capability,
//!   name or op class
//! - [`default_backend`] / [`set_default_backend`] - the process-wide default

mod registry;

pub use registry::{registry, BackendEntry, BackendFactory, BackendRegistry, MAX_BACKENDS};

use crate::attention::AttentionConfig;
use crate::capability::{self, Capability, OpClass};
use crate::kernels::{self, RopeConfig, SamplingParams, Transpose};
use crate::tensor::{DType, TensorView, TensorViewMut};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A numeric operation in the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Matrix multiply.
    Gemm,
    /// Matrix-vector multiply.
    Gemv,
    /// `x * sigmoid(x)`.
    Silu,
    /// `silu(gate) * up`.
    SiluMul,
    /// erf-based GELU.
    Gelu,
    /// tanh-approximated GELU.
    GeluTanh,
    /// RMS normalization.
    RmsNorm,
    /// Layer normalization.
    LayerNorm,
    /// Rotary position embedding.
    Rope,
    /// Causal attention over the KV cache.
    Attention,
    /// Row-wise softmax.
    Softmax,
    /// Token sampling.
    Sample,
    /// Embedding table lookup.
    Embedding,
    /// KV cache append.
    KvAppend,
}

impl Op {
    /// Every op.
    pub const ALL: [Op; 14] = [
        Op::Gemm,
        Op::Gemv,
        Op::Silu,
        Op::SiluMul,
        Op::Gelu,
        Op::GeluTanh,
        Op::RmsNorm,
        Op::LayerNorm,
        Op::Rope,
        Op::Attention,
        Op::Softmax,
        Op::Sample,
        Op::Embedding,
        Op::KvAppend,
    ];

    /// Class used for priority lookups.
    pub const fn class(self) -> OpClass {
        match self {
            Op::Gemm | Op::Gemv => OpClass::Gemm,
            Op::Attention => OpClass::Attention,
            _ => OpClass::Elementwise,
        }
    }
}

/// Outcome of calling one entry of an ops table.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch<T = ()> {
    /// The backend ran the op (or rejected its arguments as a no-op).
    Handled(T),
    /// The backend has no implementation for this op.
    Unsupported,
}

impl<T> Dispatch<T> {
    /// Whether the op ran.
    pub fn is_handled(&self) -> bool {
        matches!(self, Dispatch::Handled(_))
    }

    /// The handled value, if any.
    pub fn handled(self) -> Option<T> {
        match self {
            Dispatch::Handled(v) => Some(v),
            Dispatch::Unsupported => None,
        }
    }
}

/// Construction-time settings handed to a backend factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSettings {
    /// Threads a single kernel call may use.
    pub threads: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            threads: capability::recommended_threads(),
        }
    }
}

/// Operation table of one backend.
///
/// Activations are f32 slices; weights and caches are tensor views of any
/// float type. Implementations validate their arguments and return without
/// writing anything when they do not fit together. Such a rejection still
/// counts as [`Dispatch::Handled`].
#[allow(unused_variables)]
pub trait BackendOps: Send + Sync + fmt::Debug {
    /// Capability this table is built for.
    fn capability(&self) -> Capability;

    /// Ops this table implements.
    fn supported_ops(&self) -> &'static [Op];

    /// `C = op(A) · op(B)`; `A` is `[m, k]` (`[k, m]` when transposed),
    /// `B` is `[k, n]` (`[n, k]` when transposed), `C` is `[m, n]`.
    fn gemm(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        c: &mut TensorViewMut<'_>,
        trans_a: Transpose,
        trans_b: Transpose,
    ) -> Dispatch {
        Dispatch::Unsupported
    }

    /// `y = op(A) · x` for `A` stored `[rows, cols]`.
    fn gemv(&self, a: &TensorView<'_>, x: &[f32], y: &mut [f32], trans: Transpose) -> Dispatch {
        Dispatch::Unsupported
    }

    /// SiLU in place.
    fn silu(&self, x: &mut [f32]) -> Dispatch {
        Dispatch::Unsupported
    }

    /// `gate = silu(gate) * up`.
    fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Dispatch {
        Dispatch::Unsupported
    }

    /// erf-based GELU in place.
    fn gelu(&self, x: &mut [f32]) -> Dispatch {
        Dispatch::Unsupported
    }

    /// tanh-approximated GELU in place.
    fn gelu_tanh(&self, x: &mut [f32]) -> Dispatch {
        Dispatch::Unsupported
    }

    /// RMSNorm of every `weight.numel()`-sized row of `x` into `out`.
    fn rms_norm(&self, x: &[f32], weight: &TensorView<'_>, out: &mut [f32], eps: f32) -> Dispatch {
        Dispatch::Unsupported
    }

    /// LayerNorm of every `dim`-sized row of `x` into `out`.
    fn layer_norm(
        &self,
        x: &[f32],
        weight: Option<&TensorView<'_>>,
        bias: Option<&TensorView<'_>>,
        out: &mut [f32],
        dim: usize,
        eps: f32,
    ) -> Dispatch {
        Dispatch::Unsupported
    }

    /// Rotate `q` (`[tokens, heads, head_dim]`) and `k`
    /// (`[tokens, kv_heads, head_dim]`) in place.
    fn rope(
        &self,
        q: &mut [f32],
        k: &mut [f32],
        positions: &[usize],
        cos: &[f32],
        sin: &[f32],
        config: &RopeConfig,
    ) -> Dispatch {
        Dispatch::Unsupported
    }

    /// Causal attention of `q` (`[tokens, heads, head_dim]`) against the
    /// cache (`[capacity, kv_heads, head_dim]`) into `out`.
    fn attention(
        &self,
        q: &[f32],
        keys: &TensorView<'_>,
        values: &TensorView<'_>,
        out: &mut [f32],
        positions: &[usize],
        config: &AttentionConfig,
    ) -> Dispatch {
        Dispatch::Unsupported
    }

    /// Softmax of every `cols`-sized row of `x`, inputs multiplied by
    /// `scale` first.
    fn softmax(&self, x: &mut [f32], cols: usize, scale: f32) -> Dispatch {
        Dispatch::Unsupported
    }

    /// Draw a token id from `logits`.
    fn sample(&self, logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Dispatch<u32> {
        Dispatch::Unsupported
    }

    /// Gather rows of `table` (`[vocab, hidden]`) for `ids` into `out`.
    fn embedding(&self, table: &TensorView<'_>, ids: &[u32], out: &mut [f32]) -> Dispatch {
        Dispatch::Unsupported
    }

    /// Write `k` and `v` rows at `live_len` and return the new live length.
    fn kv_append(
        &self,
        keys: &mut TensorViewMut<'_>,
        values: &mut TensorViewMut<'_>,
        k: &[f32],
        v: &[f32],
        live_len: usize,
    ) -> Dispatch<usize> {
        Dispatch::Unsupported
    }
}

macro_rules! dispatch {
    ($self:ident, $op:ident ( $($arg:expr),* $(,)? )) => {
        match $self.ops.$op($($arg),*) {
            Dispatch::Handled(value) => value,
            Dispatch::Unsupported => {
                debug!(op = stringify!($op), backend = $self.name, "op not implemented, using scalar");
                match $self.fallback.$op($($arg),*) {
                    Dispatch::Handled(value) => value,
                    Dispatch::Unsupported => Default::default(),
                }
            }
        }
    };
}

/// A selected backend.
///
/// Cheap to clone; holds no per-call state, so one instance may serve many
/// models concurrently.
#[derive(Clone)]
pub struct Backend {
    name: &'static str,
    capability: Capability,
    ops: Arc<dyn BackendOps>,
    fallback: Arc<dyn BackendOps>,
    factory: BackendFactory,
    settings: BackendSettings,
    preferred_dtype: DType,
}

impl Backend {
    /// Backend for `preferred`, or the best available one when `preferred`
    /// is not compiled in or not present on this host.
    pub fn create(preferred: Capability) -> Self {
        let registry = registry();
        match registry.find(preferred) {
            Some(entry) => Self::from_entry(entry, BackendSettings::default()),
            None => {
                let entry = registry.best_or_scalar(OpClass::Gemm);
                warn!(
                    requested = %preferred,
                    selected = entry.name,
                    "requested backend unavailable, falling back"
                );
                Self::from_entry(entry, BackendSettings::default())
            }
        }
    }

    /// Highest-priority backend for GEMM on this host.
    pub fn best() -> Self {
        Self::from_entry(registry().best_or_scalar(OpClass::Gemm), BackendSettings::default())
    }

    /// The portable scalar backend.
    pub fn scalar() -> Self {
        Self::from_entry(&kernels::scalar::ENTRY, BackendSettings::default())
    }

    /// Instantiate a registry entry.
    pub fn from_entry(entry: &BackendEntry, settings: BackendSettings) -> Self {
        let ops = (entry.factory)(&settings);
        let fallback = (kernels::scalar::ENTRY.factory)(&settings);
        Self {
            name: entry.name,
            capability: entry.capability,
            preferred_dtype: preferred_dtype(entry.capability),
            ops,
            fallback,
            factory: entry.factory,
            settings,
        }
    }

    /// Same backend with a different per-call thread count.
    pub fn with_threads(self, threads: usize) -> Self {
        let settings = BackendSettings {
            threads: threads.max(1),
        };
        Self {
            ops: (self.factory)(&settings),
            fallback: (kernels::scalar::ENTRY.factory)(&settings),
            settings,
            ..self
        }
    }

    /// Same backend with a different preferred element type.
    pub fn with_preferred_dtype(mut self, dtype: DType) -> Self {
        self.preferred_dtype = dtype;
        self
    }

    /// Backend name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bound capability.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Threads a single kernel call may use.
    pub fn threads(&self) -> usize {
        self.settings.threads
    }

    /// Element type weights should be loaded as.
    pub fn preferred_dtype(&self) -> DType {
        self.preferred_dtype
    }

    /// Whether the bound table implements `op` without scalar fallback.
    pub fn supports(&self, op: Op) -> bool {
        self.ops.supported_ops().contains(&op)
    }

    /// The bound ops table.
    pub fn ops(&self) -> &dyn BackendOps {
        self.ops.as_ref()
    }

    /// See [`BackendOps::gemm`].
    pub fn gemm(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        c: &mut TensorViewMut<'_>,
        trans_a: Transpose,
        trans_b: Transpose,
    ) {
        dispatch!(self, gemm(a, b, c, trans_a, trans_b))
    }

    /// See [`BackendOps::gemv`].
    pub fn gemv(&self, a: &TensorView<'_>, x: &[f32], y: &mut [f32], trans: Transpose) {
        dispatch!(self, gemv(a, x, y, trans))
    }

    /// See [`BackendOps::silu`].
    pub fn silu(&self, x: &mut [f32]) {
        dispatch!(self, silu(x))
    }

    /// See [`BackendOps::silu_mul`].
    pub fn silu_mul(&self, gate: &mut [f32], up: &[f32]) {
        dispatch!(self, silu_mul(gate, up))
    }

    /// See [`BackendOps::gelu`].
    pub fn gelu(&self, x: &mut [f32]) {
        dispatch!(self, gelu(x))
    }

    /// See [`BackendOps::gelu_tanh`].
    pub fn gelu_tanh(&self, x: &mut [f32]) {
        dispatch!(self, gelu_tanh(x))
    }

    /// See [`BackendOps::rms_norm`].
    pub fn rms_norm(&self, x: &[f32], weight: &TensorView<'_>, out: &mut [f32], eps: f32) {
        dispatch!(self, rms_norm(x, weight, out, eps))
    }

    /// See [`BackendOps::layer_norm`].
    pub fn layer_norm(
        &self,
        x: &[f32],
        weight: Option<&TensorView<'_>>,
        bias: Option<&TensorView<'_>>,
        out: &mut [f32],
        dim: usize,
        eps: f32,
    ) {
        dispatch!(self, layer_norm(x, weight, bias, out, dim, eps))
    }

    /// See [`BackendOps::rope`].
    pub fn rope(
        &self,
        q: &mut [f32],
        k: &mut [f32],
        positions: &[usize],
        cos: &[f32],
        sin: &[f32],
        config: &RopeConfig,
    ) {
        dispatch!(self, rope(q, k, positions, cos, sin, config))
    }

    /// See [`BackendOps::attention`].
    pub fn attention(
        &self,
        q: &[f32],
        keys: &TensorView<'_>,
        values: &TensorView<'_>,
        out: &mut [f32],
        positions: &[usize],
        config: &AttentionConfig,
    ) {
        dispatch!(self, attention(q, keys, values, out, positions, config))
    }

    /// See [`BackendOps::softmax`].
    pub fn softmax(&self, x: &mut [f32], cols: usize, scale: f32) {
        dispatch!(self, softmax(x, cols, scale))
    }

    /// See [`BackendOps::sample`].
    pub fn sample(&self, logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> u32 {
        dispatch!(self, sample(logits, params, rng))
    }

    /// See [`BackendOps::embedding`].
    pub fn embedding(&self, table: &TensorView<'_>, ids: &[u32], out: &mut [f32]) {
        dispatch!(self, embedding(table, ids, out))
    }

    /// See [`BackendOps::kv_append`].
    pub fn kv_append(
        &self,
        keys: &mut TensorViewMut<'_>,
        values: &mut TensorViewMut<'_>,
        k: &[f32],
        v: &[f32],
        live_len: usize,
    ) -> usize {
        match self.ops.kv_append(keys, values, k, v, live_len) {
            Dispatch::Handled(len) => len,
            Dispatch::Unsupported => self
                .fallback
                .kv_append(keys, values, k, v, live_len)
                .handled()
                .unwrap_or(live_len),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("threads", &self.settings.threads)
            .field("preferred_dtype", &self.preferred_dtype)
            .finish()
    }
}

fn preferred_dtype(capability: Capability) -> DType {
    match capability {
        Capability::Neon | Capability::Amx | Capability::Accelerate => DType::F16,
        _ => DType::F32,
    }
}

static DEFAULT_BACKEND: RwLock<Option<Arc<Backend>>> = RwLock::new(None);

/// The process-wide default backend, built on first use.
pub fn default_backend() -> Arc<Backend> {
    if let Some(backend) = DEFAULT_BACKEND.read().as_ref() {
        return Arc::clone(backend);
    }
    let mut slot = DEFAULT_BACKEND.write();
    if let Some(backend) = slot.as_ref() {
        return Arc::clone(backend);
    }
    let backend = Arc::new(Backend::best());
    info!(
        backend = backend.name(),
        threads = backend.threads(),
        "default backend selected"
    );
    *slot = Some(Arc::clone(&backend));
    backend
}

/// Replace the process-wide default backend.
pub fn set_default_backend(backend: Backend) {
    info!(backend = backend.name(), "default backend replaced");
    *DEFAULT_BACKEND.write() = Some(Arc::new(backend));
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Implements GEMM only; everything else must come from the fallback.
    #[derive(Debug)]
    struct GemmOnly;

    impl BackendOps for GemmOnly {
        fn capability(&self) -> Capability {
            Capability::Scalar
        }

        fn supported_ops(&self) -> &'static [Op] {
            &[Op::Gemm]
        }

        fn gemm(
            &self,
            _a: &TensorView<'_>,
            _b: &TensorView<'_>,
            c: &mut TensorViewMut<'_>,
            _trans_a: Transpose,
            _trans_b: Transpose,
        ) -> Dispatch {
            c.fill(42.0);
            Dispatch::Handled(())
        }
    }

    fn gemm_only(_: &BackendSettings) -> Arc<dyn BackendOps> {
        Arc::new(GemmOnly)
    }

    const GEMM_ONLY: BackendEntry = BackendEntry {
        name: "gemm-only",
        capability: Capability::Scalar,
        factory: gemm_only,
    };

    #[test]
    fn missing_entries_fall_back_to_scalar() {
        let backend = Backend::from_entry(&GEMM_ONLY, BackendSettings { threads: 1 });
        assert!(backend.supports(Op::Gemm));
        assert!(!backend.supports(Op::Silu));
        assert!(!backend.ops().silu(&mut [1.0]).is_handled());

        let mut x = [0.0f32, 1.0];
        backend.silu(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 0.731_058_6).abs() < 1e-6);

        let a = [1.0f32; 4];
        let mut c = [0.0f32; 4];
        let av = TensorView::wrap_f32(&[2, 2], &a).unwrap();
        let mut cv = TensorViewMut::wrap_f32_mut(&[2, 2], &mut c).unwrap();
        backend.gemm(&av, &av, &mut cv, Transpose::No, Transpose::No);
        assert_eq!(c, [42.0; 4]);
    }

    #[test]
    fn create_falls_back_when_unavailable() {
        let backend = Backend::create(Capability::Cuda);
        assert_ne!(backend.capability(), Capability::Cuda);
        assert!(capability::detect().is_available(backend.capability()));
    }

    #[test]
    fn scalar_supports_everything() {
        let backend = Backend::scalar();
        for op in Op::ALL {
            assert!(backend.supports(op), "{:?}", op);
        }
        assert_eq!(backend.preferred_dtype(), DType::F32);
    }

    #[test]
    fn thread_knob_rebuilds_ops() {
        let backend = Backend::scalar().with_threads(3);
        assert_eq!(backend.threads(), 3);
        assert_eq!(backend.with_threads(0).threads(), 1);
    }

    #[test]
    fn default_backend_is_built_once() {
        let a = default_backend();
        let b = default_backend();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
