//! Host capability detection.
//!
//! [`detect`] probes the CPU once and caches the answer for the life of the
//! process. Compile-time target flags decide what can exist at all (NEON on
//! aarch64, AMX on Apple Silicon, Accelerate when linked); runtime feature
//! detection decides AVX2/AVX-512 on x86_64.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::debug;

/// Environment variable read at first detection for the thread count.
pub const THREADS_ENV: &str = "EMBER_NUM_THREADS";

/// A hardware acceleration feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Portable scalar code, always present.
    Scalar,
    /// ARM Advanced SIMD.
    Neon,
    /// Apple matrix coprocessor.
    Amx,
    /// x86 AVX2 with FMA.
    Avx2,
    /// x86 AVX-512 Foundation.
    Avx512,
    /// Apple Accelerate (vendor BLAS).
    Accelerate,
    /// Apple GPU (not implemented).
    Metal,
    /// NVIDIA GPU (not implemented).
    Cuda,
}

impl Capability {
    /// Number of capability slots.
    pub const COUNT: usize = 8;

    /// Every capability, in slot order.
    pub const ALL: [Capability; Self::COUNT] = [
        Capability::Scalar,
        Capability::Neon,
        Capability::Amx,
        Capability::Avx2,
        Capability::Avx512,
        Capability::Accelerate,
        Capability::Metal,
        Capability::Cuda,
    ];

    /// Display name.
    pub const fn name(self) -> &'static str {
        match self {
            Capability::Scalar => "scalar",
            Capability::Neon => "neon",
            Capability::Amx => "amx",
            Capability::Avx2 => "avx2",
            Capability::Avx512 => "avx512",
            Capability::Accelerate => "accelerate",
            Capability::Metal => "metal",
            Capability::Cuda => "cuda",
        }
    }

    /// Look up by display name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Rank for matrix multiply; higher wins.
    ///
    /// Vendor BLAS > AMX > NEON > AVX-512 > AVX2 > scalar.
    pub const fn gemm_rank(self) -> u8 {
        match self {
            Capability::Accelerate => 60,
            Capability::Amx => 50,
            Capability::Neon => 40,
            Capability::Avx512 => 30,
            Capability::Avx2 => 20,
            Capability::Scalar => 1,
            Capability::Metal | Capability::Cuda => 0,
        }
    }

    /// Rank for elementwise, activation, softmax and attention kernels.
    ///
    /// SIMD units beat vendor BLAS here.
    pub const fn elementwise_rank(self) -> u8 {
        match self {
            Capability::Neon => 50,
            Capability::Avx512 => 45,
            Capability::Avx2 => 40,
            Capability::Accelerate => 30,
            Capability::Amx => 20,
            Capability::Scalar => 1,
            Capability::Metal | Capability::Cuda => 0,
        }
    }

    /// Rank for `class`.
    pub const fn rank(self, class: OpClass) -> u8 {
        match class {
            OpClass::Gemm => self.gemm_rank(),
            OpClass::Elementwise | OpClass::Attention => self.elementwise_rank(),
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of work used to choose a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// GEMM and GEMV.
    Gemm,
    /// Activations, normalization, softmax, RoPE, embedding, KV append.
    Elementwise,
    /// Attention.
    Attention,
}

/// Availability and priority of one capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityEntry {
    /// Whether the host has it and this build can use it.
    pub available: bool,
    /// GEMM priority, zero when unavailable.
    pub priority: u8,
}

/// Data cache sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizes {
    /// L1 data cache.
    pub l1d: usize,
    /// L2 cache.
    pub l2: usize,
    /// L3 cache (zero when absent).
    pub l3: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            l1d: 32 * 1024,
            l2: 1024 * 1024,
            l3: 8 * 1024 * 1024,
        }
    }
}

/// Snapshot of host capabilities.
#[derive(Debug, Clone)]
pub struct Capabilities {
    entries: [CapabilityEntry; Capability::COUNT],
    cpu_count: usize,
    env_threads: Option<usize>,
    cache: CacheSizes,
}

impl Capabilities {
    /// Probe the host without caching.
    pub fn probe() -> Self {
        let mut entries = [CapabilityEntry::default(); Capability::COUNT];
        for cap in Capability::ALL {
            if host_has(cap) {
                entries[cap.slot()] = CapabilityEntry {
                    available: true,
                    priority: cap.gemm_rank(),
                };
            }
        }
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let env_threads = std::env::var(THREADS_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0);
        Self {
            entries,
            cpu_count,
            env_threads,
            cache: probe_cache_sizes(),
        }
    }

    /// Entry for `cap`.
    pub fn entry(&self, cap: Capability) -> CapabilityEntry {
        self.entries[cap.slot()]
    }

    /// Whether `cap` is usable.
    pub fn is_available(&self, cap: Capability) -> bool {
        self.entry(cap).available
    }

    /// Usable capabilities in slot order.
    pub fn available(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(|&c| self.is_available(c))
    }

    /// Highest-ranked usable capability for `class`.
    pub fn best_for(&self, class: OpClass) -> Capability {
        self.available()
            .max_by_key(|c| c.rank(class))
            .unwrap_or(Capability::Scalar)
    }

    /// Logical CPUs.
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// Cache sizes.
    pub fn cache_sizes(&self) -> CacheSizes {
        self.cache
    }
}

static DETECTED: OnceLock<Capabilities> = OnceLock::new();
static THREAD_OVERRIDE: AtomicUsize = AtomicUsize::new(0);

/// Capabilities of this host, probed on first call.
pub fn detect() -> &'static Capabilities {
    DETECTED.get_or_init(|| {
        let caps = Capabilities::probe();
        debug!(
            available = ?caps.available().map(Capability::name).collect::<Vec<_>>(),
            cpus = caps.cpu_count,
            "detected host capabilities"
        );
        caps
    })
}

/// Override the recommended thread count; `0` clears the override.
pub fn set_thread_override(threads: usize) {
    THREAD_OVERRIDE.store(threads, Ordering::Release);
}

/// Thread count kernels should use: the override, else
/// `EMBER_NUM_THREADS`, else the CPU count.
pub fn recommended_threads() -> usize {
    match THREAD_OVERRIDE.load(Ordering::Acquire) {
        0 => {
            let caps = detect();
            caps.env_threads.unwrap_or(caps.cpu_count).max(1)
        }
        n => n,
    }
}

fn host_has(cap: Capability) -> bool {
    match cap {
        Capability::Scalar => true,
        Capability::Neon => cfg!(target_arch = "aarch64"),
        Capability::Amx => cfg!(all(target_arch = "aarch64", target_os = "macos")),
        Capability::Avx2 => x86_has_avx2(),
        Capability::Avx512 => x86_has_avx512(),
        Capability::Accelerate => ember_ffi::accelerate_available(),
        Capability::Metal | Capability::Cuda => false,
    }
}

#[cfg(target_arch = "x86_64")]
fn x86_has_avx2() -> bool {
    std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
fn x86_has_avx2() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
fn x86_has_avx512() -> bool {
    x86_has_avx2() && std::arch::is_x86_feature_detected!("avx512f")
}

#[cfg(not(target_arch = "x86_64"))]
fn x86_has_avx512() -> bool {
    false
}

#[cfg(target_os = "linux")]
fn probe_cache_sizes() -> CacheSizes {
    use std::fs;

    let mut sizes = CacheSizes::default();
    let base = "/sys/devices/system/cpu/cpu0/cache";
    for index in 0..8 {
        let dir = format!("{}/index{}", base, index);
        let read = |name: &str| fs::read_to_string(format!("{}/{}", dir, name)).ok();
        let (Some(level), Some(kind), Some(size)) = (read("level"), read("type"), read("size"))
        else {
            break;
        };
        let Some(bytes) = parse_cache_size(&size) else {
            continue;
        };
        match (level.trim(), kind.trim()) {
            ("1", "Data") => sizes.l1d = bytes,
            ("2", _) => sizes.l2 = bytes,
            ("3", _) => sizes.l3 = bytes,
            _ => {}
        }
    }
    sizes
}

#[cfg(not(target_os = "linux"))]
fn probe_cache_sizes() -> CacheSizes {
    CacheSizes::default()
}

/// Parse sysfs cache sizes such as `32K`, `1024K` or `36M`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_cache_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, scale) = match s.as_bytes().last()? {
        b'K' | b'k' => (&s[..s.len() - 1], 1024),
        b'M' | b'm' => (&s[..s.len() - 1], 1024 * 1024),
        b'G' | b'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.parse::<usize>().ok().map(|n| n * scale)
}
