//! Environment shims for the native module's startup path.
//!
//! The guest's portability layer expects a random-bytes source and a
//! millisecond clock. In a general host context those are backed by the OS
//! entropy source and a monotonic clock. On the restricted real-time thread
//! neither is assumed to exist, so substitutes are installed instead:
//!
//! | Primitive | Host context | Restricted real-time thread |
//! |-----------|--------------|-----------------------------|
//! | `random_fill` | OS CSPRNG (`getrandom`) | `SmallRng`, NOT cryptographic |
//! | `now_ms` | monotonic `Instant` | coarse wall clock, whole ms |
//!
//! The substitute generator lives inside one module instance's store and is
//! reachable only through that guest's `random_fill` import. Nothing here
//! touches a process-wide RNG or registers a custom `getrandom` backend.

use std::cell::Cell;
use std::marker::PhantomData;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use wasmtime::{Caller, Linker};

use crate::config::{ContextSelection, ShimCapabilities};
use crate::error::{BridgeError, Result};
use crate::runtime::BridgeHostState;

thread_local! {
    static REALTIME_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// The kind of thread the bridge is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// General-purpose thread with OS entropy and clocks
    Host,
    /// Deadline-bound audio callback thread
    RestrictedRealtime,
}

impl ExecutionContext {
    /// Context of the current thread, as marked by [`RealtimeScope`].
    pub fn detect() -> Self {
        if REALTIME_THREAD.with(|flag| flag.get()) {
            Self::RestrictedRealtime
        } else {
            Self::Host
        }
    }

    /// Apply a configured selection, detecting when it is `Auto`.
    pub fn resolve(selection: ContextSelection) -> Self {
        match selection {
            ContextSelection::Auto => Self::detect(),
            ContextSelection::Host => Self::Host,
            ContextSelection::RestrictedRealtime => Self::RestrictedRealtime,
        }
    }
}

/// Marks the current thread as a restricted real-time thread while alive.
///
/// Audio callbacks enter a scope before spawning or loading a bridge so that
/// [`ExecutionContext::detect`] picks the substitute shims.
#[must_use = "the thread is only marked while the scope is alive"]
pub struct RealtimeScope {
    previous: bool,
    // thread-local marker, must be dropped on the thread that set it
    _not_send: PhantomData<*const ()>,
}

impl RealtimeScope {
    /// Mark the current thread.
    pub fn enter() -> Self {
        let previous = REALTIME_THREAD.with(|flag| flag.replace(true));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for RealtimeScope {
    fn drop(&mut self) {
        REALTIME_THREAD.with(|flag| flag.set(self.previous));
    }
}

/// Backing of the guest's random-bytes import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropyKind {
    /// Operating-system CSPRNG
    Os,
    /// Fast non-cryptographic generator
    NonCryptographic,
}

/// Backing of the guest's millisecond clock import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    /// Monotonic high-resolution clock
    Monotonic,
    /// Coarse wall clock
    CoarseWallClock,
}

/// What the shim layer installed and how often the guest used it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShimReport {
    /// Context the shims were installed for
    pub context: ExecutionContext,
    /// Random source kind
    pub entropy: EntropyKind,
    /// Clock source kind
    pub clock: ClockKind,
    /// Number of `random_fill` calls served
    pub random_calls: u64,
    /// Number of `now_ms` calls served
    pub clock_calls: u64,
}

enum EntropySource {
    Os,
    NonCryptographic(SmallRng),
}

impl EntropySource {
    fn fill(&mut self, dest: &mut [u8]) -> bool {
        match self {
            Self::Os => getrandom::getrandom(dest).is_ok(),
            Self::NonCryptographic(rng) => {
                rng.fill_bytes(dest);
                true
            }
        }
    }

    fn kind(&self) -> EntropyKind {
        match self {
            Self::Os => EntropyKind::Os,
            Self::NonCryptographic(_) => EntropyKind::NonCryptographic,
        }
    }
}

enum ClockSource {
    Monotonic(Instant),
    CoarseWallClock,
}

impl ClockSource {
    fn now_ms(&self) -> f64 {
        match self {
            Self::Monotonic(origin) => origin.elapsed().as_secs_f64() * 1000.0,
            Self::CoarseWallClock => coarse_wall_clock_ms().unwrap_or(0) as f64,
        }
    }

    fn kind(&self) -> ClockKind {
        match self {
            Self::Monotonic(_) => ClockKind::Monotonic,
            Self::CoarseWallClock => ClockKind::CoarseWallClock,
        }
    }
}

fn coarse_wall_clock_ms() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

/// Entropy and time primitives served to one module instance.
pub struct EnvironmentShim {
    context: ExecutionContext,
    entropy: EntropySource,
    clock: ClockSource,
    random_calls: u64,
    clock_calls: u64,
}

impl EnvironmentShim {
    /// Build the primitives for `context`.
    ///
    /// Fails when a primitive has neither a native nor a permitted substitute
    /// source, so the guest never starts against undefined values.
    pub fn install(context: ExecutionContext, caps: &ShimCapabilities) -> Result<Self> {
        let (entropy, clock) = match context {
            ExecutionContext::Host => {
                let mut entropy_check = [0u8; 1];
                getrandom::getrandom(&mut entropy_check).map_err(|e| {
                    BridgeError::ShimUnavailable(format!("OS entropy source: {}", e))
                })?;
                (EntropySource::Os, ClockSource::Monotonic(Instant::now()))
            }
            ExecutionContext::RestrictedRealtime => {
                if !caps.clocks {
                    return Err(BridgeError::ShimUnavailable(
                        "no time source on the real-time thread and the coarse clock substitute is denied"
                            .to_string(),
                    ));
                }
                let seed = coarse_wall_clock_ms().ok_or_else(|| {
                    BridgeError::ShimUnavailable("coarse wall clock is before the epoch".to_string())
                })?;
                if !caps.random {
                    return Err(BridgeError::ShimUnavailable(
                        "no entropy source on the real-time thread and the non-cryptographic substitute is denied"
                            .to_string(),
                    ));
                }
                (
                    EntropySource::NonCryptographic(SmallRng::seed_from_u64(seed)),
                    ClockSource::CoarseWallClock,
                )
            }
        };

        tracing::debug!(
            ?context,
            entropy = ?entropy.kind(),
            clock = ?clock.kind(),
            "environment shims installed"
        );

        Ok(Self {
            context,
            entropy,
            clock,
            random_calls: 0,
            clock_calls: 0,
        })
    }

    /// Context the shims were installed for.
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Snapshot of the installed sources and their usage.
    pub fn report(&self) -> ShimReport {
        ShimReport {
            context: self.context,
            entropy: self.entropy.kind(),
            clock: self.clock.kind(),
            random_calls: self.random_calls,
            clock_calls: self.clock_calls,
        }
    }

    fn fill_random(&mut self, dest: &mut [u8]) -> i32 {
        self.random_calls += 1;
        if self.entropy.fill(dest) {
            0
        } else {
            -1
        }
    }

    fn now_ms(&mut self) -> f64 {
        self.clock_calls += 1;
        self.clock.now_ms()
    }
}

/// Register the shim imports under `env_module`.
pub(crate) fn register(
    linker: &mut Linker<BridgeHostState>,
    env_module: &str,
    memory_export: &str,
) -> Result<()> {
    let memory_name = memory_export.to_string();
    linker
        .func_wrap(
            env_module,
            "random_fill",
            move |mut caller: Caller<'_, BridgeHostState>, ptr: i32, len: i32| -> i32 {
                let Some(memory) = caller
                    .get_export(&memory_name)
                    .and_then(|e| e.into_memory())
                else {
                    return -1;
                };
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let start = ptr as u32 as usize;
                let end = start.saturating_add(len as u32 as usize);
                match data.get_mut(start..end) {
                    Some(dest) => state.shim.fill_random(dest),
                    None => -1,
                }
            },
        )
        .map_err(|e| BridgeError::WasmError(format!("failed to register random_fill: {}", e)))?;

    linker
        .func_wrap(
            env_module,
            "now_ms",
            |mut caller: Caller<'_, BridgeHostState>| -> f64 { caller.data_mut().shim.now_ms() },
        )
        .map_err(|e| BridgeError::WasmError(format!("failed to register now_ms: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_defaults_to_host() {
        assert_eq!(ExecutionContext::detect(), ExecutionContext::Host);
    }

    #[test]
    fn test_realtime_scope_marks_and_restores() {
        {
            let _outer = RealtimeScope::enter();
            assert_eq!(ExecutionContext::detect(), ExecutionContext::RestrictedRealtime);
            {
                let _inner = RealtimeScope::enter();
                assert_eq!(ExecutionContext::detect(), ExecutionContext::RestrictedRealtime);
            }
            assert_eq!(ExecutionContext::detect(), ExecutionContext::RestrictedRealtime);
        }
        assert_eq!(ExecutionContext::detect(), ExecutionContext::Host);
    }

    #[test]
    fn test_realtime_marker_is_per_thread() {
        let _scope = RealtimeScope::enter();
        let other = std::thread::spawn(ExecutionContext::detect).join().unwrap();
        assert_eq!(other, ExecutionContext::Host);
    }

    #[test]
    fn test_resolve_selection() {
        let _scope = RealtimeScope::enter();
        assert_eq!(
            ExecutionContext::resolve(ContextSelection::Host),
            ExecutionContext::Host
        );
        assert_eq!(
            ExecutionContext::resolve(ContextSelection::Auto),
            ExecutionContext::RestrictedRealtime
        );
    }

    #[test]
    fn test_host_uses_os_entropy() {
        let shim = EnvironmentShim::install(ExecutionContext::Host, &ShimCapabilities::default())
            .unwrap();
        let report = shim.report();
        assert_eq!(report.entropy, EntropyKind::Os);
        assert_eq!(report.clock, ClockKind::Monotonic);
    }

    #[test]
    fn test_host_ignores_substitute_grants() {
        // Native primitives exist, so denying substitutes changes nothing.
        let shim = EnvironmentShim::install(ExecutionContext::Host, &ShimCapabilities::none())
            .unwrap();
        assert_eq!(shim.report().entropy, EntropyKind::Os);
    }

    #[test]
    fn test_restricted_uses_substitutes() {
        let mut shim = EnvironmentShim::install(
            ExecutionContext::RestrictedRealtime,
            &ShimCapabilities::default(),
        )
        .unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(shim.fill_random(&mut buf), 0);
        assert!(buf.iter().any(|&b| b != 0));

        let now = shim.now_ms();
        assert!(now > 0.0);
        assert_eq!(now.fract(), 0.0, "coarse clock reports whole milliseconds");

        let report = shim.report();
        assert_eq!(report.entropy, EntropyKind::NonCryptographic);
        assert_eq!(report.clock, ClockKind::CoarseWallClock);
        assert_eq!(report.random_calls, 1);
        assert_eq!(report.clock_calls, 1);
    }

    #[test]
    fn test_restricted_without_substitutes_fails() {
        let err = EnvironmentShim::install(
            ExecutionContext::RestrictedRealtime,
            &ShimCapabilities::default().random(false),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BridgeError::ShimUnavailable(_)));

        let err = EnvironmentShim::install(
            ExecutionContext::RestrictedRealtime,
            &ShimCapabilities::default().clocks(false),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BridgeError::ShimUnavailable(_)));
    }

    #[test]
    fn test_restricted_install_leaves_host_entropy_alone() {
        let _restricted = EnvironmentShim::install(
            ExecutionContext::RestrictedRealtime,
            &ShimCapabilities::default(),
        )
        .unwrap();

        let host = EnvironmentShim::install(ExecutionContext::Host, &ShimCapabilities::default())
            .unwrap();
        assert_eq!(host.report().entropy, EntropyKind::Os);

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        getrandom::getrandom(&mut a).unwrap();
        getrandom::getrandom(&mut b).unwrap();
        assert_ne!(a, b);
    }
}
