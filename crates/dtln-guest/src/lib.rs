//! Guest-side kit for denoiser modules.
//!
//! A denoiser module implements [`BlockEngine`] for its model and invokes
//! [`export_denoiser!`] once. The macro emits the exports the bridge expects:
//!
//! ```text
//! _initialize()                  draw the arena seed, record start time
//! dtln_create_wasm() -> i32      new instance id, negative on failure
//! dtln_get_audio_buffer(i32)     byte offset of the instance's block buffer
//! dtln_denoise_wasm(i32) -> i32  process that buffer in place, 0 = ok
//! dtln_destroy_wasm(i32)         release the instance
//! ```
//!
//! Each instance owns its model state and a heap-allocated block buffer, so
//! streams never share memory the host writes into.

use std::f32::consts::PI;

/// Samples per block.
pub const BLOCK_SIZE: usize = 512;

/// One block of mono `f32` audio.
pub type Block = [f32; BLOCK_SIZE];

/// Most instances an arena will hold.
pub const MAX_INSTANCES: usize = 64;

// =============================================================================
// Status Codes
// =============================================================================

/// Processing succeeded.
pub const STATUS_OK: i32 = 0;
/// The handle does not name a live instance.
pub const STATUS_UNKNOWN_HANDLE: i32 = 1;
/// The engine failed without a status code of its own.
pub const STATUS_ENGINE_FAILED: i32 = 2;

/// `_initialize` has not run.
pub const CREATE_NOT_INITIALIZED: i32 = -1;
/// Every arena slot is taken.
pub const CREATE_ARENA_FULL: i32 = -2;
/// The engine refused to construct.
pub const CREATE_ENGINE_FAILED: i32 = -3;

// =============================================================================
// Environment Imports
// =============================================================================
// Supplied by the bridge's environment shim layer under `dtln_env`.

/// Access to the host-provided entropy and clock.
pub mod env {
    #[cfg(target_arch = "wasm32")]
    #[link(wasm_import_module = "dtln_env")]
    extern "C" {
        fn random_fill(ptr: *mut u8, len: i32) -> i32;
        fn now_ms() -> f64;
    }

    /// Fill `dest` with random bytes. Returns false when the host refused.
    #[cfg(target_arch = "wasm32")]
    pub fn random_bytes(dest: &mut [u8]) -> bool {
        let Ok(len) = i32::try_from(dest.len()) else {
            return false;
        };
        unsafe { random_fill(dest.as_mut_ptr(), len) == 0 }
    }

    /// Host timestamp in milliseconds.
    #[cfg(target_arch = "wasm32")]
    pub fn timestamp_ms() -> f64 {
        unsafe { now_ms() }
    }

    // Native builds (unit tests) have no bridge: fixed pattern and wall clock.

    #[cfg(not(target_arch = "wasm32"))]
    pub fn random_bytes(dest: &mut [u8]) -> bool {
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        true
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn timestamp_ms() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

// =============================================================================
// Engine Trait
// =============================================================================

/// A per-stream model with recurrent state.
pub trait BlockEngine: Sized + Send {
    /// Construct fresh state. `seed` is unique per instance.
    fn new(seed: u64) -> Option<Self>;

    /// Denoise `block` in place, advancing the model state.
    ///
    /// An `Err` carries a non-zero status code for the host.
    fn process(&mut self, block: &mut Block) -> Result<(), i32>;
}

// =============================================================================
// Instance Arena
// =============================================================================

struct Instance<E> {
    engine: E,
    buffer: Box<Block>,
    created_at_ms: f64,
}

/// Slot arena of live instances. Instance ids are slot indices.
pub struct InstanceRegistry<E> {
    slots: Vec<Option<Instance<E>>>,
    seed: u64,
    started_at_ms: Option<f64>,
}

impl<E> Default for InstanceRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> InstanceRegistry<E> {
    /// Empty, uninitialized arena.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            seed: 0,
            started_at_ms: None,
        }
    }

    /// Module startup: seed the arena and record the start time.
    pub fn initialize(&mut self) {
        if self.started_at_ms.is_some() {
            return;
        }
        let mut seed = [0u8; 8];
        if !env::random_bytes(&mut seed) {
            // Leave uninitialized; create reports it.
            return;
        }
        self.seed = u64::from_le_bytes(seed);
        self.started_at_ms = Some(env::timestamp_ms());
    }

    /// Whether `initialize` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.started_at_ms.is_some()
    }

    /// Number of live instances.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn slot_mut(&mut self, id: i32) -> Option<&mut Instance<E>> {
        let index = usize::try_from(id).ok()?;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Release instance `id`. Unknown ids are ignored.
    pub fn destroy(&mut self, id: i32) {
        if let Some(slot) = usize::try_from(id).ok().and_then(|i| self.slots.get_mut(i)) {
            *slot = None;
        }
    }

    /// The block buffer of instance `id`.
    pub fn buffer(&mut self, id: i32) -> Option<&mut Block> {
        self.slot_mut(id).map(|instance| &mut *instance.buffer)
    }

    /// Byte offset of instance `id`'s buffer in linear memory, `-1` if unknown.
    pub fn buffer_offset(&mut self, id: i32) -> i32 {
        self.buffer(id)
            .and_then(|block| i32::try_from(block.as_mut_ptr() as usize).ok())
            .unwrap_or(-1)
    }

    /// Milliseconds between module startup and creation of instance `id`.
    pub fn age_at_creation_ms(&mut self, id: i32) -> Option<f64> {
        let started = self.started_at_ms?;
        self.slot_mut(id)
            .map(|instance| instance.created_at_ms - started)
    }
}

impl<E: BlockEngine> InstanceRegistry<E> {
    /// Create an instance with zeroed buffer and fresh engine state.
    pub fn create(&mut self) -> i32 {
        if !self.is_initialized() {
            return CREATE_NOT_INITIALIZED;
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.slots.len() < MAX_INSTANCES => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return CREATE_ARENA_FULL,
        };

        let Some(engine) = E::new(splitmix64(self.seed ^ index as u64)) else {
            return CREATE_ENGINE_FAILED;
        };
        self.seed = splitmix64(self.seed);
        self.slots[index] = Some(Instance {
            engine,
            buffer: Box::new([0.0; BLOCK_SIZE]),
            created_at_ms: env::timestamp_ms(),
        });
        index as i32
    }

    /// Run instance `id`'s engine over its buffer.
    pub fn denoise(&mut self, id: i32) -> i32 {
        match self.slot_mut(id) {
            Some(instance) => match instance.engine.process(&mut instance.buffer) {
                Ok(()) => STATUS_OK,
                Err(code) if code != STATUS_OK => code,
                Err(_) => STATUS_ENGINE_FAILED,
            },
            None => STATUS_UNKNOWN_HANDLE,
        }
    }
}

fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// =============================================================================
// Reference Engine
// =============================================================================

/// One-pole high-pass filter with a soft noise gate.
///
/// Stands in for a trained model when exercising the bridge end to end.
pub struct HighPassGate {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
    envelope: f32,
}

impl HighPassGate {
    /// Cutoff in Hz at 16 kHz.
    pub const CUTOFF_HZ: f32 = 80.0;
    /// Envelope below which the output is attenuated.
    pub const GATE_THRESHOLD: f32 = 0.01;
}

impl BlockEngine for HighPassGate {
    fn new(_seed: u64) -> Option<Self> {
        let rc = 1.0 / (2.0 * PI * Self::CUTOFF_HZ);
        let dt = 1.0 / 16_000.0;
        Some(Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
            envelope: 0.0,
        })
    }

    fn process(&mut self, block: &mut Block) -> Result<(), i32> {
        for sample in block.iter_mut() {
            let x = *sample;
            let y = self.alpha * (self.prev_out + x - self.prev_in);
            self.prev_in = x;
            self.prev_out = y;

            self.envelope = 0.99 * self.envelope + 0.01 * y.abs();
            let gain = (self.envelope / Self::GATE_THRESHOLD).min(1.0);
            *sample = y * gain;
        }
        Ok(())
    }
}

// =============================================================================
// Export Macro
// =============================================================================

/// Emit the denoiser ABI exports for an engine type.
///
/// ```rust,ignore
/// dtln_guest::export_denoiser!(dtln_guest::HighPassGate);
/// ```
#[macro_export]
macro_rules! export_denoiser {
    ($engine:ty) => {
        static DTLN_REGISTRY: ::std::sync::Mutex<$crate::InstanceRegistry<$engine>> =
            ::std::sync::Mutex::new($crate::InstanceRegistry::new());

        fn dtln_registry(
        ) -> ::std::sync::MutexGuard<'static, $crate::InstanceRegistry<$engine>> {
            DTLN_REGISTRY
                .lock()
                .unwrap_or_else(::std::sync::PoisonError::into_inner)
        }

        #[no_mangle]
        pub extern "C" fn _initialize() {
            dtln_registry().initialize();
        }

        #[no_mangle]
        pub extern "C" fn dtln_create_wasm() -> i32 {
            dtln_registry().create()
        }

        #[no_mangle]
        pub extern "C" fn dtln_get_audio_buffer(handle: i32) -> i32 {
            dtln_registry().buffer_offset(handle)
        }

        #[no_mangle]
        pub extern "C" fn dtln_denoise_wasm(handle: i32) -> i32 {
            dtln_registry().denoise(handle)
        }

        #[no_mangle]
        pub extern "C" fn dtln_destroy_wasm(handle: i32) {
            dtln_registry().destroy(handle)
        }
    };
}
