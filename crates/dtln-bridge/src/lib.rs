//! # DTLN Bridge
//!
//! Real-time block-streaming bridge to a DTLN noise-suppression model that
//! runs as a sandboxed WebAssembly module.
//!
//! The model is opaque. The bridge owns three concerns:
//!
//! | Component | Module | Job |
//! |-----------|--------|-----|
//! | Environment shims | [`shim`] | random bytes and a millisecond clock for the guest startup path |
//! | Buffer marshaller | [`marshal`] | copy one block in, run the transform, copy it out |
//! | Lifecycle manager | [`lifecycle`] | create and destroy per-stream native instances |
//!
//! ## Block flow
//!
//! ```text
//! create() -> Handle
//! for each 512-sample block:
//!     offset = audio_buffer(handle)       re-queried every block
//!     memory[offset..] <- input
//!     denoise(handle)                     in place, mutates recurrent state
//!     output <- memory[offset..]
//! destroy(handle)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dtln_bridge::{BridgeConfig, DenoiseBridge, BLOCK_SIZE};
//!
//! let mut bridge = DenoiseBridge::spawn(BridgeConfig::realtime(), wasm_bytes)?;
//! bridge.wait_ready()?;
//!
//! let handle = bridge.create()?;
//! let mut output = [0.0f32; BLOCK_SIZE];
//! bridge.process(&handle, &input, &mut output)?;
//! bridge.destroy(handle);
//! ```
//!
//! ## Features
//!
//! - `wasi` - link WASI preview1 so guests can write diagnostics to stdio

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod marshal;
pub mod processor;
pub mod runtime;
pub mod shim;
pub mod stats;

// Re-export main types
pub use bridge::DenoiseBridge;
pub use config::{AbiNames, BridgeConfig, ContextSelection, ShimCapabilities, WasiCapabilities};
pub use error::{BridgeError, Result};
pub use lifecycle::Handle;
pub use marshal::{check_block, check_block_mut};
pub use processor::{DeferredProcessor, DenoiseResult, ImmediateProcessor};
pub use runtime::{ModuleInfo, NativeModule};
pub use shim::{ClockKind, EntropyKind, ExecutionContext, RealtimeScope, ShimReport};
pub use stats::{LatencyReport, LatencyStats};

/// Samples per block on both sides of the module boundary.
///
/// 32 ms at 16 kHz.
pub const BLOCK_SIZE: usize = 512;

/// Bytes occupied by one block of little-endian `f32` samples.
pub const BLOCK_BYTES: usize = BLOCK_SIZE * std::mem::size_of::<f32>();

/// One block of mono `f32` audio.
pub type Block = [f32; BLOCK_SIZE];
