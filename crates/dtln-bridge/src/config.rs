//! Configuration for the denoise bridge.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::BLOCK_SIZE;

/// Substitute primitives the shim layer may install on a restricted
/// real-time thread.
///
/// A host context always uses the native sources. On the real-time thread a
/// denied substitute leaves the primitive with no source at all, and module
/// loading fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimCapabilities {
    /// Allow the guest's random-bytes import
    pub random: bool,

    /// Allow the guest's millisecond clock import
    pub clocks: bool,
}

impl Default for ShimCapabilities {
    fn default() -> Self {
        Self {
            random: true,
            clocks: true,
        }
    }
}

impl ShimCapabilities {
    /// Deny every primitive
    pub fn none() -> Self {
        Self {
            random: false,
            clocks: false,
        }
    }

    /// Builder: enable random
    pub fn random(mut self, allow: bool) -> Self {
        self.random = allow;
        self
    }

    /// Builder: enable clocks
    pub fn clocks(mut self, allow: bool) -> Self {
        self.clocks = allow;
        self
    }
}

/// WASI grants for guest diagnostics. Deny-by-default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WasiCapabilities {
    /// Allow the guest to write to stdout
    pub stdout: bool,

    /// Allow the guest to write to stderr
    pub stderr: bool,
}

impl WasiCapabilities {
    /// Create capabilities with nothing allowed
    pub fn none() -> Self {
        Self::default()
    }

    /// Stdout and stderr inherited from the host
    pub fn with_stdio() -> Self {
        Self {
            stdout: true,
            stderr: true,
        }
    }
}

/// How the bridge decides which execution context it runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSelection {
    /// Detect from the thread that spawns the bridge
    #[default]
    Auto,
    /// Always treat as a general-purpose host context
    Host,
    /// Always treat as the restricted real-time thread
    RestrictedRealtime,
}

/// Export and import names making up the native module ABI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbiNames {
    /// Linear memory export
    pub memory: String,
    /// Optional guest startup export
    pub initialize: String,
    /// Instance creation export
    pub create: String,
    /// Shared Buffer Region query export
    pub audio_buffer: String,
    /// In-place processing export
    pub denoise: String,
    /// Instance release export
    pub destroy: String,
    /// Import module the shim functions are registered under
    pub env_module: String,
}

impl Default for AbiNames {
    fn default() -> Self {
        Self {
            memory: "memory".to_string(),
            initialize: "_initialize".to_string(),
            create: "dtln_create_wasm".to_string(),
            audio_buffer: "dtln_get_audio_buffer".to_string(),
            denoise: "dtln_denoise_wasm".to_string(),
            destroy: "dtln_destroy_wasm".to_string(),
            env_module: "dtln_env".to_string(),
        }
    }
}

impl AbiNames {
    /// Required function exports, in lifecycle order.
    pub fn required_functions(&self) -> [&str; 4] {
        [&self.create, &self.audio_buffer, &self.denoise, &self.destroy]
    }
}

/// Configuration for the bridge runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Environment shim grants
    pub shims: ShimCapabilities,

    /// WASI grants
    pub wasi: WasiCapabilities,

    /// Execution context selection
    pub context: ContextSelection,

    /// Module ABI names
    pub abi: AbiNames,

    /// Maximum linear memory in bytes (default = 64MB)
    pub max_memory: usize,

    /// Fuel granted to each block; exhausting it fails that block
    pub block_fuel: Option<u64>,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Cache compiled modules to disk
    pub cache_path: Option<PathBuf>,

    /// Stream sample rate in Hz
    pub sample_rate: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shims: ShimCapabilities::default(),
            wasi: WasiCapabilities::none(),
            context: ContextSelection::Auto,
            abi: AbiNames::default(),
            max_memory: 64 * 1024 * 1024, // 64 MB
            block_fuel: None,
            optimization_level: 2,
            enable_simd: true,
            cache_path: None,
            sample_rate: 16_000,
        }
    }
}

impl BridgeConfig {
    /// Config for an audio callback: restricted context, maximum optimization
    pub fn realtime() -> Self {
        Self {
            context: ContextSelection::RestrictedRealtime,
            optimization_level: 3,
            ..Default::default()
        }
    }

    /// Config for development/debugging
    pub fn development() -> Self {
        Self {
            wasi: WasiCapabilities::with_stdio(),
            context: ContextSelection::Host,
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BridgeError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BridgeError::ConfigError(
                "sample_rate must be non-zero".to_string(),
            ));
        }
        if self.block_fuel == Some(0) {
            return Err(BridgeError::ConfigError(
                "block_fuel must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Wall-clock time available to process one block.
    pub fn block_budget(&self) -> Duration {
        Duration::from_nanos(BLOCK_SIZE as u64 * 1_000_000_000 / u64::from(self.sample_rate.max(1)))
    }

    /// Builder: set shim capabilities
    pub fn shims(mut self, shims: ShimCapabilities) -> Self {
        self.shims = shims;
        self
    }

    /// Builder: set execution context selection
    pub fn context(mut self, context: ContextSelection) -> Self {
        self.context = context;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set per-block fuel
    pub fn block_fuel(mut self, fuel: u64) -> Self {
        self.block_fuel = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Builder: set sample rate
    pub fn sample_rate(mut self, hz: u32) -> Self {
        self.sample_rate = hz;
        self
    }
}
