//! Error types for the bridge crate.

use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// `create` was called before the module-ready signal fired
    #[error("native module is not ready yet")]
    NotReady,

    /// The native module failed to load; the failure is sticky
    #[error("native module failed to load: {0}")]
    LoadFailed(String),

    /// The guest refused to create an instance
    #[error("native instance creation failed with code {0}")]
    InstanceCreation(i32),

    /// A block crossing the caller boundary had the wrong length
    #[error("block size mismatch: expected {expected} samples, got {actual}")]
    BlockSize {
        /// Required samples per block
        expected: usize,
        /// Samples actually supplied
        actual: usize,
    },

    /// The Shared Buffer Region does not fit inside linear memory
    #[error("shared buffer region at offset {offset} is outside linear memory")]
    RegionOutOfBounds {
        /// Byte offset reported by the guest
        offset: i64,
    },

    /// The native processing entry point reported a failure status
    #[error("native denoise returned status {0}")]
    NativeStatus(i32),

    /// The per-block fuel budget ran out before the block finished
    #[error("per-block execution budget exceeded")]
    BudgetExceeded,

    /// The guest trapped
    #[error("native trap: {0}")]
    Trap(String),

    /// The module does not provide the expected ABI
    #[error("ABI mismatch: {0}")]
    Abi(String),

    /// An environment primitive has neither a native nor a substitute source
    #[error("environment shim unavailable: {0}")]
    ShimUnavailable(String),

    /// WebAssembly engine error
    #[error("WASM error: {0}")]
    WasmError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The stream processor worker is gone
    #[error("processor worker stopped: {0}")]
    ProcessorStopped(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
