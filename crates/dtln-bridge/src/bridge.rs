//! Bridge facade with an explicit module-ready signal.
//!
//! Loading a module (compile, shim installation, instantiation, guest
//! startup) happens off the calling thread. Completion is delivered once
//! through a oneshot channel; until it fires, [`DenoiseBridge::create`]
//! returns [`BridgeError::NotReady`] and the caller retries later.

use std::thread;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lifecycle::Handle;
use crate::runtime::{build_engine, NativeModule};
use crate::shim::{ExecutionContext, ShimReport};
use crate::Block;

enum ModuleState {
    Loading(oneshot::Receiver<Result<NativeModule>>),
    Ready(Box<NativeModule>),
    Failed(String),
}

/// Streaming denoise bridge around one native module.
pub struct DenoiseBridge {
    state: ModuleState,
    config: BridgeConfig,
    context: ExecutionContext,
}

fn load_module(
    config: &BridgeConfig,
    bytes: &[u8],
    context: ExecutionContext,
) -> Result<NativeModule> {
    let engine = build_engine(config)?;
    NativeModule::instantiate(&engine, config, bytes, context)
}

impl DenoiseBridge {
    /// Start loading `wasm` on a loader thread.
    ///
    /// The execution context is resolved here, on the calling thread, so a
    /// bridge spawned inside a [`RealtimeScope`](crate::RealtimeScope) gets
    /// the substitute shims even though loading runs elsewhere.
    pub fn spawn(config: BridgeConfig, wasm: impl Into<Vec<u8>>) -> Result<Self> {
        config.validate()?;
        let context = ExecutionContext::resolve(config.context);
        let bytes = wasm.into();
        let (tx, rx) = oneshot::channel();

        let loader_config = config.clone();
        thread::Builder::new()
            .name("dtln-loader".to_string())
            .spawn(move || {
                let result = load_module(&loader_config, &bytes, context);
                if let Err(ref e) = result {
                    tracing::warn!("native module load failed: {}", e);
                }
                // Receiver gone means the bridge was dropped while loading.
                let _ = tx.send(result);
            })?;

        Ok(Self {
            state: ModuleState::Loading(rx),
            config,
            context,
        })
    }

    /// Load `wasm` on the calling thread; the bridge is ready on return.
    pub fn load(config: BridgeConfig, wasm: &[u8]) -> Result<Self> {
        config.validate()?;
        let context = ExecutionContext::resolve(config.context);
        let module = load_module(&config, wasm, context)?;
        Ok(Self {
            state: ModuleState::Ready(Box::new(module)),
            config,
            context,
        })
    }

    /// Bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Execution context the shims were installed for.
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    fn settle(&mut self, outcome: std::result::Result<Result<NativeModule>, String>) {
        self.state = match outcome {
            Ok(Ok(module)) => ModuleState::Ready(Box::new(module)),
            Ok(Err(e)) => ModuleState::Failed(e.to_string()),
            Err(reason) => ModuleState::Failed(reason),
        };
    }

    /// Check the ready signal without blocking.
    pub fn is_ready(&mut self) -> bool {
        if let ModuleState::Loading(rx) = &mut self.state {
            let outcome = match rx.try_recv() {
                Ok(result) => Ok(result),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Closed) => Err(loader_vanished()),
            };
            self.settle(outcome);
        }
        matches!(self.state, ModuleState::Ready(_))
    }

    /// Wait for the ready signal.
    pub async fn ready(&mut self) -> Result<()> {
        if let ModuleState::Loading(rx) = &mut self.state {
            let outcome = rx.await.map_err(|_| loader_vanished());
            self.settle(outcome);
        }
        self.module_mut().map(|_| ())
    }

    /// Block the calling thread until the ready signal fires.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait_ready(&mut self) -> Result<()> {
        if matches!(self.state, ModuleState::Loading(_)) {
            // blocking_recv consumes the receiver; park a placeholder until it settles.
            let pending =
                std::mem::replace(&mut self.state, ModuleState::Failed(loader_vanished()));
            if let ModuleState::Loading(rx) = pending {
                let outcome = rx.blocking_recv().map_err(|_| loader_vanished());
                self.settle(outcome);
            }
        }
        self.module_mut().map(|_| ())
    }

    fn module_mut(&mut self) -> Result<&mut NativeModule> {
        match &mut self.state {
            ModuleState::Ready(module) => Ok(&mut **module),
            ModuleState::Loading(_) => Err(BridgeError::NotReady),
            ModuleState::Failed(reason) => Err(BridgeError::LoadFailed(reason.clone())),
        }
    }

    /// The loaded module, once ready.
    pub fn module(&self) -> Option<&NativeModule> {
        match &self.state {
            ModuleState::Ready(module) => Some(&**module),
            _ => None,
        }
    }

    /// Create a native instance for a new stream.
    ///
    /// Returns [`BridgeError::NotReady`] until the ready signal has fired.
    pub fn create(&mut self) -> Result<Handle> {
        self.is_ready();
        self.module_mut()?.create()
    }

    /// Destroy a stream's native instance.
    pub fn destroy(&mut self, handle: Handle) {
        match self.module_mut() {
            Ok(module) => module.destroy(handle),
            Err(e) => tracing::warn!(id = handle.id(), "destroy on unloaded bridge: {}", e),
        }
    }

    /// Denoise one block. See [`NativeModule::process`].
    pub fn process(&mut self, handle: &Handle, input: &Block, output: &mut Block) -> Result<()> {
        self.module_mut()?.process(handle, input, output)
    }

    /// Denoise one block given as caller slices of unchecked length.
    pub fn process_slice(
        &mut self,
        handle: &Handle,
        input: &[f32],
        output: &mut [f32],
    ) -> Result<()> {
        self.module_mut()?.process_slice(handle, input, output)
    }

    /// Shim report, once ready.
    pub fn shim_report(&self) -> Option<ShimReport> {
        self.module().map(NativeModule::shim_report)
    }

    /// Handles created and not yet destroyed.
    pub fn live_instances(&self) -> usize {
        self.module().map_or(0, NativeModule::live_instances)
    }
}

fn loader_vanished() -> String {
    "loader thread exited without signalling".to_string()
}
