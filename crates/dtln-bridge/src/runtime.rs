//! Native module runtime using wasmtime.
//!
//! Compiles the denoiser module, links the environment shims (and WASI
//! preview1 for guest diagnostics), instantiates it, runs the guest startup
//! export and resolves the ABI exports once so the per-block path never does
//! a name lookup.

use crate::config::{AbiNames, BridgeConfig, WasiCapabilities};
use crate::error::{BridgeError, Result};
use crate::shim::{self, EnvironmentShim, ExecutionContext, ShimReport};
use crate::{Block, BLOCK_BYTES};

use wasmtime::*;

/// Fuel granted to lifecycle calls when per-block fuel metering is enabled.
const LIFECYCLE_FUEL: u64 = i64::MAX as u64;

/// Host state for the module store.
pub struct BridgeHostState {
    #[cfg(feature = "wasi")]
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
    pub(crate) shim: EnvironmentShim,
}

impl BridgeHostState {
    #[cfg(feature = "wasi")]
    fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

/// Export names present in a module, checked against the ABI.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Exported function names
    pub functions: Vec<String>,
    /// Whether the linear memory export exists
    pub has_memory: bool,
    /// Whether the optional startup export exists
    pub has_initialize: bool,
    /// Required ABI exports that are absent
    pub missing: Vec<String>,
}

impl ModuleInfo {
    /// True when every required export is present.
    pub fn is_complete(&self) -> bool {
        self.has_memory && self.missing.is_empty()
    }
}

/// An instantiated denoiser module with its ABI exports resolved.
pub struct NativeModule {
    pub(crate) store: Store<BridgeHostState>,
    pub(crate) memory: Memory,
    pub(crate) create_fn: TypedFunc<(), i32>,
    pub(crate) audio_buffer_fn: TypedFunc<i32, i32>,
    pub(crate) denoise_fn: TypedFunc<i32, i32>,
    pub(crate) destroy_fn: TypedFunc<i32, ()>,
    pub(crate) block_fuel: Option<u64>,
    pub(crate) live: usize,
}

/// Build a wasmtime engine for `config`.
pub fn build_engine(config: &BridgeConfig) -> Result<Engine> {
    let mut engine_config = Config::new();

    engine_config.cranelift_opt_level(match config.optimization_level {
        0 => OptLevel::None,
        _ => OptLevel::Speed,
    });
    engine_config.wasm_simd(config.enable_simd);

    if config.block_fuel.is_some() {
        engine_config.consume_fuel(true);
    }

    if let Some(ref cache_path) = config.cache_path {
        if let Err(e) = engine_config.cache_config_load(cache_path) {
            tracing::warn!("Failed to load cache config: {}", e);
        }
    }

    Engine::new(&engine_config)
        .map_err(|e| BridgeError::WasmError(format!("engine creation failed: {}", e)))
}

/// List a module's exports and check them against `abi`.
pub fn inspect_module(engine: &Engine, bytes: &[u8], abi: &AbiNames) -> Result<ModuleInfo> {
    let module = Module::new(engine, bytes)
        .map_err(|e| BridgeError::WasmError(format!("module creation failed: {}", e)))?;
    Ok(module_info(&module, abi))
}

fn module_info(module: &Module, abi: &AbiNames) -> ModuleInfo {
    let mut functions = Vec::new();
    let mut has_memory = false;
    for export in module.exports() {
        match export.ty() {
            ExternType::Func(_) => functions.push(export.name().to_string()),
            ExternType::Memory(_) if export.name() == abi.memory => has_memory = true,
            _ => {}
        }
    }
    let missing = abi
        .required_functions()
        .iter()
        .filter(|name| !functions.iter().any(|f| f == *name))
        .map(|name| name.to_string())
        .collect();
    let has_initialize = functions.iter().any(|f| *f == abi.initialize);

    ModuleInfo {
        functions,
        has_memory,
        has_initialize,
        missing,
    }
}

fn build_host_state(
    config: &BridgeConfig,
    context: ExecutionContext,
) -> Result<BridgeHostState> {
    let shim = EnvironmentShim::install(context, &config.shims)?;

    let limits = StoreLimitsBuilder::new()
        .memory_size(config.max_memory)
        .build();

    Ok(BridgeHostState {
        #[cfg(feature = "wasi")]
        preview1: build_wasi(&config.wasi),
        limits,
        shim,
    })
}

#[cfg(feature = "wasi")]
fn build_wasi(caps: &WasiCapabilities) -> wasmtime_wasi::preview1::WasiP1Ctx {
    let mut builder = wasmtime_wasi::WasiCtxBuilder::new();
    if caps.stdout {
        builder.inherit_stdout();
    }
    if caps.stderr {
        builder.inherit_stderr();
    }
    builder.build_p1()
}

#[cfg(not(feature = "wasi"))]
#[allow(dead_code)]
fn build_wasi(_caps: &WasiCapabilities) {}

/// Map a failed guest call to a bridge error.
pub(crate) fn call_error(e: Error) -> BridgeError {
    match e.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => BridgeError::BudgetExceeded,
        _ => BridgeError::Trap(e.to_string()),
    }
}

impl NativeModule {
    /// Compile, link and instantiate `bytes`, then run the guest startup export.
    ///
    /// The environment shims are installed for `context` before the guest
    /// executes a single instruction.
    pub fn instantiate(
        engine: &Engine,
        config: &BridgeConfig,
        bytes: &[u8],
        context: ExecutionContext,
    ) -> Result<Self> {
        config.validate()?;
        let abi = &config.abi;

        let module = Module::new(engine, bytes)
            .map_err(|e| BridgeError::WasmError(format!("module creation failed: {}", e)))?;
        let info = module_info(&module, abi);
        if !info.is_complete() {
            return Err(BridgeError::Abi(format!(
                "memory export present: {}, missing functions: {:?}",
                info.has_memory, info.missing
            )));
        }

        let host_state = build_host_state(config, context)?;
        let mut store = Store::new(engine, host_state);
        store.limiter(|state| &mut state.limits);

        if config.block_fuel.is_some() {
            store
                .set_fuel(LIFECYCLE_FUEL)
                .map_err(|e| BridgeError::WasmError(format!("fuel setup failed: {}", e)))?;
        }

        let mut linker: Linker<BridgeHostState> = Linker::new(engine);
        #[cfg(feature = "wasi")]
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| BridgeError::WasmError(format!("WASI link failed: {}", e)))?;
        shim::register(&mut linker, &abi.env_module, &abi.memory)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| BridgeError::WasmError(format!("instantiation failed: {}", e)))?;

        let memory = instance
            .get_memory(&mut store, &abi.memory)
            .ok_or_else(|| BridgeError::Abi(format!("no '{}' memory export", abi.memory)))?;

        let create_fn = typed_export::<(), i32>(&instance, &mut store, &abi.create)?;
        let audio_buffer_fn = typed_export::<i32, i32>(&instance, &mut store, &abi.audio_buffer)?;
        let denoise_fn = typed_export::<i32, i32>(&instance, &mut store, &abi.denoise)?;
        let destroy_fn = typed_export::<i32, ()>(&instance, &mut store, &abi.destroy)?;

        if info.has_initialize {
            let init = typed_export::<(), ()>(&instance, &mut store, &abi.initialize)?;
            init.call(&mut store, ()).map_err(call_error)?;
        }

        tracing::info!(
            ?context,
            memory_bytes = memory.data_size(&store),
            "native module ready"
        );

        Ok(Self {
            store,
            memory,
            create_fn,
            audio_buffer_fn,
            denoise_fn,
            destroy_fn,
            block_fuel: config.block_fuel,
            live: 0,
        })
    }

    /// Shim installation and usage report.
    pub fn shim_report(&self) -> ShimReport {
        self.store.data().shim.report()
    }

    /// Current size of the module's linear memory in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Number of instances created and not yet destroyed.
    pub fn live_instances(&self) -> usize {
        self.live
    }

    pub(crate) fn refuel(&mut self, fuel: Option<u64>) -> Result<()> {
        if let Some(fuel) = fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::WasmError(format!("fuel setup failed: {}", e)))?;
        }
        Ok(())
    }

    pub(crate) fn refuel_lifecycle(&mut self) -> Result<()> {
        let fuel = self.block_fuel.map(|_| LIFECYCLE_FUEL);
        self.refuel(fuel)
    }

    /// Copy `input` into linear memory at `offset`.
    pub(crate) fn write_block(&mut self, offset: i32, input: &Block) -> Result<()> {
        let data = self.memory.data_mut(&mut self.store);
        let region = region_mut(data, offset)?;
        for (dst, sample) in region.chunks_exact_mut(4).zip(input.iter()) {
            dst.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }

    /// Copy one block out of linear memory at `offset`.
    pub(crate) fn read_block(&mut self, offset: i32, output: &mut Block) -> Result<()> {
        let data = self.memory.data(&self.store);
        let start = region_start(data.len(), offset)?;
        let region = &data[start..start + BLOCK_BYTES];
        for (sample, src) in output.iter_mut().zip(region.chunks_exact(4)) {
            *sample = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        }
        Ok(())
    }
}

fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<BridgeHostState>,
    name: &str,
) -> Result<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| BridgeError::Abi(format!("export '{}': {}", name, e)))
}

fn region_start(memory_len: usize, offset: i32) -> Result<usize> {
    usize::try_from(offset)
        .ok()
        .filter(|start| {
            start
                .checked_add(BLOCK_BYTES)
                .is_some_and(|end| end <= memory_len)
        })
        .ok_or(BridgeError::RegionOutOfBounds {
            offset: offset as i64,
        })
}

fn region_mut(data: &mut [u8], offset: i32) -> Result<&mut [u8]> {
    let start = region_start(data.len(), offset)?;
    Ok(&mut data[start..start + BLOCK_BYTES])
}
