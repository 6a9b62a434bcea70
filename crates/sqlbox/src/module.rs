//! Compiled engine module.

use std::path::Path;
use std::sync::Arc;

use wasmtime::{Config, Engine, Linker, Module};

use crate::error::{Error, Result};
use crate::host::{HostState, define_imports};

/// A compiled SQLite WebAssembly module, ready to be instantiated.
///
/// Compilation is the expensive step; keep one `SqliteModule` and create as
/// many [`crate::Instance`]s from it as needed. Clones share the compiled
/// code and the import table.
#[derive(Clone)]
pub struct SqliteModule {
    pub(crate) engine: Engine,
    pub(crate) module: Module,
    pub(crate) linker: Arc<Linker<HostState>>,
}

impl std::fmt::Debug for SqliteModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteModule")
            .field("engine", &"<wasmtime::Engine>")
            .field("module", &self.module.name())
            .finish_non_exhaustive()
    }
}

impl SqliteModule {
    /// Compile a module from bytes (binary or text format).
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be compiled or the import
    /// table cannot be built.
    pub fn from_binary(wasm: &[u8]) -> Result<Self> {
        let engine = Self::create_engine()?;
        let module = Module::new(&engine, wasm).map_err(|e| Error::WasmModule(e.to_string()))?;
        Self::with_module(engine, module)
    }

    /// Compile a module from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or compiled.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "Compiling engine module");
        Self::from_binary(&bytes)
    }

    fn create_engine() -> Result<Engine> {
        let config = Config::new();
        Engine::new(&config).map_err(|e| Error::WasmEngine(e.to_string()))
    }

    fn with_module(engine: Engine, module: Module) -> Result<Self> {
        let mut linker = Linker::<HostState>::new(&engine);
        define_imports(&mut linker)
            .map_err(|e| Error::WasmEngine(format!("Failed to define imports: {e}")))?;
        Ok(Self {
            engine,
            module,
            linker: Arc::new(linker),
        })
    }

    /// Names of the functions the module exports.
    #[must_use]
    pub fn exported_functions(&self) -> Vec<String> {
        self.module
            .exports()
            .filter(|e| e.ty().func().is_some())
            .map(|e| e.name().to_string())
            .collect()
    }
}
