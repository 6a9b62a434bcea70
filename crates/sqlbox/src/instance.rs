//! Instantiation, the engine's export table and raw memory access.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use sqlbox_vfs::{MemoryVfs, Vfs};
use wasmtime::{Memory, Store, StoreLimitsBuilder, TypedFunc, WasmParams, WasmResults};

use crate::bridge::MAX_VFS;
use crate::codes::{SQLITE_BUSY, SQLITE_ERROR, SQLITE_NOMEM, SQLITE_OK};
use crate::error::{Error, Result, SqliteError};
use crate::handle::{DbPtr, SandboxPtr, VfsId};
use crate::host::HostState;
use crate::memory;
use crate::module::SqliteModule;

/// Name of the VFS registered when the builder is given none.
pub const DEFAULT_VFS_NAME: &str = "memory";

/// Resource limits applied to each instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum size of the engine's linear memory in bytes.
    pub max_memory_bytes: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: Some(256 * 1024 * 1024), // 256 MB
        }
    }
}

impl ResourceLimits {
    /// No limits at all.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: None,
        }
    }
}

/// Typed handles to every engine export the host calls.
pub(crate) struct Exports {
    pub(crate) initialize: TypedFunc<(), i32>,
    pub(crate) shutdown: TypedFunc<(), i32>,
    pub(crate) libversion: TypedFunc<(), i32>,
    pub(crate) malloc: TypedFunc<i32, i32>,
    pub(crate) free: TypedFunc<i32, ()>,

    pub(crate) open_v2: TypedFunc<(i32, i32, i32, i32), i32>,
    pub(crate) close: TypedFunc<i32, i32>,
    pub(crate) close_v2: TypedFunc<i32, i32>,
    pub(crate) errcode: TypedFunc<i32, i32>,
    pub(crate) extended_errcode: TypedFunc<i32, i32>,
    pub(crate) errmsg: TypedFunc<i32, i32>,
    pub(crate) changes: TypedFunc<i32, i32>,
    pub(crate) last_insert_rowid: TypedFunc<i32, i64>,
    pub(crate) get_autocommit: TypedFunc<i32, i32>,
    pub(crate) serialize: TypedFunc<(i32, i32, i32, i32), i32>,
    pub(crate) deserialize: TypedFunc<(i32, i32, i32, i64, i64, i32), i32>,

    pub(crate) prepare_v2: TypedFunc<(i32, i32, i32, i32, i32), i32>,
    pub(crate) finalize: TypedFunc<i32, i32>,
    pub(crate) reset: TypedFunc<i32, i32>,
    pub(crate) step: TypedFunc<i32, i32>,
    pub(crate) clear_bindings: TypedFunc<i32, i32>,
    pub(crate) bind_text: TypedFunc<(i32, i32, i32, i32, i32), i32>,
    pub(crate) bind_blob: TypedFunc<(i32, i32, i32, i32, i32), i32>,
    pub(crate) bind_double: TypedFunc<(i32, i32, f64), i32>,
    pub(crate) bind_int: TypedFunc<(i32, i32, i32), i32>,
    pub(crate) bind_int64: TypedFunc<(i32, i32, i64), i32>,
    pub(crate) bind_null: TypedFunc<(i32, i32), i32>,
    pub(crate) bind_parameter_count: TypedFunc<i32, i32>,
    pub(crate) bind_parameter_index: TypedFunc<(i32, i32), i32>,
    pub(crate) column_count: TypedFunc<i32, i32>,
    pub(crate) column_name: TypedFunc<(i32, i32), i32>,
    pub(crate) column_decltype: TypedFunc<(i32, i32), i32>,
    pub(crate) column_type: TypedFunc<(i32, i32), i32>,
    pub(crate) column_text: TypedFunc<(i32, i32), i32>,
    pub(crate) column_blob: TypedFunc<(i32, i32), i32>,
    pub(crate) column_bytes: TypedFunc<(i32, i32), i32>,
    pub(crate) column_double: TypedFunc<(i32, i32), f64>,
    pub(crate) column_int: TypedFunc<(i32, i32), i32>,
    pub(crate) column_int64: TypedFunc<(i32, i32), i64>,

    pub(crate) ext_vfs_register: TypedFunc<(i32, i32, i32), i32>,
    pub(crate) ext_vfs_unregister: TypedFunc<i32, i32>,
    pub(crate) ext_exec: TypedFunc<(i32, i32, i32, i32), i32>,
}

fn export<P: WasmParams, R: WasmResults>(
    instance: &wasmtime::Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<P, R>> {
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| Error::WasmEngine(format!("export `{name}`: {e}")))
}

impl Exports {
    fn resolve(instance: &wasmtime::Instance, store: &mut Store<HostState>) -> Result<Self> {
        Ok(Self {
            initialize: export(instance, store, "sqlite3_initialize")?,
            shutdown: export(instance, store, "sqlite3_shutdown")?,
            libversion: export(instance, store, "sqlite3_libversion")?,
            malloc: export(instance, store, "sqlite3_malloc")?,
            free: export(instance, store, "sqlite3_free")?,
            open_v2: export(instance, store, "sqlite3_open_v2")?,
            close: export(instance, store, "sqlite3_close")?,
            close_v2: export(instance, store, "sqlite3_close_v2")?,
            errcode: export(instance, store, "sqlite3_errcode")?,
            extended_errcode: export(instance, store, "sqlite3_extended_errcode")?,
            errmsg: export(instance, store, "sqlite3_errmsg")?,
            changes: export(instance, store, "sqlite3_changes")?,
            last_insert_rowid: export(instance, store, "sqlite3_last_insert_rowid")?,
            get_autocommit: export(instance, store, "sqlite3_get_autocommit")?,
            serialize: export(instance, store, "sqlite3_serialize")?,
            deserialize: export(instance, store, "sqlite3_deserialize")?,
            prepare_v2: export(instance, store, "sqlite3_prepare_v2")?,
            finalize: export(instance, store, "sqlite3_finalize")?,
            reset: export(instance, store, "sqlite3_reset")?,
            step: export(instance, store, "sqlite3_step")?,
            clear_bindings: export(instance, store, "sqlite3_clear_bindings")?,
            bind_text: export(instance, store, "sqlite3_bind_text")?,
            bind_blob: export(instance, store, "sqlite3_bind_blob")?,
            bind_double: export(instance, store, "sqlite3_bind_double")?,
            bind_int: export(instance, store, "sqlite3_bind_int")?,
            bind_int64: export(instance, store, "sqlite3_bind_int64")?,
            bind_null: export(instance, store, "sqlite3_bind_null")?,
            bind_parameter_count: export(instance, store, "sqlite3_bind_parameter_count")?,
            bind_parameter_index: export(instance, store, "sqlite3_bind_parameter_index")?,
            column_count: export(instance, store, "sqlite3_column_count")?,
            column_name: export(instance, store, "sqlite3_column_name")?,
            column_decltype: export(instance, store, "sqlite3_column_decltype")?,
            column_type: export(instance, store, "sqlite3_column_type")?,
            column_text: export(instance, store, "sqlite3_column_text")?,
            column_blob: export(instance, store, "sqlite3_column_blob")?,
            column_bytes: export(instance, store, "sqlite3_column_bytes")?,
            column_double: export(instance, store, "sqlite3_column_double")?,
            column_int: export(instance, store, "sqlite3_column_int")?,
            column_int64: export(instance, store, "sqlite3_column_int64")?,
            ext_vfs_register: export(instance, store, "sqlite3_ext_vfs_register")?,
            ext_vfs_unregister: export(instance, store, "sqlite3_ext_vfs_unregister")?,
            ext_exec: export(instance, store, "sqlite3_ext_exec")?,
        })
    }
}

/// Sandbox allocations released together when a [`InstanceInner::scoped`]
/// block ends.
#[derive(Debug, Default)]
pub(crate) struct Scope(Vec<SandboxPtr>);

impl Scope {
    pub(crate) fn alloc(&mut self, inner: &mut InstanceInner, size: usize) -> Result<SandboxPtr> {
        let ptr = inner.malloc(size)?;
        self.0.push(ptr);
        Ok(ptr)
    }

    pub(crate) fn c_str(&mut self, inner: &mut InstanceInner, s: &str) -> Result<SandboxPtr> {
        let ptr = inner.alloc_c_str(s)?;
        self.0.push(ptr);
        Ok(ptr)
    }

    pub(crate) fn bytes(&mut self, inner: &mut InstanceInner, data: &[u8]) -> Result<SandboxPtr> {
        let ptr = inner.alloc_bytes(data)?;
        self.0.push(ptr);
        Ok(ptr)
    }
}

/// Everything behind the instance lock.
pub(crate) struct InstanceInner {
    pub(crate) store: Store<HostState>,
    pub(crate) exports: Exports,
    memory: Memory,
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) raw: wasmtime::Instance,
    shut_down: bool,
}

impl InstanceInner {
    /// Call an export, turning a trap into [`Error::Trap`].
    pub(crate) fn call<P: WasmParams, R: WasmResults>(
        &mut self,
        pick: impl FnOnce(&Exports) -> &TypedFunc<P, R>,
        params: P,
    ) -> Result<R> {
        pick(&self.exports)
            .call(&mut self.store, params)
            .map_err(|e| Error::Trap(e.to_string()))
    }

    /// Current linear memory.
    pub(crate) fn mem(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    pub(crate) fn mem_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    /// Allocate with the engine's allocator. A null result is `SQLITE_NOMEM`.
    pub(crate) fn malloc(&mut self, size: usize) -> Result<SandboxPtr> {
        let Ok(n) = i32::try_from(size.max(1)) else {
            return Err(SqliteError::from_code(SQLITE_NOMEM).into());
        };
        let ptr = SandboxPtr::from_raw(self.call(|e| &e.malloc, n)?);
        if ptr.is_null() {
            return Err(SqliteError::from_code(SQLITE_NOMEM).into());
        }
        Ok(ptr)
    }

    /// Release an allocation. Null is ignored.
    pub(crate) fn free(&mut self, ptr: SandboxPtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        self.call(|e| &e.free, ptr.raw())
    }

    /// Allocate `s.len() + 1` bytes and copy `s` in with a terminator.
    pub(crate) fn alloc_c_str(&mut self, s: &str) -> Result<SandboxPtr> {
        let ptr = self.malloc(s.len() + 1)?;
        if let Err(e) = memory::write_c_str(self.mem_mut(), ptr, s) {
            self.free(ptr)?;
            return Err(e);
        }
        Ok(ptr)
    }

    /// Allocate and copy `data`. Empty input still yields a valid address.
    pub(crate) fn alloc_bytes(&mut self, data: &[u8]) -> Result<SandboxPtr> {
        let ptr = self.malloc(data.len())?;
        if let Err(e) = memory::write_bytes(self.mem_mut(), ptr, data) {
            self.free(ptr)?;
            return Err(e);
        }
        Ok(ptr)
    }

    pub(crate) fn read_c_str(&self, ptr: SandboxPtr) -> Result<String> {
        memory::read_c_str(self.mem(), ptr)
    }

    pub(crate) fn read_opt_c_str(&self, ptr: SandboxPtr) -> Result<Option<String>> {
        memory::read_opt_c_str(self.mem(), ptr)
    }

    /// Run `f`, then release every allocation it made through the scope,
    /// on success and on error alike.
    pub(crate) fn scoped<R>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut Scope) -> Result<R>,
    ) -> Result<R> {
        let mut scope = Scope::default();
        let result = f(self, &mut scope);
        let mut released = Ok(());
        for ptr in scope.0.into_iter().rev() {
            if let Err(e) = self.free(ptr) {
                tracing::warn!(ptr = %ptr, error = %e, "Failed to release sandbox allocation");
                released = Err(e);
            }
        }
        let value = result?;
        released.map(|()| value)
    }

    /// The connection's last error, or the default for `rc` when the
    /// connection has none to report.
    pub(crate) fn sqlite_error(&mut self, db: DbPtr, rc: i32) -> Error {
        match self.last_error(db, rc) {
            Ok(e) => Error::Sqlite(e),
            Err(e) => e,
        }
    }

    fn last_error(&mut self, db: DbPtr, rc: i32) -> Result<SqliteError> {
        if db.0.is_null() {
            return Ok(SqliteError::from_code(rc));
        }
        let code = self.call(|e| &e.errcode, db.0.raw())?;
        if code == SQLITE_OK {
            return Ok(SqliteError::from_code(rc));
        }
        let extended = self.call(|e| &e.extended_errcode, db.0.raw())?;
        let message = SandboxPtr::from_raw(self.call(|e| &e.errmsg, db.0.raw())?);
        let message = self
            .read_opt_c_str(message)?
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| crate::codes::default_message(extended).to_string());
        Ok(SqliteError {
            code: crate::codes::ResultCode::from_raw(code),
            extended_code: extended,
            message,
        })
    }

    /// `Ok(())` for `SQLITE_OK`, otherwise the connection's error.
    pub(crate) fn check(&mut self, db: DbPtr, rc: i32) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.sqlite_error(db, rc))
        }
    }

    fn register_vfs(&mut self, name: &str, vfs: Box<dyn Vfs>, make_default: bool) -> Result<VfsId> {
        if !self.store.data().vfs.has_capacity() {
            return Err(SqliteError::with_message(
                SQLITE_NOMEM,
                format!("VFS table is full ({MAX_VFS} registrations)"),
            )
            .into());
        }
        let id = self.scoped(|inner, scope| {
            let name_ptr = scope.c_str(inner, name)?;
            let out = scope.alloc(inner, 4)?;
            let rc = inner.call(
                |e| &e.ext_vfs_register,
                (name_ptr.raw(), i32::from(make_default), out.raw()),
            )?;
            if rc != SQLITE_OK {
                return Err(SqliteError::from_code(rc).into());
            }
            Ok(VfsId(memory::read_i32(inner.mem(), out)?))
        })?;

        if self.store.data_mut().vfs.insert(id, name, vfs).is_err() {
            // The engine and host tables disagree; undo the engine side.
            match self.call(|e| &e.ext_vfs_unregister, id.0) {
                Ok(SQLITE_OK) => {}
                Ok(rc) => tracing::warn!(id = id.0, rc, "Failed to undo VFS registration"),
                Err(e) => tracing::warn!(id = id.0, error = %e, "Failed to undo VFS registration"),
            }
            return Err(SqliteError::misuse(format!(
                "engine assigned VFS id {} which the host cannot hold",
                id.0
            ))
            .into());
        }
        tracing::debug!(name, id = id.0, make_default, "Registered VFS");
        Ok(id)
    }

    fn unregister_vfs(&mut self, id: VfsId) -> Result<()> {
        let table = &self.store.data().vfs;
        if !table.is_registered(id) {
            return Err(
                SqliteError::with_message(SQLITE_ERROR, format!("VFS {} is not registered", id.0))
                    .into(),
            );
        }
        let open = table.open_files(id);
        if open > 0 {
            return Err(SqliteError::with_message(
                SQLITE_BUSY,
                format!("VFS {} still has {open} open files", id.0),
            )
            .into());
        }
        let rc = self.call(|e| &e.ext_vfs_unregister, id.0)?;
        if rc != SQLITE_OK {
            return Err(SqliteError::from_code(rc).into());
        }
        self.store.data_mut().vfs.remove(id);
        tracing::debug!(id = id.0, "Unregistered VFS");
        Ok(())
    }
}

thread_local! {
    /// Instances whose lock this thread currently holds.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// The instance lock, remembered as held by the current thread until
/// dropped.
struct Held<'a> {
    inner: MutexGuard<'a, InstanceInner>,
    key: usize,
}

impl Deref for Held<'_> {
    type Target = InstanceInner;

    fn deref(&self) -> &InstanceInner {
        &self.inner
    }
}

impl DerefMut for Held<'_> {
    fn deref_mut(&mut self) -> &mut InstanceInner {
        &mut self.inner
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        HELD.with_borrow_mut(|held| {
            if let Some(i) = held.iter().rposition(|k| *k == self.key) {
                held.swap_remove(i);
            }
        });
    }
}

fn reentrant_error() -> Error {
    SqliteError::misuse("instance is already in use by this thread").into()
}

/// A live engine instance.
///
/// Each instance has its own linear memory, its own engine-global state
/// and its own VFS registrations. Cloning is cheap and yields another
/// handle to the same instance; calls through any handle are serialized by
/// an internal lock, since the engine is single-threaded.
///
/// Callbacks run by the engine (exec row callbacks, VFS methods) execute
/// while that lock is held. Calls they make into the same instance fail
/// with `SQLITE_MISUSE`, and handles they drop are leaked with a warning.
#[derive(Clone)]
pub struct Instance {
    pub(crate) inner: Arc<Mutex<InstanceInner>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Instance {
    /// Create an instance builder.
    #[must_use]
    pub fn builder() -> InstanceBuilder {
        InstanceBuilder::new()
    }

    /// Instantiate `module` with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if linking or engine initialization fails.
    pub fn new(module: &SqliteModule) -> Result<Self> {
        InstanceBuilder::new().build(module)
    }

    /// Take the instance lock. A thread that already holds it gets a
    /// misuse error instead of deadlocking.
    fn guard(&self) -> Result<Held<'_>> {
        let key = Arc::as_ptr(&self.inner) as usize;
        if HELD.with_borrow(|held| held.contains(&key)) {
            return Err(reentrant_error());
        }
        let inner = self.inner.lock().map_err(|_| Error::Poisoned)?;
        HELD.with_borrow_mut(|held| held.push(key));
        Ok(Held { inner, key })
    }

    /// Run `f` under the instance lock. Fails with `SQLITE_MISUSE` after
    /// [`Instance::shutdown`].
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut InstanceInner) -> Result<R>) -> Result<R> {
        let mut inner = self.guard()?;
        if inner.shut_down {
            return Err(SqliteError::misuse("instance has been shut down").into());
        }
        f(&mut inner)
    }

    /// Like [`Instance::with`] for cleanup paths: does nothing if the lock
    /// is poisoned or the instance is shut down.
    pub(crate) fn with_live<R>(&self, f: impl FnOnce(&mut InstanceInner) -> R) -> Option<R> {
        let mut inner = match self.guard() {
            Ok(inner) => inner,
            Err(Error::Poisoned) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping cleanup from inside an engine callback");
                return None;
            }
        };
        if inner.shut_down {
            return None;
        }
        Some(f(&mut inner))
    }

    /// The engine's version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine traps.
    pub fn libversion(&self) -> Result<String> {
        self.with(|inner| {
            let ptr = SandboxPtr::from_raw(inner.call(|e| &e.libversion, ())?);
            inner.read_c_str(ptr)
        })
    }

    /// Register a VFS with the engine and return its id.
    ///
    /// # Errors
    ///
    /// Fails with `SQLITE_NOMEM` when all registration slots are taken.
    pub fn register_vfs(
        &self,
        name: &str,
        vfs: impl Vfs + 'static,
        make_default: bool,
    ) -> Result<VfsId> {
        self.with(|inner| inner.register_vfs(name, Box::new(vfs), make_default))
    }

    /// Remove a VFS registration.
    ///
    /// # Errors
    ///
    /// Fails with `SQLITE_ERROR` if `id` is not registered (nothing is
    /// changed in that case) and with `SQLITE_BUSY` while files opened
    /// through it are still open.
    pub fn unregister_vfs(&self, id: VfsId) -> Result<()> {
        self.with(|inner| inner.unregister_vfs(id))
    }

    /// Tear down engine-global state. Every later call on this instance
    /// (through any handle) fails with `SQLITE_MISUSE`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if `sqlite3_shutdown` fails; the instance
    /// is unusable either way.
    pub fn shutdown(&self) -> Result<()> {
        self.with(|inner| {
            inner.shut_down = true;
            let rc = inner.call(|e| &e.shutdown, ())?;
            tracing::debug!(rc, "Engine shut down");
            if rc == SQLITE_OK {
                Ok(())
            } else {
                Err(SqliteError::from_code(rc).into())
            }
        })
    }

    /// Whether [`Instance::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        match self.guard() {
            Ok(inner) => inner.shut_down,
            Err(Error::Poisoned) => true,
            // Only reachable from a callback, which means the engine is live.
            Err(_) => false,
        }
    }

    /// Current size of linear memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance lock is poisoned.
    pub fn memory_size(&self) -> Result<usize> {
        self.with(|inner| Ok(inner.mem().len()))
    }
}

/// Raw access to linear memory through the engine's allocator.
///
/// Every address returned by [`Instance::allocate`] or
/// [`Instance::write_c_string`] must be passed to [`Instance::release`]
/// exactly once.
impl Instance {
    /// Allocate `size` bytes (at least one) with the engine's allocator.
    ///
    /// # Errors
    ///
    /// Fails with `SQLITE_NOMEM` if the engine cannot allocate.
    pub fn allocate(&self, size: usize) -> Result<SandboxPtr> {
        self.with(|inner| inner.malloc(size))
    }

    /// Release an allocation. Releasing null does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine traps.
    pub fn release(&self, ptr: SandboxPtr) -> Result<()> {
        self.with(|inner| inner.free(ptr))
    }

    /// Copy `s` into a fresh zero-terminated allocation.
    ///
    /// # Errors
    ///
    /// Fails with `SQLITE_NOMEM` if the engine cannot allocate.
    pub fn write_c_string(&self, s: &str) -> Result<SandboxPtr> {
        self.with(|inner| inner.alloc_c_str(s))
    }

    /// Read the zero-terminated string at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if no terminator is found.
    pub fn read_c_string(&self, ptr: SandboxPtr) -> Result<String> {
        self.with(|inner| inner.read_c_str(ptr))
    }

    /// Read a little-endian `u32` at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] outside linear memory.
    pub fn read_u32(&self, ptr: SandboxPtr) -> Result<u32> {
        self.with(|inner| memory::read_u32(inner.mem(), ptr))
    }

    /// Read a little-endian `f64` at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] outside linear memory.
    pub fn read_f64(&self, ptr: SandboxPtr) -> Result<f64> {
        self.with(|inner| memory::read_f64(inner.mem(), ptr))
    }

    /// Copy `len` bytes out of linear memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] outside linear memory.
    pub fn read_bytes(&self, ptr: SandboxPtr, len: usize) -> Result<Vec<u8>> {
        self.with(|inner| memory::bytes(inner.mem(), ptr, len).map(<[u8]>::to_vec))
    }

    /// Copy `data` into linear memory at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] outside linear memory.
    pub fn write_bytes(&self, ptr: SandboxPtr, data: &[u8]) -> Result<()> {
        self.with(|inner| memory::write_bytes(inner.mem_mut(), ptr, data))
    }
}

struct PendingVfs {
    name: String,
    vfs: Box<dyn Vfs>,
    make_default: bool,
}

/// Builder for [`Instance`].
///
/// ```rust,no_run
/// use sqlbox::{Instance, SqliteModule};
/// use sqlbox_vfs::MemoryVfs;
///
/// # fn main() -> Result<(), sqlbox::Error> {
/// let module = SqliteModule::from_file("sqlite3.wasm")?;
/// let instance = Instance::builder()
///     .with_vfs("mem", MemoryVfs::new())
///     .build(&module)?;
/// # Ok(())
/// # }
/// ```
pub struct InstanceBuilder {
    vfs: Vec<PendingVfs>,
    limits: ResourceLimits,
    inherit_stderr: bool,
}

impl std::fmt::Debug for InstanceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceBuilder")
            .field(
                "vfs",
                &self.vfs.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            )
            .field("limits", &self.limits)
            .field("inherit_stderr", &self.inherit_stderr)
            .finish()
    }
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceBuilder {
    /// A builder with default limits and no VFS configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vfs: Vec::new(),
            limits: ResourceLimits::default(),
            inherit_stderr: false,
        }
    }

    /// Register `vfs` under `name` once the engine is initialized. The
    /// first VFS added this way becomes the default.
    ///
    /// With no VFS configured, a [`MemoryVfs`] named
    /// [`DEFAULT_VFS_NAME`] is registered as the default.
    #[must_use]
    pub fn with_vfs(self, name: impl Into<String>, vfs: impl Vfs + 'static) -> Self {
        let make_default = self.vfs.is_empty();
        self.with_vfs_options(name, vfs, make_default)
    }

    /// Register `vfs` under `name`, choosing explicitly whether it becomes
    /// the default.
    #[must_use]
    pub fn with_vfs_options(
        mut self,
        name: impl Into<String>,
        vfs: impl Vfs + 'static,
        make_default: bool,
    ) -> Self {
        self.vfs.push(PendingVfs {
            name: name.into(),
            vfs: Box::new(vfs),
            make_default,
        });
        self
    }

    /// Set resource limits.
    #[must_use]
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Forward the engine's stderr (if it writes any through WASI) to the
    /// host's stderr.
    #[must_use]
    pub fn inherit_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }

    /// Instantiate and initialize synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WasmModule`] if linking fails, [`Error::WasmEngine`]
    /// if a required export is missing, [`Error::Initialization`] if
    /// `sqlite3_initialize` fails, or an engine error if a VFS cannot be
    /// registered.
    pub fn build(self, module: &SqliteModule) -> Result<Instance> {
        let limits = match self.limits.max_memory_bytes {
            Some(max) => StoreLimitsBuilder::new().memory_size(max).build(),
            None => StoreLimitsBuilder::new().build(),
        };
        let mut store = Store::new(&module.engine, HostState::new(limits, self.inherit_stderr));
        store.limiter(|s| &mut s.limits);

        let raw = module
            .linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| Error::WasmModule(e.to_string()))?;
        let memory = raw
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::WasmEngine("module does not export `memory`".to_string()))?;
        store.data_mut().memory = Some(memory);

        // WASI reactor builds need their constructors run first.
        if let Ok(init) = raw.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())
                .map_err(|e| Error::Trap(e.to_string()))?;
        }

        let exports = Exports::resolve(&raw, &mut store)?;
        let rc = exports
            .initialize
            .call(&mut store, ())
            .map_err(|e| Error::Trap(e.to_string()))?;
        if rc != SQLITE_OK {
            return Err(Error::Initialization(SqliteError::from_code(rc)));
        }

        let mut inner = InstanceInner {
            store,
            exports,
            memory,
            raw,
            shut_down: false,
        };

        let mut pending = self.vfs;
        if pending.is_empty() {
            pending.push(PendingVfs {
                name: DEFAULT_VFS_NAME.to_string(),
                vfs: Box::new(MemoryVfs::new()),
                make_default: true,
            });
        }
        for vfs in pending {
            inner.register_vfs(&vfs.name, vfs.vfs, vfs.make_default)?;
        }

        tracing::debug!(
            memory_bytes = inner.mem().len(),
            vfs = ?inner.store.data().vfs,
            "Instance ready"
        );
        Ok(Instance {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Instantiate on a blocking worker thread. The result is identical to
    /// [`InstanceBuilder::build`].
    ///
    /// # Errors
    ///
    /// Same as [`InstanceBuilder::build`], plus [`Error::Join`] if the
    /// worker task panics or is cancelled.
    pub async fn build_async(self, module: &SqliteModule) -> Result<Instance> {
        let module = module.clone();
        tokio::task::spawn_blocking(move || self.build(&module))
            .await
            .map_err(|e| Error::Join(e.to_string()))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ResultCode;
    use crate::codes::ioerr;
    use crate::testing::{
        call_stub, live_allocations, stub_instance, stub_module, stub_module_with_init,
    };
    use sqlbox_vfs::OpenFlags;

    fn os_calls(instance: &Instance) -> (u32, u32) {
        let inner = instance.inner.lock().unwrap();
        let state = inner.store.data();
        (state.os_init_calls, state.os_end_calls)
    }

    #[test]
    fn test_instantiate_initializes_once() {
        let instance = stub_instance();
        assert_eq!(os_calls(&instance), (1, 0));
        assert_eq!(instance.libversion().unwrap(), "3.46.0-stub");
        assert_eq!(live_allocations(&instance), 0);
    }

    #[test]
    fn test_initialization_failure() {
        let err = Instance::new(&stub_module_with_init(1)).unwrap_err();
        match err {
            Error::Initialization(e) => {
                assert_eq!(e.code, ResultCode::Error);
                assert_eq!(e.message, "SQL logic error");
            }
            other => panic!("expected initialization error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_exports_are_reported() {
        let module =
            SqliteModule::from_binary(br#"(module (memory (export "memory") 1))"#).unwrap();
        let err = Instance::new(&module).unwrap_err();
        assert!(
            matches!(err, Error::WasmEngine(ref m) if m.contains("sqlite3_initialize")),
            "{err}"
        );

        let module = SqliteModule::from_binary(b"(module)").unwrap();
        let err = Instance::new(&module).unwrap_err();
        assert!(matches!(err, Error::WasmEngine(ref m) if m.contains("memory")), "{err}");
    }

    #[test]
    fn test_memory_limit_applies_to_initial_memory() {
        let err = Instance::builder()
            .with_resource_limits(ResourceLimits {
                max_memory_bytes: Some(64 * 1024),
            })
            .build(&stub_module())
            .unwrap_err();
        assert!(matches!(err, Error::WasmModule(_)), "{err}");

        let instance = Instance::builder()
            .with_resource_limits(ResourceLimits::unlimited())
            .build(&stub_module())
            .unwrap();
        assert_eq!(instance.memory_size().unwrap(), 4 * 65536);
    }

    #[test]
    fn test_resource_limits_from_json() {
        let limits: ResourceLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits, ResourceLimits::default());
        let limits: ResourceLimits = serde_json::from_str(r#"{"max_memory_bytes": null}"#).unwrap();
        assert_eq!(limits, ResourceLimits::unlimited());
    }

    #[test]
    fn test_marshaling_round_trips() {
        let instance = stub_instance();

        let s = instance.write_c_string("héllo wörld").unwrap();
        assert_eq!(instance.read_c_string(s).unwrap(), "héllo wörld");

        let buf = instance.allocate(16).unwrap();
        instance.write_bytes(buf, &2.5f64.to_le_bytes()).unwrap();
        instance.write_bytes(buf.add(8), &0xdead_beefu32.to_le_bytes()).unwrap();
        assert_eq!(instance.read_f64(buf).unwrap(), 2.5);
        assert_eq!(instance.read_u32(buf.add(8)).unwrap(), 0xdead_beef);
        assert_eq!(instance.read_bytes(buf.add(8), 2).unwrap(), vec![0xef, 0xbe]);
        assert_eq!(live_allocations(&instance), 2);

        instance.release(s).unwrap();
        instance.release(buf).unwrap();
        instance.release(SandboxPtr::NULL).unwrap();
        assert_eq!(live_allocations(&instance), 0);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let instance = stub_instance();
        let err = instance
            .read_bytes(SandboxPtr(u32::MAX - 2), 8)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { len: 8, .. }));
        assert!(instance.write_bytes(SandboxPtr(4 * 65536), &[1]).is_err());
    }

    #[test]
    fn test_allocation_failure_is_nomem() {
        let instance = stub_instance();
        let err = instance.allocate(1 << 20).unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::NoMem));
    }

    #[test]
    fn test_vfs_table_capacity() {
        let instance = stub_instance();
        // The default VFS already holds one slot.
        let ids: Vec<VfsId> = (1..MAX_VFS)
            .map(|i| {
                instance
                    .register_vfs(&format!("vfs{i}"), MemoryVfs::new(), false)
                    .unwrap()
            })
            .collect();
        assert_eq!(ids.len(), MAX_VFS - 1);

        let err = instance
            .register_vfs("one-too-many", MemoryVfs::new(), false)
            .unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::NoMem));

        instance.unregister_vfs(ids[4]).unwrap();
        let reused = instance
            .register_vfs("again", MemoryVfs::new(), false)
            .unwrap();
        assert_eq!(reused, ids[4]);
        assert_eq!(live_allocations(&instance), 0);
    }

    #[test]
    fn test_conflicting_registration_is_undone() {
        let instance = stub_instance();
        // Occupy the host slot the engine will hand out next.
        {
            let mut inner = instance.inner.lock().unwrap();
            let table = &mut inner.store.data_mut().vfs;
            assert!(table.insert(VfsId(1), "squatter", Box::new(MemoryVfs::new())).is_ok());
        }
        let err = instance
            .register_vfs("late", MemoryVfs::new(), false)
            .unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::Misuse));

        // The engine released id 1 again, so it is reused once the host
        // slot is free.
        instance.inner.lock().unwrap().store.data_mut().vfs.remove(VfsId(1));
        let id = instance
            .register_vfs("late", MemoryVfs::new(), false)
            .unwrap();
        assert_eq!(id, VfsId(1));
        assert_eq!(live_allocations(&instance), 0);
    }

    #[test]
    fn test_unregister_unknown_vfs() {
        let instance = stub_instance();
        for id in [VfsId(17), VfsId(-1), VfsId(99)] {
            let err = instance.unregister_vfs(id).unwrap_err();
            assert_eq!(err.code(), Some(ResultCode::Error));
        }
    }

    /// Open `name` through the bridge and return the file id.
    fn open_file(instance: &Instance, vfs: VfsId, name: &str) -> i32 {
        let name = instance.write_c_string(name).unwrap();
        let out = instance.allocate(8).unwrap();
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB;
        let rc: i32 = call_stub(
            instance,
            "stub_vfs_open",
            (vfs.0, name.raw(), out.raw(), flags.bits() as i32, out.add(4).raw()),
        );
        assert_eq!(rc, 0);
        let file = instance.read_u32(out).unwrap() as i32;
        assert_ne!(file, 0);
        instance.release(name).unwrap();
        instance.release(out).unwrap();
        file
    }

    #[test]
    fn test_unregister_waits_for_open_files() {
        let instance = stub_instance();
        let vfs = instance
            .register_vfs("scratch", MemoryVfs::new(), false)
            .unwrap();
        let file = open_file(&instance, vfs, "busy.db");

        let err = instance.unregister_vfs(vfs).unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::Busy));

        let rc: i32 = call_stub(&instance, "stub_io_close", (vfs.0, file));
        assert_eq!(rc, 0);
        instance.unregister_vfs(vfs).unwrap();
    }

    #[test]
    fn test_file_io_through_imports() {
        let storage = MemoryVfs::new();
        let instance = Instance::builder()
            .with_vfs("mem", storage.clone())
            .build(&stub_module())
            .unwrap();
        let vfs = VfsId(0);
        let file = open_file(&instance, vfs, "data.db");

        let src = instance.write_c_string("hello").unwrap();
        let rc: i32 = call_stub(&instance, "stub_io_write", (vfs.0, file, src.raw(), 5, 0));
        assert_eq!(rc, 0);
        assert_eq!(storage.read_file("data.db").unwrap(), b"hello");

        let dst = instance.allocate(10).unwrap();
        instance.write_bytes(dst, &[0xff; 10]).unwrap();
        let rc: i32 = call_stub(&instance, "stub_io_read", (vfs.0, file, dst.raw(), 10, 0));
        assert_eq!(rc, ioerr::SHORT_READ);
        assert_eq!(instance.read_bytes(dst, 10).unwrap(), b"hello\0\0\0\0\0");

        let rc: i32 = call_stub(&instance, "stub_io_close", (vfs.0, file));
        assert_eq!(rc, 0);
        // A closed id is an I/O error, not a trap.
        let rc: i32 = call_stub(&instance, "stub_io_read", (vfs.0, file, dst.raw(), 1, 0));
        assert_eq!(rc, ioerr::READ);

        let msg = instance.allocate(64).unwrap();
        let rc: i32 = call_stub(&instance, "stub_vfs_last_error", (vfs.0, 64, msg.raw()));
        assert_eq!(rc, ioerr::READ);
        assert!(instance.read_c_string(msg).unwrap().contains("not open"));
    }

    #[test]
    fn test_randomness_through_imports() {
        let instance = stub_instance();
        let buf = instance.allocate(32).unwrap();
        instance.write_bytes(buf, &[0; 32]).unwrap();
        let n: i32 = call_stub(&instance, "stub_vfs_randomness", (0, 32, buf.raw()));
        assert_eq!(n, 32);
        assert_ne!(instance.read_bytes(buf, 32).unwrap(), vec![0; 32]);
    }

    #[test]
    fn test_shutdown_guards_later_calls() {
        let instance = stub_instance();
        let other = instance.clone();
        instance.shutdown().unwrap();
        assert_eq!(os_calls(&instance), (1, 1));
        assert!(other.is_shut_down());

        let err = other.libversion().unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::Misuse));
        assert!(instance.shutdown().is_err());
        assert!(instance.allocate(4).is_err());
    }

    #[tokio::test]
    async fn test_build_async_matches_sync() {
        let module = stub_module();
        let instance = Instance::builder().build_async(&module).await.unwrap();
        assert_eq!(instance.libversion().unwrap(), "3.46.0-stub");
        assert_eq!(os_calls(&instance), (1, 0));
    }
}
