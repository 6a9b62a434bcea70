//! Store state and the import table the engine is linked against.

use wasmtime::{Caller, Linker, Memory, StoreLimits};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::bridge::VfsTable;
use crate::codes::{SQLITE_MISUSE, SQLITE_OK};
use crate::exec::ExecRegistry;
use crate::handle::{FileId, SandboxPtr, VfsId};
use crate::memory;
use crate::value::{ExecRow, RowEntry};

/// Import module name used by the engine shim.
pub(crate) const IMPORT_MODULE: &str = "imports";

/// Per-instance state held by the wasmtime store.
pub(crate) struct HostState {
    wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) memory: Option<Memory>,
    pub(crate) vfs: VfsTable,
    pub(crate) exec: ExecRegistry,
    /// Number of times the engine has run its OS-layer init hook.
    pub(crate) os_init_calls: u32,
    pub(crate) os_end_calls: u32,
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("vfs", &self.vfs)
            .field("exec", &self.exec)
            .field("os_init_calls", &self.os_init_calls)
            .field("os_end_calls", &self.os_end_calls)
            .finish_non_exhaustive()
    }
}

impl HostState {
    pub(crate) fn new(limits: StoreLimits, inherit_stderr: bool) -> Self {
        let mut wasi = WasiCtxBuilder::new();
        if inherit_stderr {
            wasi.inherit_stderr();
        }
        Self {
            wasi: wasi.build_p1(),
            limits,
            memory: None,
            vfs: VfsTable::default(),
            exec: ExecRegistry::default(),
            os_init_calls: 0,
            os_end_calls: 0,
        }
    }
}

/// Run `op` against the current linear memory and the host state.
///
/// Memory is re-derived on every call since the engine may have grown it.
fn with_memory(
    caller: &mut Caller<'_, HostState>,
    op: impl FnOnce(&mut [u8], &mut HostState) -> i32,
) -> i32 {
    let Some(memory) = caller.data().memory else {
        tracing::error!("engine called an import before its memory was attached");
        return SQLITE_MISUSE;
    };
    let (mem, state) = memory.data_and_store_mut(caller);
    op(mem, state)
}

fn read_exec_row(
    mem: &[u8],
    columns: i32,
    values: SandboxPtr,
    names: SandboxPtr,
) -> crate::Result<ExecRow> {
    let columns = u32::try_from(columns).unwrap_or(0);
    (0..columns)
        .map(|i| {
            let name = memory::read_ptr(mem, names.add(i * 4))?;
            let value = memory::read_ptr(mem, values.add(i * 4))?;
            Ok(RowEntry {
                name: memory::read_c_str(mem, name)?,
                value: memory::read_opt_c_str(mem, value)?,
            })
        })
        .collect()
}

/// Define every import of the engine shim, plus WASI preview 1 for builds
/// that link against it.
pub(crate) fn define_imports(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    wasmtime_wasi::p1::add_to_linker_sync(linker, |s: &mut HostState| &mut s.wasi)?;

    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_os_init",
        |mut caller: Caller<'_, HostState>| -> i32 {
            caller.data_mut().os_init_calls += 1;
            SQLITE_OK
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_os_end",
        |mut caller: Caller<'_, HostState>| -> i32 {
            caller.data_mut().os_end_calls += 1;
            SQLITE_OK
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_exec_callback",
        |mut caller: Caller<'_, HostState>, token: i32, columns: i32, values: i32, names: i32| {
            with_memory(&mut caller, |mem, state| {
                let row = read_exec_row(
                    mem,
                    columns,
                    SandboxPtr::from_raw(values),
                    SandboxPtr::from_raw(names),
                );
                match row {
                    Ok(row) => i32::from(!state.exec.dispatch(token, row)),
                    Err(e) => {
                        tracing::warn!(token, error = %e, "Failed to read exec row");
                        1
                    }
                }
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_close",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32| {
            caller.data_mut().vfs.io_close(VfsId(vfs), FileId(file))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_read",
        |mut caller: Caller<'_, HostState>,
         vfs: i32,
         file: i32,
         buf: i32,
         amount: i32,
         offset: i32| {
            with_memory(&mut caller, |mem, state| {
                state.vfs.io_read(
                    mem,
                    VfsId(vfs),
                    FileId(file),
                    SandboxPtr::from_raw(buf),
                    amount,
                    offset,
                )
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_write",
        |mut caller: Caller<'_, HostState>,
         vfs: i32,
         file: i32,
         buf: i32,
         amount: i32,
         offset: i32| {
            with_memory(&mut caller, |mem, state| {
                state.vfs.io_write(
                    mem,
                    VfsId(vfs),
                    FileId(file),
                    SandboxPtr::from_raw(buf),
                    amount,
                    offset,
                )
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_truncate",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, size: i32| {
            caller.data_mut().vfs.io_truncate(VfsId(vfs), FileId(file), size)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_sync",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, flags: i32| {
            caller.data_mut().vfs.io_sync(VfsId(vfs), FileId(file), flags)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_file_size",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state
                    .vfs
                    .io_file_size(mem, VfsId(vfs), FileId(file), SandboxPtr::from_raw(out))
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_lock",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, level: i32| {
            caller.data_mut().vfs.io_lock(VfsId(vfs), FileId(file), level)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_unlock",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, level: i32| {
            caller.data_mut().vfs.io_unlock(VfsId(vfs), FileId(file), level)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_check_reserved_lock",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state.vfs.io_check_reserved_lock(
                    mem,
                    VfsId(vfs),
                    FileId(file),
                    SandboxPtr::from_raw(out),
                )
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_file_control",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32, op: i32, _arg: i32| {
            caller.data_mut().vfs.io_file_control(VfsId(vfs), FileId(file), op)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_sector_size",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32| {
            caller.data_mut().vfs.io_sector_size(VfsId(vfs), FileId(file))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_io_device_characteristics",
        |mut caller: Caller<'_, HostState>, vfs: i32, file: i32| {
            caller
                .data_mut()
                .vfs
                .io_device_characteristics(VfsId(vfs), FileId(file))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_open",
        |mut caller: Caller<'_, HostState>,
         vfs: i32,
         name: i32,
         out_file: i32,
         flags: i32,
         out_flags: i32| {
            with_memory(&mut caller, |mem, state| {
                state.vfs.vfs_open(
                    mem,
                    VfsId(vfs),
                    SandboxPtr::from_raw(name),
                    SandboxPtr::from_raw(out_file),
                    flags,
                    SandboxPtr::from_raw(out_flags),
                )
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_delete",
        |mut caller: Caller<'_, HostState>, vfs: i32, name: i32, sync_dir: i32| {
            with_memory(&mut caller, |mem, state| {
                state
                    .vfs
                    .vfs_delete(mem, VfsId(vfs), SandboxPtr::from_raw(name), sync_dir)
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_access",
        |mut caller: Caller<'_, HostState>, vfs: i32, name: i32, flags: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state.vfs.vfs_access(
                    mem,
                    VfsId(vfs),
                    SandboxPtr::from_raw(name),
                    flags,
                    SandboxPtr::from_raw(out),
                )
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_full_pathname",
        |mut caller: Caller<'_, HostState>, vfs: i32, name: i32, capacity: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state.vfs.vfs_full_pathname(
                    mem,
                    VfsId(vfs),
                    SandboxPtr::from_raw(name),
                    capacity,
                    SandboxPtr::from_raw(out),
                )
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_randomness",
        |mut caller: Caller<'_, HostState>, vfs: i32, len: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state
                    .vfs
                    .vfs_randomness(mem, VfsId(vfs), len, SandboxPtr::from_raw(out))
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_sleep",
        |mut caller: Caller<'_, HostState>, vfs: i32, micros: i32| {
            caller.data_mut().vfs.vfs_sleep(VfsId(vfs), micros)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_current_time",
        |mut caller: Caller<'_, HostState>, vfs: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state
                    .vfs
                    .vfs_current_time(mem, VfsId(vfs), SandboxPtr::from_raw(out))
            })
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "sqlite3_ext_vfs_get_last_error",
        |mut caller: Caller<'_, HostState>, vfs: i32, capacity: i32, out: i32| {
            with_memory(&mut caller, |mem, state| {
                state
                    .vfs
                    .vfs_get_last_error(mem, VfsId(vfs), capacity, SandboxPtr::from_raw(out))
            })
        },
    )?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_row_decoding() {
        let mut mem = vec![0u8; 256];
        memory::write_c_str(&mut mem, SandboxPtr(100), "id").unwrap();
        memory::write_c_str(&mut mem, SandboxPtr(110), "note").unwrap();
        memory::write_c_str(&mut mem, SandboxPtr(120), "42").unwrap();
        // names at 16, values at 32
        memory::write_u32(&mut mem, SandboxPtr(16), 100).unwrap();
        memory::write_u32(&mut mem, SandboxPtr(20), 110).unwrap();
        memory::write_u32(&mut mem, SandboxPtr(32), 120).unwrap();
        memory::write_u32(&mut mem, SandboxPtr(36), 0).unwrap();

        let row = read_exec_row(&mem, 2, SandboxPtr(32), SandboxPtr(16)).unwrap();
        assert_eq!(
            row,
            vec![
                RowEntry {
                    name: "id".into(),
                    value: Some("42".into())
                },
                RowEntry {
                    name: "note".into(),
                    value: None
                },
            ]
        );
        assert!(read_exec_row(&mem, 0, SandboxPtr(32), SandboxPtr(16)).unwrap().is_empty());
    }
}
