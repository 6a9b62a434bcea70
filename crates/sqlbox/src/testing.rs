//! A hand-written stand-in for the engine, used by unit tests.
//!
//! The stub exports the same entry points as a real engine build with just
//! enough behavior to exercise the host: a bump allocator that counts live
//! allocations, one fake connection, statements that remember their last
//! binding and return it as a single-column row, a 32-slot VFS table, and
//! an exec that reports two fixed rows. `stub_*` exports forward to the VFS
//! imports so the bridge can be driven through real wasm calls.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use wasmtime::{WasmParams, WasmResults};

use crate::instance::Instance;
use crate::module::SqliteModule;

/// Fake connection address handed out by `sqlite3_open_v2`.
pub(crate) const STUB_DB: u32 = 2048;

pub(crate) fn stub_wat(init_rc: i32) -> String {
    format!(
        r#"(module
  (import "imports" "sqlite3_ext_os_init" (func $os_init (result i32)))
  (import "imports" "sqlite3_ext_os_end" (func $os_end (result i32)))
  (import "imports" "sqlite3_ext_exec_callback" (func $exec_cb (param i32 i32 i32 i32) (result i32)))
  (import "imports" "sqlite3_ext_vfs_open" (func $vfs_open (param i32 i32 i32 i32 i32) (result i32)))
  (import "imports" "sqlite3_ext_io_write" (func $io_write (param i32 i32 i32 i32 i32) (result i32)))
  (import "imports" "sqlite3_ext_io_read" (func $io_read (param i32 i32 i32 i32 i32) (result i32)))
  (import "imports" "sqlite3_ext_io_close" (func $io_close (param i32 i32) (result i32)))
  (import "imports" "sqlite3_ext_vfs_randomness" (func $vfs_randomness (param i32 i32 i32) (result i32)))
  (import "imports" "sqlite3_ext_vfs_get_last_error" (func $vfs_last_error (param i32 i32 i32) (result i32)))

  (memory (export "memory") 4)

  (global $heap (mut i32) (i32.const 4096))
  (global $live (mut i32) (i32.const 0))
  (global $last_rc (mut i32) (i32.const 0))
  (global $open_stmts (mut i32) (i32.const 0))
  (global $deser_flags (mut i32) (i32.const -1))

  (data (i32.const 1024) "3.46.0-stub\00")
  (data (i32.const 1040) "stub failure\00")
  (data (i32.const 1056) "value\00")
  (data (i32.const 1064) "a\00b\001\002\00x\00")
  (data (i32.const 1080) "query aborted\00")
  (data (i32.const 1100) "SQLite format 3\00stub")
  (data (i32.const 1200) "\28\04\00\00\2a\04\00\00")
  (data (i32.const 1208) "\2c\04\00\00\00\00\00\00")
  (data (i32.const 1216) "\2e\04\00\00\30\04\00\00")

  ;; allocator

  (func $malloc (export "sqlite3_malloc") (param $n i32) (result i32)
    (local $p i32)
    (if (i32.le_s (local.get $n) (i32.const 0)) (then (return (i32.const 0))))
    (local.set $p (global.get $heap))
    (global.set $heap
      (i32.and (i32.add (i32.add (local.get $p) (local.get $n)) (i32.const 7)) (i32.const -8)))
    (if (i32.gt_u (global.get $heap) (i32.const 262144))
      (then (global.set $heap (local.get $p)) (return (i32.const 0))))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (local.get $p))

  (func $free (export "sqlite3_free") (param $p i32)
    (if (local.get $p)
      (then (global.set $live (i32.sub (global.get $live) (i32.const 1))))))

  ;; library

  (func (export "sqlite3_initialize") (result i32)
    (drop (call $os_init))
    (i32.const {init_rc}))

  (func (export "sqlite3_shutdown") (result i32)
    (drop (call $os_end))
    (i32.const 0))

  (func (export "sqlite3_libversion") (result i32)
    (i32.const 1024))

  ;; connections

  (func (export "sqlite3_open_v2") (param $name i32) (param $pdb i32) (param $flags i32) (param $vfs i32) (result i32)
    (if (i32.eq (i32.load8_u (local.get $name)) (i32.const 120))
      (then
        (i32.store (local.get $pdb) (i32.const 0))
        (global.set $last_rc (i32.const 14))
        (return (i32.const 14))))
    (i32.store (local.get $pdb) (i32.const {db}))
    (global.set $last_rc (i32.const 0))
    (i32.const 0))

  (func (export "sqlite3_close") (param $db i32) (result i32)
    (if (global.get $open_stmts)
      (then (global.set $last_rc (i32.const 5)) (return (i32.const 5))))
    (i32.const 0))

  (func (export "sqlite3_close_v2") (param $db i32) (result i32)
    (i32.const 0))

  (func (export "sqlite3_errcode") (param $db i32) (result i32)
    (global.get $last_rc))

  (func (export "sqlite3_extended_errcode") (param $db i32) (result i32)
    (global.get $last_rc))

  (func (export "sqlite3_errmsg") (param $db i32) (result i32)
    (i32.const 1040))

  (func (export "sqlite3_changes") (param $db i32) (result i32)
    (i32.const 3))

  (func (export "sqlite3_last_insert_rowid") (param $db i32) (result i64)
    (i64.const 42))

  (func (export "sqlite3_get_autocommit") (param $db i32) (result i32)
    (i32.const 1))

  (func (export "sqlite3_serialize") (param $db i32) (param $schema i32) (param $psize i32) (param $flags i32) (result i32)
    (local $p i32)
    (if (i32.ne (i32.load8_u (local.get $schema)) (i32.const 109))
      (then (return (i32.const 0))))
    (i64.store (local.get $psize) (i64.const 20))
    (if (i32.and (local.get $flags) (i32.const 1))
      (then (return (i32.const 1100))))
    (local.set $p (call $malloc (i32.const 20)))
    (memory.copy (local.get $p) (i32.const 1100) (i32.const 20))
    (local.get $p))

  (func (export "sqlite3_deserialize") (param $db i32) (param $schema i32) (param $data i32) (param $szdb i64) (param $szbuf i64) (param $flags i32) (result i32)
    (global.set $deser_flags (local.get $flags))
    (if (i64.lt_s (local.get $szdb) (i64.const 16))
      (then (global.set $last_rc (i32.const 26)) (return (i32.const 26))))
    (i32.const 0))

  ;; statements: +0 stepped, +4 type, +8 int64, +16 double, +24 copy, +28 length

  (func (export "sqlite3_prepare_v2") (param $db i32) (param $sql i32) (param $n i32) (param $pp i32) (param $tail i32) (result i32)
    (local $p i32) (local $c i32) (local $stmt i32)
    (local.set $p (local.get $sql))
    (block $found
      (loop $skip
        (local.set $c (i32.load8_u (local.get $p)))
        (if (i32.eqz (local.get $c))
          (then
            (i32.store (local.get $pp) (i32.const 0))
            (i32.store (local.get $tail) (local.get $p))
            (global.set $last_rc (i32.const 0))
            (return (i32.const 0))))
        (br_if $found
          (i32.and
            (i32.gt_u (local.get $c) (i32.const 32))
            (i32.ne (local.get $c) (i32.const 59))))
        (local.set $p (i32.add (local.get $p) (i32.const 1)))
        (br $skip)))
    (if (i32.eq (local.get $c) (i32.const 88))
      (then
        (i32.store (local.get $pp) (i32.const 0))
        (global.set $last_rc (i32.const 1))
        (return (i32.const 1))))
    (block $end
      (loop $scan
        (local.set $c (i32.load8_u (local.get $p)))
        (br_if $end (i32.eqz (local.get $c)))
        (local.set $p (i32.add (local.get $p) (i32.const 1)))
        (br_if $end (i32.eq (local.get $c) (i32.const 59)))
        (br $scan)))
    (local.set $stmt (call $malloc (i32.const 32)))
    (if (i32.eqz (local.get $stmt))
      (then (global.set $last_rc (i32.const 7)) (return (i32.const 7))))
    (memory.fill (local.get $stmt) (i32.const 0) (i32.const 32))
    (i32.store (local.get $pp) (local.get $stmt))
    (i32.store (local.get $tail) (local.get $p))
    (global.set $open_stmts (i32.add (global.get $open_stmts) (i32.const 1)))
    (global.set $last_rc (i32.const 0))
    (i32.const 0))

  (func (export "sqlite3_finalize") (param $s i32) (result i32)
    (if (i32.eqz (local.get $s)) (then (return (i32.const 0))))
    (call $free (i32.load offset=24 (local.get $s)))
    (call $free (local.get $s))
    (global.set $open_stmts (i32.sub (global.get $open_stmts) (i32.const 1)))
    (i32.const 0))

  (func (export "sqlite3_reset") (param $s i32) (result i32)
    (i32.store (local.get $s) (i32.const 0))
    (i32.const 0))

  (func (export "sqlite3_step") (param $s i32) (result i32)
    (if (i32.load (local.get $s)) (then (return (i32.const 101))))
    (i32.store (local.get $s) (i32.const 1))
    (i32.const 100))

  (func $range (result i32)
    (global.set $last_rc (i32.const 25))
    (i32.const 25))

  (func $set_type (param $s i32) (param $t i32)
    (call $free (i32.load offset=24 (local.get $s)))
    (i32.store offset=24 (local.get $s) (i32.const 0))
    (i32.store offset=28 (local.get $s) (i32.const 0))
    (i32.store offset=4 (local.get $s) (local.get $t)))

  (func $copy (param $s i32) (param $src i32) (param $n i32)
    (local $c i32)
    (local.set $c (call $malloc (i32.add (local.get $n) (i32.const 1))))
    (memory.copy (local.get $c) (local.get $src) (local.get $n))
    (i32.store8 (i32.add (local.get $c) (local.get $n)) (i32.const 0))
    (i32.store offset=24 (local.get $s) (local.get $c))
    (i32.store offset=28 (local.get $s) (local.get $n)))

  (func (export "sqlite3_clear_bindings") (param $s i32) (result i32)
    (call $set_type (local.get $s) (i32.const 5))
    (i32.const 0))

  (func (export "sqlite3_bind_int") (param $s i32) (param $i i32) (param $v i32) (result i32)
    (if (i32.ne (local.get $i) (i32.const 1)) (then (return (call $range))))
    (call $set_type (local.get $s) (i32.const 1))
    (i64.store offset=8 (local.get $s) (i64.extend_i32_s (local.get $v)))
    (i32.const 0))

  (func (export "sqlite3_bind_int64") (param $s i32) (param $i i32) (param $v i64) (result i32)
    (if (i32.ne (local.get $i) (i32.const 1)) (then (return (call $range))))
    (call $set_type (local.get $s) (i32.const 1))
    (i64.store offset=8 (local.get $s) (local.get $v))
    (i32.const 0))

  (func (export "sqlite3_bind_double") (param $s i32) (param $i i32) (param $v f64) (result i32)
    (if (i32.ne (local.get $i) (i32.const 1)) (then (return (call $range))))
    (call $set_type (local.get $s) (i32.const 2))
    (f64.store offset=16 (local.get $s) (local.get $v))
    (i32.const 0))

  (func (export "sqlite3_bind_null") (param $s i32) (param $i i32) (result i32)
    (if (i32.ne (local.get $i) (i32.const 1)) (then (return (call $range))))
    (call $set_type (local.get $s) (i32.const 5))
    (i32.const 0))

  (func (export "sqlite3_bind_text") (param $s i32) (param $i i32) (param $p i32) (param $n i32) (param $d i32) (result i32)
    (if (i32.ne (local.get $i) (i32.const 1)) (then (return (call $range))))
    (call $set_type (local.get $s) (i32.const 3))
    (call $copy (local.get $s) (local.get $p) (local.get $n))
    (i32.const 0))

  (func (export "sqlite3_bind_blob") (param $s i32) (param $i i32) (param $p i32) (param $n i32) (param $d i32) (result i32)
    (if (i32.ne (local.get $i) (i32.const 1)) (then (return (call $range))))
    (call $set_type (local.get $s) (i32.const 4))
    (call $copy (local.get $s) (local.get $p) (local.get $n))
    (i32.const 0))

  (func (export "sqlite3_bind_parameter_count") (param $s i32) (result i32)
    (i32.const 1))

  (func (export "sqlite3_bind_parameter_index") (param $s i32) (param $name i32) (result i32)
    (i32.eq (i32.load8_u (local.get $name)) (i32.const 58)))

  (func (export "sqlite3_column_count") (param $s i32) (result i32)
    (i32.const 1))

  (func (export "sqlite3_column_name") (param $s i32) (param $i i32) (result i32)
    (if (result i32) (i32.eqz (local.get $i))
      (then (i32.const 1056))
      (else (i32.const 0))))

  (func (export "sqlite3_column_decltype") (param $s i32) (param $i i32) (result i32)
    (i32.const 0))

  (func (export "sqlite3_column_type") (param $s i32) (param $i i32) (result i32)
    (local $t i32)
    (local.set $t (i32.load offset=4 (local.get $s)))
    (if (result i32) (local.get $t)
      (then (local.get $t))
      (else (i32.const 5))))

  (func (export "sqlite3_column_text") (param $s i32) (param $i i32) (result i32)
    (i32.load offset=24 (local.get $s)))

  (func (export "sqlite3_column_blob") (param $s i32) (param $i i32) (result i32)
    (i32.load offset=24 (local.get $s)))

  (func (export "sqlite3_column_bytes") (param $s i32) (param $i i32) (result i32)
    (i32.load offset=28 (local.get $s)))

  (func (export "sqlite3_column_double") (param $s i32) (param $i i32) (result f64)
    (f64.load offset=16 (local.get $s)))

  (func (export "sqlite3_column_int") (param $s i32) (param $i i32) (result i32)
    (i32.wrap_i64 (i64.load offset=8 (local.get $s))))

  (func (export "sqlite3_column_int64") (param $s i32) (param $i i32) (result i64)
    (i64.load offset=8 (local.get $s)))

  ;; shim

  (func (export "sqlite3_ext_vfs_register") (param $name i32) (param $dflt i32) (param $pout i32) (result i32)
    (local $i i32)
    (block $full
      (loop $next
        (br_if $full (i32.ge_u (local.get $i) (i32.const 32)))
        (if (i32.eqz (i32.load offset=512 (i32.shl (local.get $i) (i32.const 2))))
          (then
            (i32.store offset=512 (i32.shl (local.get $i) (i32.const 2)) (i32.const 1))
            (i32.store (local.get $pout) (local.get $i))
            (return (i32.const 0))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next)))
    (i32.const 7))

  (func (export "sqlite3_ext_vfs_unregister") (param $id i32) (result i32)
    (if (i32.ge_u (local.get $id) (i32.const 32)) (then (return (i32.const 1))))
    (if (i32.eqz (i32.load offset=512 (i32.shl (local.get $id) (i32.const 2))))
      (then (return (i32.const 1))))
    (i32.store offset=512 (i32.shl (local.get $id) (i32.const 2)) (i32.const 0))
    (i32.const 0))

  (func $abort (param $perr i32) (result i32)
    (local $m i32)
    (local.set $m (call $malloc (i32.const 14)))
    (memory.copy (local.get $m) (i32.const 1080) (i32.const 14))
    (i32.store (local.get $perr) (local.get $m))
    (global.set $last_rc (i32.const 4))
    (i32.const 4))

  (func (export "sqlite3_ext_exec") (param $db i32) (param $sql i32) (param $id i32) (param $perr i32) (result i32)
    (if (i32.eq (i32.load8_u (local.get $sql)) (i32.const 88))
      (then (global.set $last_rc (i32.const 1)) (return (i32.const 1))))
    (if (call $exec_cb (local.get $id) (i32.const 2) (i32.const 1208) (i32.const 1200))
      (then (return (call $abort (local.get $perr)))))
    (if (call $exec_cb (local.get $id) (i32.const 2) (i32.const 1216) (i32.const 1200))
      (then (return (call $abort (local.get $perr)))))
    (global.set $last_rc (i32.const 0))
    (i32.const 0))

  ;; test hooks

  (func (export "stub_live_allocations") (result i32)
    (global.get $live))

  (func (export "stub_deserialize_flags") (result i32)
    (global.get $deser_flags))

  (func (export "stub_vfs_open") (param i32 i32 i32 i32 i32) (result i32)
    (call $vfs_open (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)))

  (func (export "stub_io_write") (param i32 i32 i32 i32 i32) (result i32)
    (call $io_write (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)))

  (func (export "stub_io_read") (param i32 i32 i32 i32 i32) (result i32)
    (call $io_read (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)))

  (func (export "stub_io_close") (param i32 i32) (result i32)
    (call $io_close (local.get 0) (local.get 1)))

  (func (export "stub_vfs_randomness") (param i32 i32 i32) (result i32)
    (call $vfs_randomness (local.get 0) (local.get 1) (local.get 2)))

  (func (export "stub_vfs_last_error") (param i32 i32 i32) (result i32)
    (call $vfs_last_error (local.get 0) (local.get 1) (local.get 2)))
)"#,
        init_rc = init_rc,
        db = STUB_DB,
    )
}

pub(crate) fn stub_module_with_init(init_rc: i32) -> SqliteModule {
    SqliteModule::from_binary(stub_wat(init_rc).as_bytes()).expect("stub module compiles")
}

pub(crate) fn stub_module() -> SqliteModule {
    stub_module_with_init(0)
}

pub(crate) fn stub_instance() -> Instance {
    Instance::new(&stub_module()).expect("stub instance")
}

/// Call one of the stub's exports directly.
pub(crate) fn call_stub<P: WasmParams, R: WasmResults>(
    instance: &Instance,
    name: &str,
    params: P,
) -> R {
    let mut inner = instance.inner.lock().unwrap();
    let inner = &mut *inner;
    let func = inner
        .raw
        .get_typed_func::<P, R>(&mut inner.store, name)
        .unwrap();
    func.call(&mut inner.store, params).unwrap()
}

/// Allocations the stub's allocator currently considers live.
pub(crate) fn live_allocations(instance: &Instance) -> i32 {
    call_stub(instance, "stub_live_allocations", ())
}
