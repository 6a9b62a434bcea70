//! Database connections.

use sqlbox_vfs::OpenFlags;

use crate::codes::{SQLITE_OK, deserialize as deserialize_flags, serialize as serialize_flags};
use crate::error::{Error, Result, SqliteError};
use crate::exec::ExecSink;
use crate::handle::{DbPtr, SandboxPtr};
use crate::instance::{Instance, InstanceInner};
use crate::memory;
use crate::statement::Statement;
use crate::value::ExecRow;

/// An open database inside an [`Instance`].
///
/// Dropping a connection closes it. If statements prepared on it are still
/// live, teardown is deferred until the last one is finalized. Use
/// [`Connection::close`] to observe close errors.
pub struct Connection {
    instance: Instance,
    db: DbPtr,
    /// Buffers handed to `sqlite3_deserialize`, by schema. The engine reads
    /// them in place until the connection closes.
    owned_buffers: Vec<(String, SandboxPtr)>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("db", &self.db.0)
            .field("deserialized", &self.owned_buffers.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open (creating if needed) `filename` through the default VFS.
    ///
    /// `":memory:"` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the database cannot be opened.
    pub fn open(instance: &Instance, filename: &str) -> Result<Self> {
        Self::open_with_flags(instance, filename, OpenFlags::default_open(), None)
    }

    /// Open `filename` with explicit flags, optionally through a named VFS.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the database cannot be opened. Any
    /// half-opened handle is released before returning.
    pub fn open_with_flags(
        instance: &Instance,
        filename: &str,
        flags: OpenFlags,
        vfs: Option<&str>,
    ) -> Result<Self> {
        let db = instance.with(|inner| {
            inner.scoped(|inner, scope| {
                let name = scope.c_str(inner, filename)?;
                let vfs_name = match vfs {
                    Some(v) => scope.c_str(inner, v)?,
                    None => SandboxPtr::NULL,
                };
                let out = scope.alloc(inner, 4)?;
                memory::write_u32(inner.mem_mut(), out, 0)?;

                let rc = inner.call(
                    |e| &e.open_v2,
                    (name.raw(), out.raw(), flags.bits() as i32, vfs_name.raw()),
                )?;
                let db = DbPtr(memory::read_ptr(inner.mem(), out)?);
                if rc != SQLITE_OK {
                    let err = inner.sqlite_error(db, rc);
                    if !db.0.is_null() {
                        inner.call(|e| &e.close_v2, db.0.raw())?;
                    }
                    return Err(err);
                }
                Ok(db)
            })
        })?;
        tracing::debug!(filename, vfs, db = %db.0, "Opened connection");
        Ok(Self {
            instance: instance.clone(),
            db,
            owned_buffers: Vec::new(),
        })
    }

    /// Open an in-memory database holding a copy of `bytes`, a snapshot
    /// produced by [`Connection::serialize`].
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the bytes are not a database image.
    pub fn from_serialized(instance: &Instance, bytes: &[u8]) -> Result<Self> {
        let mut conn = Self::open(instance, ":memory:")?;
        conn.deserialize(bytes, "main", 0)?;
        Ok(conn)
    }

    /// The instance this connection lives in.
    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Run every statement in `sql` and collect the rows they produce.
    ///
    /// Values are the engine's own text rendering; SQL `NULL` is `None`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first statement that fails. Rows produced
    /// before the failure are discarded.
    pub fn execute(&self, sql: &str) -> Result<Vec<ExecRow>> {
        match self.run_exec(sql, ExecSink::Collect(Vec::new()))? {
            Some(ExecSink::Collect(rows)) => Ok(rows),
            _ => Ok(Vec::new()),
        }
    }

    /// Run every statement in `sql`, passing each row to `on_row`.
    /// Returning `false` stops execution with `SQLITE_ABORT`.
    ///
    /// `on_row` runs while the instance is locked. Calls it makes into the
    /// same instance fail with `SQLITE_MISUSE`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first statement that fails, or
    /// `SQLITE_ABORT` if `on_row` asked to stop.
    pub fn execute_with<F>(&self, sql: &str, on_row: F) -> Result<()>
    where
        F: FnMut(&ExecRow) -> bool + Send + 'static,
    {
        self.run_exec(sql, ExecSink::Callback(Box::new(on_row)))
            .map(|_| ())
    }

    fn run_exec(&self, sql: &str, sink: ExecSink) -> Result<Option<ExecSink>> {
        let db = self.handle()?;
        self.instance.with(|inner| {
            let token = inner.store.data_mut().exec.register(sink);
            let outcome = inner.scoped(|inner, scope| {
                let sql_ptr = scope.c_str(inner, sql)?;
                let errmsg = scope.alloc(inner, 4)?;
                memory::write_u32(inner.mem_mut(), errmsg, 0)?;
                let rc = inner.call(
                    |e| &e.ext_exec,
                    (db.0.raw(), sql_ptr.raw(), token, errmsg.raw()),
                )?;
                let msg_ptr = memory::read_ptr(inner.mem(), errmsg)?;
                let message = inner.read_opt_c_str(msg_ptr);
                inner.free(msg_ptr)?;
                Ok((rc, message?))
            });
            let sink = inner.store.data_mut().exec.unregister(token);

            let (rc, message) = outcome?;
            if rc == SQLITE_OK {
                return Ok(sink);
            }
            match inner.sqlite_error(db, rc) {
                Error::Sqlite(mut e) => {
                    if let Some(m) = message.filter(|m| !m.is_empty()) {
                        e.message = m;
                    }
                    Err(e.into())
                }
                other => Err(other),
            }
        })
    }

    /// Compile the first statement in `sql`.
    ///
    /// Returns `None` when `sql` holds no statement at all (only
    /// whitespace, comments or semicolons).
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the statement does not compile.
    pub fn prepare(&self, sql: &str) -> Result<Option<Statement>> {
        Statement::prepare(&self.instance, self.handle()?, sql)
    }

    /// Prepare each statement of `sql` in turn, pass it to `f`, then
    /// finalize it.
    ///
    /// The statement is finalized even when `f` fails; the first error
    /// stops the iteration and is returned.
    ///
    /// # Errors
    ///
    /// Returns the first compile, finalize or callback error.
    pub fn prepare_all<E, F>(&self, sql: &str, mut f: F) -> Result<(), E>
    where
        E: From<Error>,
        F: FnMut(&mut Statement) -> Result<(), E>,
    {
        let mut rest = sql;
        while !rest.is_empty() {
            let Some(mut stmt) = self.prepare(rest)? else {
                break;
            };
            let consumed = stmt.sql().len();
            let outcome = f(&mut stmt);
            let finalized = if stmt.is_finalized() {
                Ok(())
            } else {
                stmt.finalize()
            };
            outcome?;
            finalized?;
            rest = &rest[consumed..];
        }
        Ok(())
    }

    /// Snapshot the database `schema` (usually `"main"`) as bytes.
    ///
    /// Returns `None` when the engine cannot produce a snapshot, for
    /// example for an unknown schema. The bytes are always a host copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine traps or reports an impossible size.
    pub fn serialize(&self, schema: &str, flags: u32) -> Result<Option<Vec<u8>>> {
        let db = self.handle()?;
        self.instance.with(|inner| {
            inner.scoped(|inner, scope| {
                let schema_ptr = scope.c_str(inner, schema)?;
                let size = scope.alloc(inner, 8)?;
                memory::write_bytes(inner.mem_mut(), size, &[0; 8])?;

                let data = SandboxPtr::from_raw(inner.call(
                    |e| &e.serialize,
                    (db.0.raw(), schema_ptr.raw(), size.raw(), flags as i32),
                )?);
                if data.is_null() {
                    return Ok(None);
                }
                let len = memory::read_i64(inner.mem(), size)?;
                let copied = usize::try_from(len)
                    .map_err(|_| Error::OutOfBounds {
                        ptr: data.0,
                        len: 0,
                    })
                    .and_then(|len| memory::bytes(inner.mem(), data, len).map(<[u8]>::to_vec));
                if flags & serialize_flags::NO_COPY == 0 {
                    inner.free(data)?;
                }
                copied.map(Some)
            })
        })
    }

    /// Replace the database `schema` with a copy of `bytes`.
    ///
    /// `FREE_ON_CLOSE` and `RESIZEABLE` are always cleared from `flags`: the
    /// connection owns the copy and releases it when it closes, so the
    /// database cannot grow past `bytes.len()`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the bytes are rejected.
    pub fn deserialize(&mut self, bytes: &[u8], schema: &str, flags: u32) -> Result<()> {
        let db = self.handle()?;
        let flags =
            flags & !(deserialize_flags::FREE_ON_CLOSE | deserialize_flags::RESIZEABLE);
        let len = i64::try_from(bytes.len())
            .map_err(|_| SqliteError::with_message(crate::codes::SQLITE_FULL, "image too large"))?;

        let replaced = self
            .owned_buffers
            .iter()
            .position(|(s, _)| s == schema);
        let buffer = self.instance.with(|inner| {
            let data = inner.alloc_bytes(bytes)?;
            let rc = inner.scoped(|inner, scope| {
                let schema_ptr = scope.c_str(inner, schema)?;
                inner.call(
                    |e| &e.deserialize,
                    (db.0.raw(), schema_ptr.raw(), data.raw(), len, len, flags as i32),
                )
            });
            match rc {
                Ok(SQLITE_OK) => {}
                Ok(rc) => {
                    let err = inner.sqlite_error(db, rc);
                    inner.free(data)?;
                    return Err(err);
                }
                Err(e) => {
                    inner.free(data)?;
                    return Err(e);
                }
            }
            // The engine dropped its reference to the previous image.
            if let Some(i) = replaced {
                inner.free(self.owned_buffers[i].1)?;
            }
            Ok(data)
        })?;

        match replaced {
            Some(i) => self.owned_buffers[i].1 = buffer,
            None => self.owned_buffers.push((schema.to_string(), buffer)),
        }
        tracing::debug!(schema, size = bytes.len(), "Deserialized database");
        Ok(())
    }

    /// Rows modified by the most recent `INSERT`, `UPDATE` or `DELETE`.
    ///
    /// # Errors
    ///
    /// Fails if the instance is unusable.
    pub fn changes(&self) -> Result<i32> {
        let db = self.handle()?;
        self.instance.with(|inner| inner.call(|e| &e.changes, db.0.raw()))
    }

    /// Rowid of the most recent successful `INSERT`.
    ///
    /// # Errors
    ///
    /// Fails if the instance is unusable.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let db = self.handle()?;
        self.instance
            .with(|inner| inner.call(|e| &e.last_insert_rowid, db.0.raw()))
    }

    /// Whether no transaction is open.
    ///
    /// # Errors
    ///
    /// Fails if the instance is unusable.
    pub fn is_autocommit(&self) -> Result<bool> {
        let db = self.handle()?;
        self.instance
            .with(|inner| inner.call(|e| &e.get_autocommit, db.0.raw()).map(|v| v != 0))
    }

    /// Close the connection.
    ///
    /// Fails with `SQLITE_BUSY` while statements prepared on it are still
    /// live. The connection is unusable afterwards either way: on failure
    /// the engine tears it down once the last statement is finalized.
    ///
    /// # Errors
    ///
    /// Returns the engine's close error.
    pub fn close(mut self) -> Result<()> {
        let db = std::mem::replace(&mut self.db, DbPtr(SandboxPtr::NULL));
        let buffers = std::mem::take(&mut self.owned_buffers);
        self.instance
            .with(|inner| close_handle(inner, db, buffers))?;
        tracing::debug!(db = %db.0, "Closed connection");
        Ok(())
    }

    fn handle(&self) -> Result<DbPtr> {
        if self.db.0.is_null() {
            return Err(SqliteError::misuse("connection is closed").into());
        }
        Ok(self.db)
    }
}

/// `sqlite3_close`, falling back to `sqlite3_close_v2` so the handle is
/// never lost. Deserialized images are released only once the engine has
/// really closed; otherwise they are leaked.
fn close_handle(
    inner: &mut InstanceInner,
    db: DbPtr,
    buffers: Vec<(String, SandboxPtr)>,
) -> Result<()> {
    let rc = inner.call(|e| &e.close, db.0.raw())?;
    if rc != SQLITE_OK {
        let err = inner.sqlite_error(db, rc);
        inner.call(|e| &e.close_v2, db.0.raw())?;
        if !buffers.is_empty() {
            tracing::warn!(
                count = buffers.len(),
                "Leaking deserialized images of a connection that failed to close"
            );
        }
        return Err(err);
    }
    for (_, buffer) in buffers {
        inner.free(buffer)?;
    }
    Ok(())
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.db.0.is_null() {
            return;
        }
        let db = self.db;
        let buffers = std::mem::take(&mut self.owned_buffers);
        match self
            .instance
            .with_live(|inner| close_handle(inner, db, buffers))
        {
            Some(Ok(())) => tracing::debug!(db = %db.0, "Closed dropped connection"),
            Some(Err(e)) => tracing::warn!(error = %e, "Failed to close dropped connection"),
            None => tracing::debug!("Connection dropped after instance shutdown"),
        }
    }
}
