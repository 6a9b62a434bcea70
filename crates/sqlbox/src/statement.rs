//! Prepared statements and row access.

use crate::codes::{
    ColumnType, SQLITE_DONE, SQLITE_MISUSE, SQLITE_RANGE, SQLITE_ROW, SQLITE_TOOBIG,
    SQLITE_TRANSIENT,
};
use crate::error::{Error, Result, SqliteError};
use crate::handle::{DbPtr, SandboxPtr, StmtPtr};
use crate::instance::{Instance, InstanceInner};
use crate::memory;
use crate::value::Value;

/// One compiled SQL statement.
///
/// Parameter indices are 1-based and column indices 0-based, as in SQL.
/// Column values are only meaningful between a [`Statement::step`] that
/// returned `true` and the next call to `step`, `reset` or `finalize`.
///
/// Once finalized (explicitly or by drop) every operation fails with
/// `SQLITE_MISUSE` without reaching the engine.
pub struct Statement {
    instance: Instance,
    db: DbPtr,
    ptr: StmtPtr,
    sql: String,
    tail: Option<String>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("tail", &self.tail)
            .field("finalized", &self.ptr.is_finalized())
            .finish_non_exhaustive()
    }
}

impl Statement {
    /// Compile the first statement of `sql`, or `None` if there is none.
    pub(crate) fn prepare(instance: &Instance, db: DbPtr, sql: &str) -> Result<Option<Self>> {
        let nbyte = i32::try_from(sql.len() + 1)
            .map_err(|_| SqliteError::with_message(SQLITE_MISUSE, "SQL text too long"))?;
        let (ptr, consumed) = instance.with(|inner| {
            inner.scoped(|inner, scope| {
                let sql_ptr = scope.c_str(inner, sql)?;
                let out = scope.alloc(inner, 8)?;
                memory::write_bytes(inner.mem_mut(), out, &[0; 8])?;
                let tail_slot = out.add(4);

                let rc = inner.call(
                    |e| &e.prepare_v2,
                    (db.0.raw(), sql_ptr.raw(), nbyte, out.raw(), tail_slot.raw()),
                )?;
                inner.check(db, rc)?;

                let stmt = memory::read_ptr(inner.mem(), out)?;
                let tail = memory::read_ptr(inner.mem(), tail_slot)?;
                let consumed = if tail.is_null() {
                    sql.len()
                } else {
                    (tail.0.saturating_sub(sql_ptr.0) as usize).min(sql.len())
                };
                Ok((StmtPtr(stmt), consumed))
            })
        })?;

        if ptr.is_finalized() {
            return Ok(None);
        }
        let consumed = if sql.is_char_boundary(consumed) {
            consumed
        } else {
            sql.len()
        };
        let (head, rest) = sql.split_at(consumed);
        tracing::trace!(sql = head, "Prepared statement");
        Ok(Some(Self {
            instance: instance.clone(),
            db,
            ptr,
            sql: head.to_string(),
            tail: (!rest.is_empty()).then(|| rest.to_string()),
        }))
    }

    /// The text this statement was compiled from.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The text following this statement in the input, if any.
    #[must_use]
    pub fn tail(&self) -> Option<&str> {
        self.tail.as_deref()
    }

    /// Whether [`Statement::finalize`] has run.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.ptr.is_finalized()
    }

    fn live(&self) -> Result<i32> {
        if self.ptr.is_finalized() {
            return Err(SqliteError::misuse("statement has been finalized").into());
        }
        Ok(self.ptr.0.raw())
    }

    /// Run `f` with the statement handle and map a non-OK code through the
    /// connection's error state.
    fn run(&self, f: impl FnOnce(&mut InstanceInner, i32) -> Result<i32>) -> Result<()> {
        let stmt = self.live()?;
        let db = self.db;
        self.instance.with(|inner| {
            let rc = f(inner, stmt)?;
            inner.check(db, rc)
        })
    }

    /// Run `f` with the statement handle and return its value unchecked.
    fn query<R>(&self, f: impl FnOnce(&mut InstanceInner, i32) -> Result<R>) -> Result<R> {
        let stmt = self.live()?;
        self.instance.with(|inner| f(inner, stmt))
    }

    /// Bind UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, e.g. `SQLITE_RANGE` for a bad index.
    pub fn bind_text(&mut self, index: i32, value: &str) -> Result<()> {
        let len = byte_len(value.len())?;
        self.run(|inner, stmt| {
            inner.scoped(|inner, scope| {
                let data = scope.bytes(inner, value.as_bytes())?;
                inner.call(
                    |e| &e.bind_text,
                    (stmt, index, data.raw(), len, SQLITE_TRANSIENT),
                )
            })
        })
    }

    /// Bind bytes. An empty slice binds a zero-length blob, not `NULL`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn bind_blob(&mut self, index: i32, value: &[u8]) -> Result<()> {
        let len = byte_len(value.len())?;
        self.run(|inner, stmt| {
            inner.scoped(|inner, scope| {
                let data = scope.bytes(inner, value)?;
                inner.call(
                    |e| &e.bind_blob,
                    (stmt, index, data.raw(), len, SQLITE_TRANSIENT),
                )
            })
        })
    }

    /// Bind a float.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn bind_double(&mut self, index: i32, value: f64) -> Result<()> {
        self.run(|inner, stmt| inner.call(|e| &e.bind_double, (stmt, index, value)))
    }

    /// Bind a 32-bit integer.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn bind_int(&mut self, index: i32, value: i32) -> Result<()> {
        self.run(|inner, stmt| inner.call(|e| &e.bind_int, (stmt, index, value)))
    }

    /// Bind a 64-bit integer.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn bind_int64(&mut self, index: i32, value: i64) -> Result<()> {
        self.run(|inner, stmt| inner.call(|e| &e.bind_int64, (stmt, index, value)))
    }

    /// Bind SQL `NULL`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn bind_null(&mut self, index: i32) -> Result<()> {
        self.run(|inner, stmt| inner.call(|e| &e.bind_null, (stmt, index)))
    }

    /// Bind any [`Value`]. Booleans are stored as integers `0` and `1`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn bind_value(&mut self, index: i32, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.bind_null(index),
            Value::Text(s) => self.bind_text(index, s),
            Value::Double(d) => self.bind_double(index, *d),
            Value::Boolean(b) => self.bind_int(index, i32::from(*b)),
            Value::Int(i) => self.bind_int(index, *i),
            Value::Int64(i) => self.bind_int64(index, *i),
            Value::Blob(b) => self.bind_blob(index, b),
        }
    }

    /// Bind `values` to parameters `1..=values.len()`.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first binding error.
    pub fn bind(&mut self, values: &[Value]) -> Result<()> {
        for (index, value) in (1..).zip(values) {
            self.bind_value(index, value)?;
        }
        Ok(())
    }

    /// Bind a named parameter such as `:id`, `@id` or `$id`. The prefix is
    /// part of the name.
    ///
    /// # Errors
    ///
    /// Fails with `SQLITE_RANGE` if the statement has no such parameter.
    pub fn bind_named(&mut self, name: &str, value: &Value) -> Result<()> {
        let index = self.bind_parameter_index(name)?.ok_or_else(|| {
            Error::from(SqliteError::with_message(
                SQLITE_RANGE,
                format!("no such parameter: {name}"),
            ))
        })?;
        self.bind_value(index, value)
    }

    /// Reset every parameter to `NULL`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn clear_bindings(&mut self) -> Result<()> {
        self.run(|inner, stmt| inner.call(|e| &e.clear_bindings, stmt))
    }

    /// Largest parameter index in the statement.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn bind_parameter_count(&self) -> Result<i32> {
        self.query(|inner, stmt| inner.call(|e| &e.bind_parameter_count, stmt))
    }

    /// Index of the named parameter, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn bind_parameter_index(&self, name: &str) -> Result<Option<i32>> {
        self.query(|inner, stmt| {
            inner.scoped(|inner, scope| {
                let name_ptr = scope.c_str(inner, name)?;
                let index = inner.call(|e| &e.bind_parameter_index, (stmt, name_ptr.raw()))?;
                Ok((index > 0).then_some(index))
            })
        })
    }

    /// Advance to the next row. `true` means a row is available, `false`
    /// that the statement has finished.
    ///
    /// # Errors
    ///
    /// Returns the connection's error for any other outcome.
    pub fn step(&mut self) -> Result<bool> {
        let stmt = self.live()?;
        let db = self.db;
        self.instance.with(|inner| match inner.call(|e| &e.step, stmt)? {
            SQLITE_ROW => Ok(true),
            SQLITE_DONE => Ok(false),
            rc => Err(inner.sqlite_error(db, rc)),
        })
    }

    /// Rewind so the statement can run again. Bindings are kept.
    ///
    /// # Errors
    ///
    /// Returns the error of the most recent step, if it failed.
    pub fn reset(&mut self) -> Result<()> {
        self.run(|inner, stmt| inner.call(|e| &e.reset, stmt))
    }

    /// Number of result columns.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_count(&self) -> Result<i32> {
        self.query(|inner, stmt| inner.call(|e| &e.column_count, stmt))
    }

    /// Name of result column `index`.
    ///
    /// # Errors
    ///
    /// Fails with `SQLITE_RANGE` for an index outside the result.
    pub fn column_name(&self, index: i32) -> Result<String> {
        self.query(|inner, stmt| {
            let ptr = SandboxPtr::from_raw(inner.call(|e| &e.column_name, (stmt, index))?);
            inner
                .read_opt_c_str(ptr)?
                .ok_or_else(|| column_range(index))
        })
    }

    /// Names of every result column, in order.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_names(&self) -> Result<Vec<String>> {
        (0..self.column_count()?)
            .map(|i| self.column_name(i))
            .collect()
    }

    /// Declared type of result column `index`, `None` for expressions and
    /// untyped columns.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_decltype(&self, index: i32) -> Result<Option<String>> {
        self.query(|inner, stmt| {
            let ptr = SandboxPtr::from_raw(inner.call(|e| &e.column_decltype, (stmt, index))?);
            inner.read_opt_c_str(ptr)
        })
    }

    /// Storage class of column `index` in the current row.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_type(&self, index: i32) -> Result<ColumnType> {
        self.query(|inner, stmt| {
            inner
                .call(|e| &e.column_type, (stmt, index))
                .map(ColumnType::from_raw)
        })
    }

    /// Column `index` as text. `NULL` reads as an empty string.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_text(&self, index: i32) -> Result<String> {
        self.query(|inner, stmt| {
            // The pointer must be fetched before the length.
            let ptr = SandboxPtr::from_raw(inner.call(|e| &e.column_text, (stmt, index))?);
            let len = inner.call(|e| &e.column_bytes, (stmt, index))?;
            let bytes = read_column(inner, ptr, len)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
    }

    /// Column `index` as bytes. `NULL` reads as an empty vector.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_blob(&self, index: i32) -> Result<Vec<u8>> {
        self.query(|inner, stmt| {
            let ptr = SandboxPtr::from_raw(inner.call(|e| &e.column_blob, (stmt, index))?);
            let len = inner.call(|e| &e.column_bytes, (stmt, index))?;
            read_column(inner, ptr, len)
        })
    }

    /// Column `index` as a float.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_double(&self, index: i32) -> Result<f64> {
        self.query(|inner, stmt| inner.call(|e| &e.column_double, (stmt, index)))
    }

    /// Column `index` as a 32-bit integer (truncated by the engine).
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_int(&self, index: i32) -> Result<i32> {
        self.query(|inner, stmt| inner.call(|e| &e.column_int, (stmt, index)))
    }

    /// Column `index` as a 64-bit integer.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_int64(&self, index: i32) -> Result<i64> {
        self.query(|inner, stmt| inner.call(|e| &e.column_int64, (stmt, index)))
    }

    /// Column `index` as the [`Value`] matching its storage class.
    ///
    /// Integers read as [`Value::Int64`] unless `narrow` is set, in which
    /// case values that fit in 32 bits read as [`Value::Int`].
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn column_value(&self, index: i32, narrow: bool) -> Result<Value> {
        Ok(match self.column_type(index)? {
            ColumnType::Null => Value::Null,
            ColumnType::Text => Value::Text(self.column_text(index)?),
            ColumnType::Blob => Value::Blob(self.column_blob(index)?),
            ColumnType::Float => Value::Double(self.column_double(index)?),
            ColumnType::Integer => {
                let v = self.column_int64(index)?;
                if narrow {
                    i32::try_from(v).map_or(Value::Int64(v), Value::Int)
                } else {
                    Value::Int64(v)
                }
            }
        })
    }

    /// Every column of the current row.
    ///
    /// # Errors
    ///
    /// Fails if the statement is finalized.
    pub fn columns(&self, narrow: bool) -> Result<Vec<Value>> {
        (0..self.column_count()?)
            .map(|i| self.column_value(i, narrow))
            .collect()
    }

    /// Release the statement. Calling this twice fails with
    /// `SQLITE_MISUSE`.
    ///
    /// # Errors
    ///
    /// Returns the error of the most recent step, if it failed; the
    /// statement is released regardless.
    pub fn finalize(&mut self) -> Result<()> {
        let stmt = self.live()?;
        self.ptr = StmtPtr::FINALIZED;
        let db = self.db;
        self.instance.with(|inner| {
            let rc = inner.call(|e| &e.finalize, stmt)?;
            inner.check(db, rc)
        })
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if self.ptr.is_finalized() {
            return;
        }
        let stmt = std::mem::replace(&mut self.ptr, StmtPtr::FINALIZED);
        match self
            .instance
            .with_live(|inner| inner.call(|e| &e.finalize, stmt.0.raw()))
        {
            Some(Ok(_)) | None => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, sql = %self.sql, "Failed to finalize dropped statement");
            }
        }
    }
}

fn byte_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        SqliteError::with_message(SQLITE_TOOBIG, "value too large to bind").into()
    })
}

fn column_range(index: i32) -> Error {
    SqliteError::with_message(SQLITE_RANGE, format!("column index {index} out of range")).into()
}

fn read_column(inner: &InstanceInner, ptr: SandboxPtr, len: i32) -> Result<Vec<u8>> {
    if ptr.is_null() || len <= 0 {
        return Ok(Vec::new());
    }
    memory::bytes(inner.mem(), ptr, len as usize).map(<[u8]>::to_vec)
}
