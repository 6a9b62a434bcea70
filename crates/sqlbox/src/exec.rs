//! Per-call row sinks for `sqlite3_ext_exec`.
//!
//! The engine cannot hold a host closure, so each exec call registers its
//! sink under a fresh integer token and passes the token through. The
//! callback import looks the token up, and the call removes it afterwards
//! whatever the outcome.

use std::collections::HashMap;

use crate::value::ExecRow;

/// Receives rows produced by one exec call.
pub(crate) enum ExecSink {
    /// Accumulate every row.
    Collect(Vec<ExecRow>),
    /// Forward each row; returning `false` aborts the run.
    Callback(Box<dyn FnMut(&ExecRow) -> bool + Send>),
}

impl ExecSink {
    /// Deliver a row. Returns whether the engine should continue.
    fn accept(&mut self, row: ExecRow) -> bool {
        match self {
            Self::Collect(rows) => {
                rows.push(row);
                true
            }
            Self::Callback(f) => f(&row),
        }
    }
}

#[derive(Default)]
pub(crate) struct ExecRegistry {
    next_token: i32,
    sinks: HashMap<i32, ExecSink>,
}

impl std::fmt::Debug for ExecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRegistry")
            .field("active", &self.sinks.len())
            .finish()
    }
}

impl ExecRegistry {
    /// Register a sink and return its token. Tokens are never zero.
    pub(crate) fn register(&mut self, sink: ExecSink) -> i32 {
        loop {
            self.next_token = self.next_token.wrapping_add(1);
            if self.next_token > 0 && !self.sinks.contains_key(&self.next_token) {
                break;
            }
        }
        self.sinks.insert(self.next_token, sink);
        self.next_token
    }

    /// Remove a sink once its call has returned.
    pub(crate) fn unregister(&mut self, token: i32) -> Option<ExecSink> {
        self.sinks.remove(&token)
    }

    /// Deliver a row to the sink for `token`. An unknown token aborts.
    pub(crate) fn dispatch(&mut self, token: i32, row: ExecRow) -> bool {
        match self.sinks.get_mut(&token) {
            Some(sink) => sink.accept(row),
            None => {
                tracing::warn!(token, "exec callback for unknown token");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
