//! The five-level file locking protocol.
//!
//! Every open handle to a file owns a [`FileLock`]. Handles to the same
//! path share one lock state through the [`LockTable`], so two connections
//! in the same sandbox contend exactly as they would on a real filesystem:
//!
//! - any number of handles may hold `SHARED`;
//! - one handle may hold `RESERVED` alongside readers;
//! - `PENDING` blocks new readers while existing ones drain;
//! - `EXCLUSIVE` requires that no other handle holds any lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{VfsError, VfsResult};
use crate::flags::LockLevel;

#[derive(Debug, Default)]
struct LockState {
    /// Number of handles holding at least `SHARED`.
    shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
}

type StateMap = HashMap<String, Arc<Mutex<LockState>>>;

/// Registry of lock states keyed by file path.
///
/// An entry lives only as long as some [`FileLock`] for its path does.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    states: Arc<Mutex<StateMap>>,
}

impl LockTable {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lock handle for `path`, starting at [`LockLevel::None`].
    pub fn handle(&self, path: &str) -> FileLock {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(path.to_string()).or_default().clone();
        FileLock {
            path: path.to_string(),
            table: Arc::clone(&self.states),
            state,
            level: LockLevel::None,
            holds_reserved: false,
            holds_pending: false,
        }
    }

    /// Number of paths with at least one live handle.
    #[must_use]
    pub fn tracked_paths(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One handle's view of a shared file lock.
///
/// Dropping the handle releases whatever it holds.
#[derive(Debug)]
pub struct FileLock {
    path: String,
    table: Arc<Mutex<StateMap>>,
    state: Arc<Mutex<LockState>>,
    level: LockLevel,
    holds_reserved: bool,
    holds_pending: bool,
}

impl FileLock {
    /// The level currently held by this handle.
    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level
    }

    fn busy(&self, wanted: LockLevel) -> VfsError {
        VfsError::Busy(format!("{wanted:?} lock on {}", self.path))
    }

    /// Raise this handle's lock to at least `wanted`.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::Busy`] if another handle holds a conflicting lock.
    /// A failed attempt to reach `EXCLUSIVE` may leave the handle at
    /// `PENDING`, which keeps new readers out until it retries or unlocks.
    pub fn lock(&mut self, wanted: LockLevel) -> VfsResult<()> {
        if self.level >= wanted {
            return Ok(());
        }
        let state = self.state.clone();
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

        if self.level == LockLevel::None {
            if state.pending || state.exclusive {
                return Err(self.busy(wanted));
            }
            state.shared += 1;
            self.level = LockLevel::Shared;
            if wanted == LockLevel::Shared {
                return Ok(());
            }
        }

        if wanted == LockLevel::Reserved {
            if state.reserved {
                return Err(self.busy(wanted));
            }
            state.reserved = true;
            self.holds_reserved = true;
            self.level = LockLevel::Reserved;
            return Ok(());
        }

        // PENDING or EXCLUSIVE.
        if !self.holds_pending {
            if state.pending || (state.reserved && !self.holds_reserved) {
                return Err(self.busy(wanted));
            }
            state.pending = true;
            self.holds_pending = true;
            self.level = LockLevel::Pending;
        }
        if wanted == LockLevel::Pending {
            return Ok(());
        }
        if state.shared > 1 || state.exclusive {
            return Err(self.busy(wanted));
        }
        state.exclusive = true;
        self.level = LockLevel::Exclusive;
        Ok(())
    }

    /// Lower this handle's lock to `target`, which must be `NONE` or `SHARED`.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::InvalidPath`] for any other target level.
    pub fn unlock(&mut self, target: LockLevel) -> VfsResult<()> {
        if target > LockLevel::Shared {
            return Err(VfsError::InvalidPath(format!(
                "cannot unlock {} to {target:?}",
                self.path
            )));
        }
        if self.level <= target {
            return Ok(());
        }
        let state = self.state.clone();
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.level == LockLevel::Exclusive {
            state.exclusive = false;
        }
        if self.holds_pending {
            state.pending = false;
            self.holds_pending = false;
        }
        if self.holds_reserved {
            state.reserved = false;
            self.holds_reserved = false;
        }
        if target == LockLevel::None {
            state.shared = state.shared.saturating_sub(1);
        }
        self.level = target;
        Ok(())
    }

    /// Whether any handle (this one included) holds `RESERVED` or higher.
    #[must_use]
    pub fn check_reserved(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.reserved || state.pending || state.exclusive
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.unlock(LockLevel::None);
        // Handles are created under the table lock, so the count cannot
        // grow while it is held. Two references means the map's and ours.
        let mut states = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&self.state) == 2
            && states
                .get(&self.path)
                .is_some_and(|s| Arc::ptr_eq(s, &self.state))
        {
            states.remove(&self.path);
        }
    }
}
