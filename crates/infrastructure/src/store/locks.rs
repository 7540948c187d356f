//! Row locks for the in-memory store.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Lock key: table and row identity.
pub(crate) type RowKey = (&'static str, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct RowLock {
    exclusive: Option<u64>,
    shared: HashSet<u64>,
}

impl RowLock {
    fn try_grant(&mut self, owner: u64, kind: LockKind) -> bool {
        if self.exclusive.is_some_and(|holder| holder != owner) {
            return false;
        }
        match kind {
            LockKind::Shared => {
                if self.exclusive.is_none() {
                    self.shared.insert(owner);
                }
                true
            }
            LockKind::Exclusive => {
                if self.shared.iter().any(|holder| *holder != owner) {
                    return false;
                }
                self.shared.remove(&owner);
                self.exclusive = Some(owner);
                true
            }
        }
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Shared and exclusive row locks held until the owning transaction ends.
#[derive(Debug, Default)]
pub(crate) struct LockManager {
    rows: Mutex<HashMap<RowKey, RowLock>>,
    released: Notify,
}

impl LockManager {
    fn try_acquire(&self, owner: u64, key: RowKey, kind: LockKind) -> bool {
        self.rows.lock().entry(key).or_default().try_grant(owner, kind)
    }

    /// Acquire a lock, waiting at most `timeout`.
    ///
    /// A zero timeout fails immediately with `LockConflict`; running out of
    /// time fails with `LockTimeout`.
    pub(crate) async fn acquire(
        &self,
        owner: u64,
        key: RowKey,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(owner, key, kind) {
                return Ok(());
            }

            if timeout.is_zero() {
                return Err(Error::LockConflict(format!(
                    "{} {} is locked by another transaction",
                    key.0, key.1
                )));
            }

            debug!(table = key.0, id = key.1, ?kind, "Waiting for row lock");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::LockTimeout(format!(
                    "{} {} not available within {:?}",
                    key.0, key.1, timeout
                )));
            }
        }
    }

    /// Release every lock of `owner` and wake waiters.
    pub(crate) fn release_all(&self, owner: u64) {
        {
            let mut rows = self.rows.lock();
            rows.retain(|_, lock| {
                if lock.exclusive == Some(owner) {
                    lock.exclusive = None;
                }
                lock.shared.remove(&owner);
                !lock.is_free()
            });
        }
        self.released.notify_waiters();
    }
}
