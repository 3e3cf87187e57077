//! Per-thread concurrency guard.
//!
//! At most one generation runs per thread key. Acquisition never waits: a second caller
//! gets `Busy` straight away and is expected to tell the user so.

use dashmap::DashMap;
use relay_channels::ChannelKind;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const BUSY_MESSAGE: &str =
    "I can only handle one message at a time, please wait for my previous reply.";

/// Key the guard serializes on: one logical conversation partner per channel.
pub fn thread_key(channel: ChannelKind, owner_id: &str) -> String {
    format!("{channel}:{owner_id}")
}

/// Releases the thread when dropped.
#[derive(Debug)]
pub struct ThreadPermit {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl ThreadPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
pub enum Acquire {
    Held(ThreadPermit),
    Busy,
}

pub struct ThreadLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    prune_threshold: usize,
}

impl ThreadLocks {
    pub fn new(prune_threshold: usize) -> Self {
        Self {
            locks: DashMap::new(),
            prune_threshold: prune_threshold.max(1),
        }
    }

    pub fn try_acquire(&self, key: &str) -> Acquire {
        if self.locks.len() > self.prune_threshold {
            self.prune_idle();
        }

        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match lock.try_lock_owned() {
            Ok(guard) => Acquire::Held(ThreadPermit {
                key: key.to_string(),
                _guard: guard,
            }),
            Err(_) => {
                tracing::info!(thread_key = key, "generation already in flight; reporting busy");
                Acquire::Busy
            }
        }
    }

    /// Drops entries nobody holds or is about to lock.
    pub fn prune_idle(&self) {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        tracing::debug!(before, after = self.locks.len(), "pruned idle thread locks");
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
