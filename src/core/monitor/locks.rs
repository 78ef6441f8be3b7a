// src/core/monitor/locks.rs

//! Two-level lock coordinator serializing all goal-state mutations.
//!
//! Lock order is formation first, then group. A reporting call takes the
//! formation lock shared and the group lock exclusive; membership changes
//! (register, remove, settings) take the formation lock exclusive. No lock
//! is ever held across a network call: the health probes run lock-free and
//! only the decision and its writes happen under the group lock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Default)]
pub struct LockCoordinator {
    formations: DashMap<String, Arc<RwLock<()>>>,
    groups: DashMap<(String, i32), Arc<Mutex<()>>>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn formation_lock(&self, formation_id: &str) -> Arc<RwLock<()>> {
        self.formations
            .entry(formation_id.to_string())
            .or_default()
            .clone()
    }

    fn group_lock(&self, formation_id: &str, group_id: i32) -> Arc<Mutex<()>> {
        self.groups
            .entry((formation_id.to_string(), group_id))
            .or_default()
            .clone()
    }

    /// Shared formation lock, for reporting and read paths.
    pub async fn formation_shared(&self, formation_id: &str) -> OwnedRwLockReadGuard<()> {
        self.formation_lock(formation_id).read_owned().await
    }

    /// Exclusive formation lock, for membership and settings changes.
    pub async fn formation_exclusive(&self, formation_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.formation_lock(formation_id).write_owned().await
    }

    /// Exclusive group lock, held for the duration of one state-machine
    /// evaluation plus its writes. Always acquired after the formation
    /// lock.
    pub async fn group_exclusive(&self, formation_id: &str, group_id: i32) -> OwnedMutexGuard<()> {
        self.group_lock(formation_id, group_id).lock_owned().await
    }
}
