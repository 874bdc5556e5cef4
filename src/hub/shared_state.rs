//! Version-indexed shared state for a single owner.
//!
//! Versions only move forward: an insert at or below the newest version is
//! rejected and logged. Lookups resolve to the nearest version at or below
//! the requested one, falling back to the oldest entry.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::value::EventData;

/// Status of a resolved shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStateStatus {
    Set,
    Pending,
    None,
}

/// Which entries a lookup may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStateResolution {
    /// Any entry, pending or set.
    #[default]
    Any,
    /// Only entries that have been set.
    LastSet,
}

/// The two independent shared-state namespaces an extension can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStateType {
    #[default]
    Standard,
    Xdm,
}

/// Outcome of a shared-state lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedStateResult {
    pub status: SharedStateStatus,
    pub value: Option<EventData>,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Option<EventData>,
    status: SharedStateStatus,
}

/// Versioned state snapshots for one owner.
#[derive(Debug)]
pub struct SharedState {
    name: String,
    versions: RwLock<BTreeMap<i64, Entry>>,
}

impl SharedState {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<i64, Entry>> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<i64, Entry>> {
        self.versions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a set state at `version`. Returns false if rejected.
    pub fn set(&self, version: i64, data: Option<EventData>) -> bool {
        self.add(version, data, SharedStateStatus::Set)
    }

    /// Records a pending placeholder at `version`, carrying the newest data
    /// as its provisional value. Returns false if rejected.
    pub fn add_pending(&self, version: i64) -> bool {
        let placeholder = self.resolve(i64::MAX).value;
        self.add(version, placeholder, SharedStateStatus::Pending)
    }

    /// Completes the pending entry at `version`. Returns false if there is no
    /// such entry or it is not pending.
    pub fn update_pending(&self, version: i64, data: Option<EventData>) -> bool {
        let mut versions = self.write();
        match versions.get_mut(&version) {
            Some(entry) if entry.status == SharedStateStatus::Pending => {
                entry.data = data;
                entry.status = SharedStateStatus::Set;
                true
            }
            Some(_) => {
                log::error!(
                    "SharedState({}): attempting to update non-pending version {version}",
                    self.name
                );
                false
            }
            None => {
                log::error!(
                    "SharedState({}): no pending version {version} to update",
                    self.name
                );
                false
            }
        }
    }

    /// Resolves the entry with the greatest version `<= version`, or the
    /// oldest entry when every version is newer.
    pub fn resolve(&self, version: i64) -> SharedStateResult {
        let versions = self.read();
        let found = versions
            .range(..=version)
            .next_back()
            .or_else(|| versions.iter().next());
        match found {
            Some((_, entry)) => SharedStateResult {
                status: entry.status,
                value: entry.data.clone(),
            },
            None => SharedStateResult {
                status: SharedStateStatus::None,
                value: None,
            },
        }
    }

    /// Like [`SharedState::resolve`] but skips pending entries.
    pub fn resolve_last_set(&self, version: i64) -> SharedStateResult {
        let versions = self.read();
        let is_set = |e: &&Entry| e.status == SharedStateStatus::Set;
        let found = versions
            .range(..=version)
            .rev()
            .map(|(_, e)| e)
            .find(is_set)
            .or_else(|| versions.values().next().filter(is_set));
        match found {
            Some(entry) => SharedStateResult {
                status: SharedStateStatus::Set,
                value: entry.data.clone(),
            },
            None => SharedStateResult {
                status: SharedStateStatus::None,
                value: None,
            },
        }
    }

    /// Resolves with the requested strategy.
    pub fn resolve_with(&self, version: i64, resolution: SharedStateResolution) -> SharedStateResult {
        match resolution {
            SharedStateResolution::Any => self.resolve(version),
            SharedStateResolution::LastSet => self.resolve_last_set(version),
        }
    }

    fn add(&self, version: i64, data: Option<EventData>, status: SharedStateStatus) -> bool {
        let mut versions = self.write();
        if let Some((&newest, _)) = versions.iter().next_back() {
            if version <= newest {
                log::debug!(
                    "SharedState({}): rejecting version {version}, current version {newest}",
                    self.name
                );
                return false;
            }
        }
        versions.insert(version, Entry { data, status });
        true
    }
}
