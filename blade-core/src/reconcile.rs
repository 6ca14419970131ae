//! Pending-file reconciliation: which files are new, how to deliver them, and how to
//! recover current indices after the server queue shifts.

use std::collections::{HashMap, HashSet};

use crate::{FileKey, PendingFile};

/// Keys already downloaded or already surfaced for manual download.
#[derive(Debug, Clone, Default)]
pub struct SeenFiles {
    keys: HashSet<FileKey>,
}

impl SeenFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.keys.contains(key)
    }

    /// Marks a key as seen. Returns `false` if it already was, in which case the caller
    /// must not start another download for it.
    pub fn mark(&mut self, key: FileKey) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Files in `listing` not yet seen, in server order, one entry per key.
pub fn new_arrivals(listing: &[PendingFile], seen: &SeenFiles) -> Vec<PendingFile> {
    let mut batch_keys = HashSet::new();
    listing
        .iter()
        .filter(|file| {
            let key = file.key();
            !seen.contains(&key) && batch_keys.insert(key)
        })
        .cloned()
        .collect()
}

/// Re-resolves each remaining file to its current server entry by name+size.
///
/// Files the server no longer lists are dropped; order of `remaining` is preserved.
pub fn remap_remaining(remaining: &[PendingFile], fresh: &[PendingFile]) -> Vec<PendingFile> {
    remaining
        .iter()
        .filter_map(|wanted| {
            fresh
                .iter()
                .find(|candidate| candidate.name == wanted.name && candidate.size == wanted.size)
                .cloned()
        })
        .collect()
}

pub fn find_by_key<'a>(listing: &'a [PendingFile], key: &FileKey) -> Option<&'a PendingFile> {
    listing.iter().find(|file| file.matches(key))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPlan {
    Nothing,
    /// Platform cannot start several downloads on its own: show one button per file.
    Manual(Vec<PendingFile>),
    Sequential(Vec<PendingFile>),
}

pub fn plan_delivery(arrivals: Vec<PendingFile>, supports_multi_auto_download: bool) -> DeliveryPlan {
    if arrivals.is_empty() {
        DeliveryPlan::Nothing
    } else if !supports_multi_auto_download && arrivals.len() > 1 {
        DeliveryPlan::Manual(arrivals)
    } else {
        DeliveryPlan::Sequential(arrivals)
    }
}

/// At most one reconciliation pass runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilerPhase {
    #[default]
    Idle,
    Reconciling,
}

impl ReconcilerPhase {
    /// Moves to `Reconciling`. Returns `false` if a pass is already in flight.
    pub fn try_begin(&mut self) -> bool {
        match self {
            ReconcilerPhase::Idle => {
                *self = ReconcilerPhase::Reconciling;
                true
            }
            ReconcilerPhase::Reconciling => false,
        }
    }

    pub fn finish(&mut self) {
        *self = ReconcilerPhase::Idle;
    }
}

/// Lookup table from file key to the row a UI shows for it.
///
/// Owned by UI sinks; guarantees one row per key and routes progress updates.
#[derive(Debug, Clone)]
pub struct DisplayedRows<T> {
    rows: HashMap<FileKey, T>,
    order: Vec<FileKey>,
}

impl<T> Default for DisplayedRows<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T> DisplayedRows<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row built by `make` unless one exists. Returns whether a row was added.
    pub fn insert_once(&mut self, key: &FileKey, make: impl FnOnce() -> T) -> bool {
        if self.rows.contains_key(key) {
            return false;
        }
        self.rows.insert(key.clone(), make());
        self.order.push(key.clone());
        true
    }

    pub fn get(&self, key: &FileKey) -> Option<&T> {
        self.rows.get(key)
    }

    pub fn get_mut(&mut self, key: &FileKey) -> Option<&mut T> {
        self.rows.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&FileKey, &T)> {
        self.order
            .iter()
            .filter_map(|key| self.rows.get(key).map(|row| (key, row)))
    }
}
