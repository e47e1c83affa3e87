//! Immutable, shareable snapshots of a variable's value.

use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{self, AtomicU64},
    },
    time::SystemTime,
};

use crate::value::PvValue;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Totally ordered token identifying a point-in-time value of a variable.
///
/// Versions are drawn from a process-wide counter, so any two versions created by
/// [`VersionNumber::new`] compare in creation order, regardless of which variable or
/// thread created them. The wall-clock time of creation is carried along for
/// display and timestamping, but plays no part in the ordering.
#[derive(Clone, Copy, Debug)]
pub struct VersionNumber {
    counter: u64,
    timestamp: SystemTime,
}

impl VersionNumber {
    pub fn new() -> Self {
        VersionNumber {
            counter: NEXT_VERSION.fetch_add(1, atomic::Ordering::Relaxed),
            timestamp: SystemTime::now(),
        }
    }

    /// The version that sorts before every other version
    pub fn null() -> Self {
        VersionNumber {
            counter: 0,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn is_null(&self) -> bool {
        self.counter == 0
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl Default for VersionNumber {
    fn default() -> Self {
        VersionNumber::null()
    }
}

impl PartialEq for VersionNumber {
    fn eq(&self, other: &Self) -> bool {
        self.counter == other.counter
    }
}

impl Eq for VersionNumber {}

impl PartialOrd for VersionNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter.cmp(&other.counter)
    }
}

impl Hash for VersionNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.counter.hash(state);
    }
}

#[derive(Debug, PartialEq)]
struct Snapshot {
    value: PvValue,
    version: VersionNumber,
}

/// A published value of a variable, together with its version.
///
/// Cells are never changed once created; updating a variable replaces its cell.
/// Cloning is cheap, all clones share the same snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueCell(Arc<Snapshot>);

impl ValueCell {
    pub fn new(value: PvValue, version: VersionNumber) -> Self {
        ValueCell(Arc::new(Snapshot { value, version }))
    }

    pub fn value(&self) -> &PvValue {
        &self.0.value
    }

    pub fn version(&self) -> VersionNumber {
        self.0.version
    }

    /// Do both cells refer to the same published snapshot?
    pub fn same_snapshot(&self, other: &ValueCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_by_creation() {
        let first = VersionNumber::new();
        let second = VersionNumber::new();
        assert!(first < second);
        assert!(VersionNumber::null() < first);
        assert!(VersionNumber::null().is_null());
        let same = first;
        assert_eq!(first, same);
        assert_eq!(first.max(second), second);
    }

    #[test]
    fn default_version_is_null() {
        assert!(VersionNumber::default().is_null());
        assert_eq!(VersionNumber::default(), VersionNumber::null());
        assert!(VersionNumber::default() < VersionNumber::new());
    }

    #[test]
    fn cells_share_snapshots() {
        let cell = ValueCell::new(vec![1i32, 2].into(), VersionNumber::new());
        let other = cell.clone();
        assert!(cell.same_snapshot(&other));
        assert_eq!(other.value(), &PvValue::Int32(vec![1, 2]));
        let copy = ValueCell::new(cell.value().clone(), cell.version());
        assert_eq!(copy, cell);
        assert!(!copy.same_snapshot(&cell));
    }
}
