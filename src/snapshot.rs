//! Discovery snapshots and the hotplug diff.
//!
//! A *snapshot* is the list of [`DeviceInfo`] records captured at one
//! discovery pass. [`diff_snapshots`] classifies two snapshots into the
//! added / removed / modified lists of a [`DeviceChangeEvent`], keyed by
//! [`DeviceInfo::unique_key`].
//!
//! # Semantics
//! - Events are **owned** values, cheap to clone for fan-out to several
//!   listeners; they carry the full current and initial snapshots alongside
//!   the classified lists.
//! - Ordering: `added` and `modified` follow the iteration order of the
//!   current snapshot, `removed` follows the previous snapshot.
//! - The diff is symmetric under swapping its arguments: what one direction
//!   reports as added, the other reports as removed.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::device::DeviceInfo;

/// One hotplug observation: what changed between two discovery passes.
#[derive(Debug, Clone, Default)]
pub struct DeviceChangeEvent {
    /// When the diff was computed.
    pub timestamp: Option<SystemTime>,
    /// Records present now but not before.
    pub added: Vec<DeviceInfo>,
    /// Records present before but gone now.
    pub removed: Vec<DeviceInfo>,
    /// Records present in both whose identifying fields differ, as
    /// `(old, new)` pairs.
    pub modified: Vec<(DeviceInfo, DeviceInfo)>,
    /// The full snapshot the diff ran against.
    pub current: Vec<DeviceInfo>,
    /// The snapshot taken when monitoring started.
    pub initial: Vec<DeviceInfo>,
}

impl DeviceChangeEvent {
    /// True iff any of the three classified lists is non-empty.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.modified.is_empty()
    }
}

/// Classifies `current` against `previous` by unique key.
///
/// Key in current only → added. Key in previous only → removed. Key in both
/// with unequal records (per [`DeviceInfo`] identity equality, which ignores
/// the attribute bag and `last_seen`) → modified.
pub fn diff_snapshots(current: &[DeviceInfo], previous: &[DeviceInfo]) -> DeviceChangeEvent {
    let current_map: HashMap<String, &DeviceInfo> =
        current.iter().map(|d| (d.unique_key(), d)).collect();
    let previous_map: HashMap<String, &DeviceInfo> =
        previous.iter().map(|d| (d.unique_key(), d)).collect();

    let mut event = DeviceChangeEvent {
        timestamp: Some(SystemTime::now()),
        current: current.to_vec(),
        ..DeviceChangeEvent::default()
    };

    for device in current {
        match previous_map.get(&device.unique_key()) {
            None => event.added.push(device.clone()),
            Some(old) if *old != device => {
                event.modified.push(((*old).clone(), device.clone()));
            }
            Some(_) => {}
        }
    }

    for device in previous {
        if !current_map.contains_key(&device.unique_key()) {
            event.removed.push(device.clone());
        }
    }

    event
}
