//! Change detection against a group's last-known snapshot
//!
//! A member is changed when it has no snapshot entry (never polled, or
//! cleared) or when its raw value differs from the snapshot value. The
//! display string is carried but never compared.

use std::collections::HashMap;

use qsys_core::{ControlReading, ControlValue};

use crate::types::ChangeEntry;

/// Last observed state of one control
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub value: ControlValue,
    pub string: String,
    pub observed_at_ms: u64,
}

/// Last observed state of every polled member of a group
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: HashMap<String, SnapshotEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&SnapshotEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&mut self, name: &str) -> Option<SnapshotEntry> {
        self.entries.remove(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Stateless diff of readings against a snapshot
pub struct ChangeDetector;

impl ChangeDetector {
    /// Diff `readings` against `snapshot` and record them into it
    ///
    /// Every reading updates the snapshot, changed or not. Controls absent
    /// from `readings` (failed reads) keep their previous entry. Returned
    /// entries follow the order of `readings`; unchanged ones appear only
    /// when `include_unchanged` is set.
    pub fn detect(
        snapshot: &mut Snapshot,
        readings: &[ControlReading],
        include_unchanged: bool,
        now_ms: u64,
    ) -> Vec<ChangeEntry> {
        let mut entries = Vec::new();

        for reading in readings {
            let previous = snapshot.entries.insert(
                reading.name.clone(),
                SnapshotEntry {
                    value: reading.value.clone(),
                    string: reading.string.clone(),
                    observed_at_ms: now_ms,
                },
            );

            let changed = match &previous {
                None => true,
                Some(prev) => prev.value != reading.value,
            };

            if changed || include_unchanged {
                entries.push(ChangeEntry {
                    name: reading.name.clone(),
                    value: reading.value.clone(),
                    string: reading.string.clone(),
                    changed,
                    previous: previous.map(|p| p.value),
                });
            }
        }

        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(name: &str, value: impl Into<ControlValue>) -> ControlReading {
        ControlReading::plain(name, value)
    }

    #[test]
    fn test_first_poll_reports_everything() {
        let mut snapshot = Snapshot::new();
        let readings = vec![reading("A.gain", 0.0), reading("A.mute", false)];

        let changes = ChangeDetector::detect(&mut snapshot, &readings, false, 1);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.changed && c.previous.is_none()));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_unchanged_values_are_quiet() {
        let mut snapshot = Snapshot::new();
        let readings = vec![reading("A.gain", -3.0), reading("A.mute", true)];
        ChangeDetector::detect(&mut snapshot, &readings, false, 1);

        let changes = ChangeDetector::detect(&mut snapshot, &readings, false, 2);
        assert!(changes.is_empty());
        // Timestamps still move forward for every read member
        assert_eq!(snapshot.get("A.gain").unwrap().observed_at_ms, 2);
    }

    #[test]
    fn test_only_changed_member_reported() {
        let mut snapshot = Snapshot::new();
        ChangeDetector::detect(
            &mut snapshot,
            &[reading("A.gain", -3.0), reading("A.mute", true)],
            false,
            1,
        );

        let changes = ChangeDetector::detect(
            &mut snapshot,
            &[reading("A.gain", -6.0), reading("A.mute", true)],
            false,
            2,
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "A.gain");
        assert_eq!(changes[0].previous, Some(ControlValue::Number(-3.0)));
    }

    #[test]
    fn test_display_string_change_alone_is_not_a_change() {
        let mut snapshot = Snapshot::new();
        let first = ControlReading::new("A.gain", ControlValue::Number(-3.0), "-3dB");
        ChangeDetector::detect(&mut snapshot, &[first], false, 1);

        let reformatted = ControlReading::new("A.gain", ControlValue::Number(-3.0), "-3.0 dB");
        let changes = ChangeDetector::detect(&mut snapshot, &[reformatted], false, 2);
        assert!(changes.is_empty());
        assert_eq!(snapshot.get("A.gain").unwrap().string, "-3.0 dB");
    }

    #[test]
    fn test_variant_change_is_a_change() {
        let mut snapshot = Snapshot::new();
        ChangeDetector::detect(&mut snapshot, &[reading("A.mute", 0.0)], false, 1);
        let changes = ChangeDetector::detect(&mut snapshot, &[reading("A.mute", false)], false, 2);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_include_unchanged() {
        let mut snapshot = Snapshot::new();
        let readings = vec![reading("A.gain", 1.0), reading("A.mute", false)];
        ChangeDetector::detect(&mut snapshot, &readings, false, 1);

        let changes = ChangeDetector::detect(
            &mut snapshot,
            &[reading("A.gain", 2.0), reading("A.mute", false)],
            true,
            2,
        );
        assert_eq!(changes.len(), 2);
        assert!(changes[0].changed);
        assert!(!changes[1].changed);
    }

    #[test]
    fn test_missing_reading_keeps_snapshot() {
        let mut snapshot = Snapshot::new();
        ChangeDetector::detect(
            &mut snapshot,
            &[reading("A.gain", 1.0), reading("A.mute", false)],
            false,
            1,
        );

        // A.mute failed to read this time
        ChangeDetector::detect(&mut snapshot, &[reading("A.gain", 1.0)], false, 2);
        let mute = snapshot.get("A.mute").unwrap();
        assert_eq!(mute.value, ControlValue::Bool(false));
        assert_eq!(mute.observed_at_ms, 1);
    }

    #[test]
    fn test_cleared_snapshot_reports_again() {
        let mut snapshot = Snapshot::new();
        let readings = vec![reading("A.gain", 1.0)];
        ChangeDetector::detect(&mut snapshot, &readings, false, 1);
        snapshot.clear();

        let changes = ChangeDetector::detect(&mut snapshot, &readings, false, 2);
        assert_eq!(changes.len(), 1);
    }
}
