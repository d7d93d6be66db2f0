//! Confirmation table — who has acknowledged the current stop.
//!
//! Every rebalance run gets a fresh epoch. Confirmations carry the
//! epoch of the `StopAll` they answer, so a late confirmation from an
//! earlier run can never complete a newer one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::MemberId;

/// Per-run mapping `member → confirmed`, tagged with the run epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationTable {
    epoch: u64,
    entries: BTreeMap<MemberId, bool>,
}

impl ConfirmationTable {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start a new run: bump the epoch and expect one confirmation per
    /// member. Returns the new epoch.
    pub fn reset(&mut self, expected: &[MemberId]) -> u64 {
        self.epoch += 1;
        self.entries = expected.iter().map(|m| (m.clone(), false)).collect();
        self.epoch
    }

    /// Record a confirmation. Returns `true` only if it changed the table;
    /// stale epochs, unknown members and repeats are no-ops.
    pub fn confirm(&mut self, epoch: u64, member: &MemberId) -> bool {
        if epoch != self.epoch {
            return false;
        }
        match self.entries.get_mut(member) {
            Some(confirmed) if !*confirmed => {
                *confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// Whether every expected member of the current run has confirmed.
    ///
    /// A run always populates the table before this is evaluated.
    pub fn is_complete(&self) -> bool {
        self.entries.values().all(|confirmed| *confirmed)
    }

    /// Members that have not confirmed yet.
    pub fn pending(&self) -> Vec<MemberId> {
        self.entries
            .iter()
            .filter(|(_, confirmed)| !**confirmed)
            .map(|(member, _)| member.clone())
            .collect()
    }

    /// Drop all entries, keeping the epoch.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, member: &MemberId) -> Option<bool> {
        self.entries.get(member).copied()
    }

    /// Keep epochs monotonic when adopting a table from another node.
    pub(crate) fn raise_epoch(&mut self, floor: u64) {
        self.epoch = self.epoch.max(floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> Vec<MemberId> {
        names.iter().map(|n| MemberId::from(*n)).collect()
    }

    #[test]
    fn reset_populates_all_false() {
        let mut table = ConfirmationTable::default();
        let epoch = table.reset(&members(&["a", "b", "c"]));

        assert_eq!(epoch, 1);
        assert_eq!(table.len(), 3);
        assert!(!table.is_complete());
        assert_eq!(table.pending(), members(&["a", "b", "c"]));
    }

    #[test]
    fn confirm_completes_table() {
        let mut table = ConfirmationTable::default();
        let epoch = table.reset(&members(&["a", "b"]));

        assert!(table.confirm(epoch, &"a".into()));
        assert!(!table.is_complete());
        assert!(table.confirm(epoch, &"b".into()));
        assert!(table.is_complete());
    }

    #[test]
    fn repeated_and_unknown_confirmations_are_noops() {
        let mut table = ConfirmationTable::default();
        let epoch = table.reset(&members(&["a"]));

        assert!(table.confirm(epoch, &"a".into()));
        assert!(!table.confirm(epoch, &"a".into()));
        assert!(!table.confirm(epoch, &"z".into()));
        assert_eq!(table.get(&"z".into()), None);
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let mut table = ConfirmationTable::default();
        let old = table.reset(&members(&["a", "b"]));
        let new = table.reset(&members(&["a", "b"]));

        assert!(!table.confirm(old, &"a".into()));
        assert_eq!(table.get(&"a".into()), Some(false));
        assert!(table.confirm(new, &"a".into()));
    }

    #[test]
    fn clear_keeps_epoch() {
        let mut table = ConfirmationTable::default();
        table.reset(&members(&["a"]));
        table.reset(&members(&["a"]));
        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.epoch(), 2);
    }
}
