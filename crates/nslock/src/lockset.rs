// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::lock::LockKind;
use crate::node::EntityKey;
use std::collections::HashMap;

/// Every entity locked by one transaction attempt, at its strongest kind.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    held: HashMap<EntityKey, LockKind>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `kind` on `key`, keeping the stronger of the old and new kind.
    ///
    /// Returns true when the record changed.
    pub fn record(&mut self, key: EntityKey, kind: LockKind) -> bool {
        match self.held.get_mut(&key) {
            Some(held) if *held >= kind => false,
            Some(held) => {
                *held = kind;
                true
            }
            None => {
                _ = self.held.insert(key, kind);
                true
            }
        }
    }

    /// True when `key` is held at `kind` or stronger.
    pub fn holds(&self, key: &EntityKey, kind: LockKind) -> bool {
        self.held.get(key).is_some_and(|held| *held >= kind)
    }

    pub fn kind_of(&self, key: &EntityKey) -> Option<LockKind> {
        self.held.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, LockKind)> {
        self.held.iter().map(|(key, kind)| (key, *kind))
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    #[test]
    fn test_strongest_kind_wins() {
        let key = EntityKey::Node(NodeId::new(3));
        let mut set = LockSet::new();

        assert!(set.record(key.clone(), LockKind::Read));
        assert!(!set.record(key.clone(), LockKind::ReadCommitted));
        assert_eq!(set.kind_of(&key), Some(LockKind::Read));

        assert!(set.record(key.clone(), LockKind::Write));
        assert!(!set.record(key.clone(), LockKind::Read));
        assert_eq!(set.kind_of(&key), Some(LockKind::Write));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_holds() {
        let key = EntityKey::Node(NodeId::new(1));
        let mut set = LockSet::new();
        assert!(!set.holds(&key, LockKind::ReadCommitted));
        _ = set.record(key.clone(), LockKind::Read);
        assert!(set.holds(&key, LockKind::ReadCommitted));
        assert!(set.holds(&key, LockKind::Read));
        assert!(!set.holds(&key, LockKind::Write));
    }
}
