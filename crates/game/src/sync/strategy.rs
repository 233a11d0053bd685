use std::collections::HashMap;

use super::{ShareScope, StateAddress};

/// Combines the stored value with an incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    Max,
    Min,
    /// Merge returns the new value.
    Overwrite,
    /// Merge returns the old value; write-once guard.
    Keep,
    /// Arithmetic mean of old and new. Not associative under concurrent
    /// interleaving; documented approximation, not a running average.
    Avg,
}

impl MergeRule {
    pub fn merge(&self, old: f64, new: f64) -> f64 {
        match self {
            MergeRule::Max => old.max(new),
            MergeRule::Min => old.min(new),
            MergeRule::Overwrite => new,
            MergeRule::Keep => old,
            MergeRule::Avg => (old + new) / 2.0,
        }
    }
}

/// Gate evaluated before the merge. A refused update is "not triggered":
/// nothing is persisted and nothing is broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmitRule {
    #[default]
    Always,
    /// Refuse updates that would not change the stored value.
    Changed,
}

impl AdmitRule {
    pub fn admit(&self, old: Option<f64>, incoming: f64) -> bool {
        match self {
            AdmitRule::Always => true,
            AdmitRule::Changed => old != Some(incoming),
        }
    }
}

/// Who hears about a triggered merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyRule {
    /// Never broadcast, even when the persisted value changed.
    None,
    /// Echo to the sender only when merged != sent; broadcast to the rest
    /// of the scope only when merged != old.
    Different,
    /// Never echo; broadcast to the rest of the scope when merged != old.
    Others,
    /// Always echo, always broadcast.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStrategy {
    pub merge: MergeRule,
    pub admit: AdmitRule,
    pub notify: NotifyRule,
    pub scope: ShareScope,
}

impl SyncStrategy {
    pub fn new(merge: MergeRule, notify: NotifyRule, scope: ShareScope) -> Self {
        Self {
            merge,
            admit: AdmitRule::Always,
            notify,
            scope,
        }
    }

    /// Aggregation that never notifies anyone.
    pub fn silent(merge: MergeRule, scope: ShareScope) -> Self {
        Self::new(merge, NotifyRule::None, scope)
    }
}

/// One active rule set per live session, keyed by state address.
#[derive(Debug, Default, Clone)]
pub struct StrategyRegistry {
    rules: HashMap<StateAddress, SyncStrategy>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: StateAddress, strategy: SyncStrategy) {
        self.rules.insert(address, strategy);
    }

    pub fn get(&self, address: &StateAddress) -> Option<&SyncStrategy> {
        self.rules.get(address)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Built-in rules every session starts from. Handlers override or extend
/// these per address.
pub fn default_registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.insert(
        StateAddress::new("score", "total"),
        SyncStrategy::new(MergeRule::Overwrite, NotifyRule::All, ShareScope::World),
    );
    registry.insert(
        StateAddress::new("score", "best"),
        SyncStrategy::new(MergeRule::Max, NotifyRule::Different, ShareScope::Multiverse),
    );
    registry.insert(
        StateAddress::new("timer", "fastest"),
        SyncStrategy::new(MergeRule::Min, NotifyRule::Different, ShareScope::Multiverse),
    );
    registry.insert(
        StateAddress::new("progress", "completed"),
        SyncStrategy::new(MergeRule::Max, NotifyRule::Others, ShareScope::World),
    );
    registry.insert(
        StateAddress::new("session", "first_finish"),
        SyncStrategy::new(MergeRule::Keep, NotifyRule::Others, ShareScope::Multiverse),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_rules() {
        assert_eq!(MergeRule::Max.merge(3.0, 5.0), 5.0);
        assert_eq!(MergeRule::Max.merge(5.0, 3.0), 5.0);
        assert_eq!(MergeRule::Min.merge(3.0, 5.0), 3.0);
        assert_eq!(MergeRule::Overwrite.merge(3.0, 5.0), 5.0);
        assert_eq!(MergeRule::Keep.merge(3.0, 5.0), 3.0);
        assert_eq!(MergeRule::Avg.merge(3.0, 5.0), 4.0);
    }

    #[test]
    fn admit_changed_refuses_no_ops() {
        assert!(AdmitRule::Changed.admit(None, 1.0));
        assert!(AdmitRule::Changed.admit(Some(2.0), 1.0));
        assert!(!AdmitRule::Changed.admit(Some(1.0), 1.0));
        assert!(AdmitRule::Always.admit(Some(1.0), 1.0));
    }

    #[test]
    fn defaults_cover_known_addresses() {
        let registry = default_registry();
        assert!(registry.get(&StateAddress::new("score", "best")).is_some());
        assert!(registry.get(&StateAddress::new("score", "unknown")).is_none());
    }
}
