mod engine;
mod store;
mod strategy;

pub use engine::{EngineError, SyncEngine, UpdateOutcome};
pub use store::{BucketOwner, MemoryStore, MergeOutcome, StateStore, StoreError};
pub use strategy::{
    AdmitRule, MergeRule, NotifyRule, StrategyRegistry, SyncStrategy, default_registry,
};

/// Identifies one scalar of persistent game state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateAddress {
    pub group: String,
    pub name: String,
}

impl StateAddress {
    pub fn new(group: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for StateAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Breadth of audience for an aggregation and its broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ShareScope {
    #[default]
    Player = 0,
    World = 1,
    Universe = 2,
    Multiverse = 3,
}

impl ShareScope {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(ShareScope::Player),
            1 => Some(ShareScope::World),
            2 => Some(ShareScope::Universe),
            3 => Some(ShareScope::Multiverse),
            _ => None,
        }
    }
}
