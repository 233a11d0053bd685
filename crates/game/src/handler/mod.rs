mod cache;
mod freeplay;
mod race;

pub use cache::{HandlerCache, SharedHandler};
pub use freeplay::FreeplayHandler;
pub use race::RaceHandler;

use std::collections::HashMap;
use std::sync::Arc;

use rkyv::rancor;

use crate::net::ConnectionRegistry;
use crate::session::{MultiverseId, PlayerId, SessionDirectory, SessionEvent};
use crate::sync::{StrategyRegistry, SyncEngine};

/// Gameplay traffic routed to the session's handler. Everything else on
/// the wire is dealt with before this layer.
#[derive(Debug, Clone, PartialEq)]
pub enum GameplayMessage {
    ObjectiveClaim { objective_id: u32 },
    MatchReady,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("snapshot deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

/// Shared services a handler works against, bound to one session.
#[derive(Clone)]
pub struct HandlerContext {
    pub multiverse: MultiverseId,
    pub engine: Arc<SyncEngine>,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<SessionDirectory>,
}

/// Per-session game-mode logic. One live handler instance per active
/// session; the cache owns its lifecycle.
pub trait SessionHandler: Send {
    /// Stable mode tag, also the snapshot key.
    fn tag(&self) -> &'static str;

    /// Called once when the handler becomes live, after any snapshot
    /// restore.
    fn start(&mut self, ctx: &HandlerContext);

    /// Called before eviction or shutdown. Must leave the handler in a
    /// serializable state.
    fn stop(&mut self, ctx: &HandlerContext);

    fn serialize_state(&self) -> Result<Vec<u8>, SnapshotError>;

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError>;

    /// Whether the handler may be evicted right now. A handler running a
    /// live clock says no.
    fn is_disposable(&self) -> bool {
        true
    }

    /// Mode-specific amendments layered over the default rule set.
    fn strategy_overrides(&self, _rules: &mut StrategyRegistry) {}

    fn handle_message(&mut self, ctx: &HandlerContext, sender: PlayerId, message: &GameplayMessage);

    fn handle_event(&mut self, _ctx: &HandlerContext, _event: &SessionEvent) {}
}

type HandlerCtor = fn() -> Box<dyn SessionHandler>;

/// Maps a session's mode tag to a handler constructor.
#[derive(Default)]
pub struct HandlerTable {
    ctors: HashMap<&'static str, HandlerCtor>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: &'static str, ctor: HandlerCtor) {
        self.ctors.insert(tag, ctor);
    }

    pub fn build(&self, tag: &str) -> Option<Box<dyn SessionHandler>> {
        self.ctors.get(tag).map(|ctor| ctor())
    }
}

pub fn default_table() -> HandlerTable {
    let mut table = HandlerTable::new();
    table.register("race", || Box::new(RaceHandler::new()));
    table.register("freeplay", || Box::new(FreeplayHandler::new()));
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_builds_registered_modes() {
        let table = default_table();
        assert_eq!(table.build("race").map(|h| h.tag()), Some("race"));
        assert_eq!(table.build("freeplay").map(|h| h.tag()), Some("freeplay"));
        assert!(table.build("chess").is_none());
    }
}
