use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::session::MultiverseId;
use crate::sync::{StateStore, StrategyRegistry, default_registry};

use super::{HandlerContext, HandlerTable, SessionHandler};

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

pub type SharedHandler = Arc<Mutex<Box<dyn SessionHandler>>>;

struct CacheEntry {
    handler: SharedHandler,
    tag: &'static str,
    expires_at: Instant,
}

/// Live handlers keyed by session, with a sliding idle expiry. Eviction
/// is write-behind: a handler's state is snapshotted to the store on the
/// way out and restored on the next acquire.
pub struct HandlerCache {
    table: HandlerTable,
    store: Arc<dyn StateStore>,
    ttl: Duration,
    entries: Mutex<HashMap<MultiverseId, CacheEntry>>,
}

impl HandlerCache {
    pub fn new(table: HandlerTable, store: Arc<dyn StateStore>) -> Self {
        Self::with_ttl(table, store, DEFAULT_IDLE_TTL)
    }

    pub fn with_ttl(table: HandlerTable, store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self {
            table,
            store,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The live handler for the session, building (and restoring) one if
    /// none is cached. Every acquire pushes the expiry forward. `None`
    /// means the mode tag is unknown.
    pub fn acquire(&self, ctx: &HandlerContext, tag: &str) -> Option<SharedHandler> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&ctx.multiverse) {
            entry.expires_at = Instant::now() + self.ttl;
            return Some(Arc::clone(&entry.handler));
        }

        let mut handler = self.table.build(tag)?;
        let tag = handler.tag();

        match self.store.load_snapshot(ctx.multiverse, tag) {
            Ok(Some(bytes)) => {
                if let Err(e) = handler.restore_state(&bytes) {
                    // corrupted snapshot starts the session fresh
                    log::warn!(
                        "discarding snapshot for session {} ({tag}): {e}",
                        ctx.multiverse
                    );
                    handler = self.table.build(tag)?;
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!(
                "snapshot load for session {} ({tag}) failed: {e}",
                ctx.multiverse
            ),
        }

        let mut rules = default_registry();
        handler.strategy_overrides(&mut rules);
        ctx.engine.invalidate(ctx.multiverse);
        ctx.engine.strategies_for(ctx.multiverse, move || rules);

        handler.start(ctx);

        let shared: SharedHandler = Arc::new(Mutex::new(handler));
        entries.insert(
            ctx.multiverse,
            CacheEntry {
                handler: Arc::clone(&shared),
                tag,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Some(shared)
    }

    /// The built-in rule set with the live handler's overrides layered on
    /// top. The engine's rule-set cache must rebuild through this (not
    /// through `default_registry` alone), or a membership-change
    /// invalidation would silently drop the handler's strategies while the
    /// handler is still cached.
    pub fn layered_rules(&self, multiverse: MultiverseId) -> StrategyRegistry {
        let mut rules = default_registry();
        let handler = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(&multiverse)
                .map(|entry| Arc::clone(&entry.handler))
        };
        if let Some(handler) = handler {
            handler.lock().unwrap().strategy_overrides(&mut rules);
        }
        rules
    }

    /// Evicts expired disposable handlers, persisting their state first.
    /// A non-disposable handler gets another full lease instead.
    pub fn sweep(&self, ctx_for: &dyn Fn(MultiverseId) -> HandlerContext) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<MultiverseId> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(&mv, _)| mv)
            .collect();

        for multiverse in expired {
            let Some(entry) = entries.get_mut(&multiverse) else {
                continue;
            };
            let mut handler = entry.handler.lock().unwrap();
            if !handler.is_disposable() {
                entry.expires_at = now + self.ttl;
                continue;
            }
            let ctx = ctx_for(multiverse);
            handler.stop(&ctx);
            self.persist(multiverse, entry.tag, &**handler);
            drop(handler);
            entries.remove(&multiverse);
            ctx.engine.invalidate(multiverse);
            log::info!("evicted idle handler for session {multiverse}");
        }
    }

    /// Stops and persists every live handler. Used on server shutdown.
    pub fn shutdown(&self, ctx_for: &dyn Fn(MultiverseId) -> HandlerContext) {
        let mut entries = self.entries.lock().unwrap();
        for (&multiverse, entry) in entries.iter() {
            let mut handler = entry.handler.lock().unwrap();
            handler.stop(&ctx_for(multiverse));
            self.persist(multiverse, entry.tag, &**handler);
        }
        entries.clear();
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn persist(&self, multiverse: MultiverseId, tag: &str, handler: &dyn SessionHandler) {
        match handler.serialize_state() {
            Ok(bytes) => {
                if let Err(e) = self.store.save_snapshot(multiverse, tag, bytes) {
                    log::error!("snapshot save for session {multiverse} ({tag}) failed: {e}");
                }
            }
            Err(e) => {
                log::error!("snapshot of session {multiverse} ({tag}) failed: {e}");
            }
        }
    }
}
