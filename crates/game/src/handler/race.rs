use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::net::{Message, Notice};
use crate::scheduler::Scheduler;
use crate::session::{PlayerId, SessionEvent};
use crate::sync::{
    MergeRule, NotifyRule, ShareScope, StateAddress, StrategyRegistry, SyncStrategy,
    default_registry,
};

use super::{GameplayMessage, HandlerContext, SessionHandler, SnapshotError};

/// First player to claim this many objectives wins the race.
const OBJECTIVES_TO_WIN: usize = 5;

const CLOCK_TICK: Duration = Duration::from_secs(1);

/// Everything a race needs to survive eviction and a process restart.
#[derive(Debug, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
struct RaceState {
    started: bool,
    elapsed_ms: u64,
    ready: Vec<PlayerId>,
    claims: Vec<(u32, PlayerId)>,
}

/// Objective race: everyone readies up, a shared match clock starts, the
/// first player to collect enough objectives posts the session's best
/// time.
pub struct RaceHandler {
    started: bool,
    ready: HashSet<PlayerId>,
    claims: HashMap<u32, PlayerId>,
    elapsed_ms: Arc<AtomicU64>,
    clock: Option<Scheduler>,
}

impl Default for RaceHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RaceHandler {
    pub fn new() -> Self {
        Self {
            started: false,
            ready: HashSet::new(),
            claims: HashMap::new(),
            elapsed_ms: Arc::new(AtomicU64::new(0)),
            clock: None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::Relaxed)
    }

    fn spawn_clock(&mut self) {
        let elapsed = Arc::clone(&self.elapsed_ms);
        self.clock = Some(Scheduler::start("race-clock", CLOCK_TICK, move || {
            elapsed.fetch_add(CLOCK_TICK.as_millis() as u64, Ordering::Relaxed);
        }));
    }

    fn announce(&self, ctx: &HandlerContext, text: &str) {
        let message = Message::Notice(Notice {
            text: text.to_string(),
        });
        // delivered to every member; a missing roster just logs
        if let Err(e) = ctx.registry.to_players(
            ShareScope::Multiverse,
            ctx.multiverse,
            0,
            false,
            &message,
        ) {
            log::warn!("race announcement in session {} failed: {e}", ctx.multiverse);
        }
        ctx.registry.to_observers(ctx.multiverse, false, &message);
    }

    fn claims_by(&self, player: PlayerId) -> usize {
        self.claims.values().filter(|&&p| p == player).count()
    }

    /// The session's rule set, rebuilt with this handler's overrides if
    /// a membership change dropped the cached one.
    fn active_rules(&self, ctx: &HandlerContext) -> Arc<StrategyRegistry> {
        ctx.engine.strategies_for(ctx.multiverse, || {
            let mut rules = default_registry();
            self.strategy_overrides(&mut rules);
            rules
        })
    }

    fn record_finish(&mut self, ctx: &HandlerContext, winner: PlayerId) {
        let finish_ms = self.elapsed_ms.load(Ordering::Relaxed);
        self.clock = None;

        let rules = self.active_rules(ctx);
        let address = StateAddress::new("race", "best_time");
        match ctx.engine.apply_update(
            &rules,
            ctx.multiverse,
            winner,
            address,
            finish_ms as f64,
        ) {
            Ok(outcome) => {
                let winner_conn = ctx.registry.active(winner);
                if let Err(e) = ctx.engine.publish(
                    &ctx.registry,
                    ctx.multiverse,
                    winner,
                    winner_conn.as_ref(),
                    std::slice::from_ref(&outcome),
                ) {
                    log::warn!("best-time publish failed: {e}");
                }
            }
            Err(e) => log::warn!("best-time update failed: {e}"),
        }

        self.announce(
            ctx,
            &format!("player {winner} finished the race in {finish_ms} ms"),
        );
    }
}

impl SessionHandler for RaceHandler {
    fn tag(&self) -> &'static str {
        "race"
    }

    fn start(&mut self, ctx: &HandlerContext) {
        log::info!(
            "race handler live for session {} (started={}, elapsed={}ms)",
            ctx.multiverse,
            self.started,
            self.elapsed_ms()
        );
        // a restored mid-race clock resumes from the persisted elapsed
        if self.started && self.clock.is_none() {
            self.spawn_clock();
        }
    }

    fn stop(&mut self, _ctx: &HandlerContext) {
        if let Some(clock) = self.clock.take() {
            clock.stop();
        }
    }

    fn serialize_state(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut ready: Vec<PlayerId> = self.ready.iter().copied().collect();
        ready.sort_unstable();
        let mut claims: Vec<(u32, PlayerId)> =
            self.claims.iter().map(|(&o, &p)| (o, p)).collect();
        claims.sort_unstable();
        let state = RaceState {
            started: self.started,
            elapsed_ms: self.elapsed_ms.load(Ordering::Relaxed),
            ready,
            claims,
        };
        rkyv::to_bytes::<rancor::Error>(&state)
            .map(|aligned| aligned.into_vec())
            .map_err(SnapshotError::Serialize)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let state = rkyv::from_bytes::<RaceState, rancor::Error>(bytes)
            .map_err(SnapshotError::Deserialize)?;
        self.started = state.started;
        self.elapsed_ms = Arc::new(AtomicU64::new(state.elapsed_ms));
        self.ready = state.ready.into_iter().collect();
        self.claims = state.claims.into_iter().collect();
        Ok(())
    }

    fn is_disposable(&self) -> bool {
        self.clock.is_none()
    }

    fn strategy_overrides(&self, rules: &mut StrategyRegistry) {
        rules.insert(
            StateAddress::new("race", "progress"),
            SyncStrategy::silent(MergeRule::Max, ShareScope::Universe),
        );
        rules.insert(
            StateAddress::new("race", "best_time"),
            SyncStrategy::new(MergeRule::Min, NotifyRule::Different, ShareScope::Multiverse),
        );
    }

    fn handle_message(
        &mut self,
        ctx: &HandlerContext,
        sender: PlayerId,
        message: &GameplayMessage,
    ) {
        match message {
            GameplayMessage::MatchReady => {
                if self.started {
                    return;
                }
                self.ready.insert(sender);
                let roster = ctx.directory.players(ctx.multiverse);
                let all_ready =
                    !roster.is_empty() && roster.iter().all(|p| self.ready.contains(p));
                if all_ready {
                    self.started = true;
                    self.spawn_clock();
                    self.announce(ctx, "race started");
                }
            }
            GameplayMessage::ObjectiveClaim { objective_id } => {
                if !self.started {
                    return;
                }
                if self.claims.contains_key(objective_id) {
                    return;
                }
                self.claims.insert(*objective_id, sender);
                self.announce(
                    ctx,
                    &format!("player {sender} claimed objective {objective_id}"),
                );

                let progress = self.claims_by(sender);
                let rules = self.active_rules(ctx);
                if let Err(e) = ctx.engine.apply_update(
                    &rules,
                    ctx.multiverse,
                    sender,
                    StateAddress::new("race", "progress"),
                    progress as f64,
                ) {
                    log::warn!("race progress update failed: {e}");
                }

                if progress >= OBJECTIVES_TO_WIN {
                    self.record_finish(ctx, sender);
                }
            }
        }
    }

    fn handle_event(&mut self, ctx: &HandlerContext, event: &SessionEvent) {
        match event {
            SessionEvent::PlayerLeft { player, .. } => {
                self.ready.remove(player);
                if !self.started {
                    return;
                }
                // last one out pauses the match clock so the session can
                // be evicted
                if ctx.directory.players(ctx.multiverse).is_empty() {
                    if let Some(clock) = self.clock.take() {
                        clock.stop();
                    }
                }
            }
            SessionEvent::Debug { tag, .. } if tag == "abort" => {
                if let Some(clock) = self.clock.take() {
                    clock.stop();
                }
                if self.started {
                    self.started = false;
                    self.ready.clear();
                    self.claims.clear();
                    self.elapsed_ms.store(0, Ordering::Relaxed);
                    self.announce(ctx, "race aborted");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::net::ConnectionRegistry;
    use crate::session::{SessionDirectory, SessionSettings};
    use crate::sync::{MemoryStore, StateStore, SyncEngine};

    use super::*;

    fn context(multiverse: u64) -> HandlerContext {
        let directory = Arc::new(SessionDirectory::new());
        directory.create_session(multiverse, SessionSettings::default());
        let store = Arc::new(MemoryStore::new()) as Arc<dyn StateStore>;
        HandlerContext {
            multiverse,
            engine: Arc::new(SyncEngine::new(store, Arc::clone(&directory))),
            registry: Arc::new(ConnectionRegistry::new(Arc::clone(&directory))),
            directory,
        }
    }

    #[test]
    fn abort_event_resets_a_running_race() {
        let ctx = context(1);
        let mut handler = RaceHandler::new();
        handler.started = true;
        handler.ready.insert(7);
        handler.claims.insert(3, 7);
        handler.elapsed_ms.store(12_000, Ordering::Relaxed);
        handler.spawn_clock();

        handler.handle_event(
            &ctx,
            &SessionEvent::Debug {
                multiverse: 1,
                tag: "abort".to_string(),
            },
        );

        assert!(!handler.started);
        assert!(handler.ready.is_empty());
        assert!(handler.claims.is_empty());
        assert_eq!(handler.elapsed_ms(), 0);
        assert!(handler.is_disposable());
    }

    #[test]
    fn snapshot_round_trip_preserves_the_race() {
        let mut handler = RaceHandler::new();
        handler.started = true;
        handler.elapsed_ms = Arc::new(AtomicU64::new(42_000));
        handler.ready.insert(7);
        handler.ready.insert(8);
        handler.claims.insert(3, 7);
        handler.claims.insert(9, 8);

        let bytes = handler.serialize_state().unwrap();
        let mut restored = RaceHandler::new();
        restored.restore_state(&bytes).unwrap();

        assert!(restored.started);
        assert_eq!(restored.elapsed_ms(), 42_000);
        assert_eq!(restored.ready, handler.ready);
        assert_eq!(restored.claims, handler.claims);
    }

    #[test]
    fn fresh_handler_is_disposable_a_running_one_is_not() {
        let mut handler = RaceHandler::new();
        assert!(handler.is_disposable());
        handler.spawn_clock();
        assert!(!handler.is_disposable());
        if let Some(clock) = handler.clock.take() {
            clock.stop();
        }
        assert!(handler.is_disposable());
    }

    #[test]
    fn overrides_force_race_addresses() {
        let handler = RaceHandler::new();
        let mut rules = StrategyRegistry::new();
        handler.strategy_overrides(&mut rules);
        let progress = rules
            .get(&StateAddress::new("race", "progress"))
            .copied()
            .unwrap();
        assert_eq!(progress.notify, NotifyRule::None);
        assert_eq!(progress.scope, ShareScope::Universe);
        let best = rules
            .get(&StateAddress::new("race", "best_time"))
            .copied()
            .unwrap();
        assert_eq!(best.merge, MergeRule::Min);
        assert_eq!(best.scope, ShareScope::Multiverse);
    }
}
