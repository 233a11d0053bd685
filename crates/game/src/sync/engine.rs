use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::net::{Connection, ConnectionRegistry, Message, StateEntry, StateUpdate};
use crate::session::{ConsistencyError, MultiverseId, PlayerId, SessionDirectory};

use super::store::{BucketOwner, StateStore, StoreError};
use super::strategy::{NotifyRule, StrategyRegistry};
use super::{ShareScope, StateAddress};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one `apply_update`. A pass-through (no strategy, or no
/// bucket) and a refused admit gate both come back untriggered; the raw
/// incoming value is still available to the caller for local bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub address: StateAddress,
    pub sent: f64,
    pub old: Option<f64>,
    pub merged: f64,
    pub triggered: bool,
    pub rule: Option<(NotifyRule, ShareScope)>,
}

impl UpdateOutcome {
    fn pass_through(address: StateAddress, sent: f64) -> Self {
        Self {
            address,
            sent,
            old: None,
            merged: sent,
            triggered: false,
            rule: None,
        }
    }
}

/// Conflict resolution and broadcast-audience decisions for scoped state.
pub struct SyncEngine {
    store: Arc<dyn StateStore>,
    directory: Arc<SessionDirectory>,
    strategies: Mutex<HashMap<MultiverseId, Arc<StrategyRegistry>>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn StateStore>, directory: Arc<SessionDirectory>) -> Self {
        Self {
            store,
            directory,
            strategies: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The session's active rule set, built on first use and cached until
    /// invalidated. `build` runs without the cache lock held so it may
    /// consult the session's handler; if two callers race, the first
    /// inserted rule set wins.
    pub fn strategies_for(
        &self,
        multiverse: MultiverseId,
        build: impl FnOnce() -> StrategyRegistry,
    ) -> Arc<StrategyRegistry> {
        if let Some(rules) = self.strategies.lock().unwrap().get(&multiverse) {
            return Arc::clone(rules);
        }
        let built = Arc::new(build());
        let mut cache = self.strategies.lock().unwrap();
        Arc::clone(cache.entry(multiverse).or_insert(built))
    }

    /// Drops the cached rule set; called whenever session membership
    /// changes.
    pub fn invalidate(&self, multiverse: MultiverseId) {
        self.strategies.lock().unwrap().remove(&multiverse);
    }

    /// The bucket a strategy's scope resolves to, relative to the
    /// sender's position. Player-scoped values persist in the sender's
    /// world bucket; the scope only narrows the audience.
    fn owner_for(
        &self,
        multiverse: MultiverseId,
        sender: PlayerId,
        scope: ShareScope,
    ) -> Result<BucketOwner, ConsistencyError> {
        match scope {
            ShareScope::Multiverse => Ok(BucketOwner::Multiverse(multiverse)),
            ShareScope::Player | ShareScope::World | ShareScope::Universe => {
                let (universe, world) = self
                    .directory
                    .locate(multiverse, sender)
                    .ok_or(ConsistencyError::NotAMember {
                        multiverse,
                        player: sender,
                    })?;
                Ok(match scope {
                    ShareScope::Universe => BucketOwner::Universe(universe),
                    _ => BucketOwner::World(world),
                })
            }
        }
    }

    /// Applies one incoming value against the owning bucket as a single
    /// atomic unit: resolve strategy, evaluate the admit gate, merge,
    /// persist.
    pub fn apply_update(
        &self,
        rules: &StrategyRegistry,
        multiverse: MultiverseId,
        sender: PlayerId,
        address: StateAddress,
        incoming: f64,
    ) -> Result<UpdateOutcome, EngineError> {
        let Some(strategy) = rules.get(&address).copied() else {
            return Ok(UpdateOutcome::pass_through(address, incoming));
        };

        let owner = self.owner_for(multiverse, sender, strategy.scope)?;

        let mut triggered = false;
        let mut merged = incoming;
        let result = self.store.merge(owner, &address, &mut |old| {
            if !strategy.admit.admit(old, incoming) {
                triggered = false;
                return None;
            }
            triggered = true;
            merged = strategy.merge.merge(old.unwrap_or(incoming), incoming);
            Some(merged)
        });

        match result {
            Ok(outcome) => Ok(UpdateOutcome {
                address,
                sent: incoming,
                old: outcome.old,
                merged,
                triggered,
                rule: triggered.then_some((strategy.notify, strategy.scope)),
            }),
            // the owning granularity has no bucket yet: pass through
            Err(StoreError::MissingBucket(_)) => {
                Ok(UpdateOutcome::pass_through(address, incoming))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn apply_entries(
        &self,
        rules: &StrategyRegistry,
        multiverse: MultiverseId,
        sender: PlayerId,
        entries: &[StateEntry],
    ) -> Result<Vec<UpdateOutcome>, EngineError> {
        entries
            .iter()
            .map(|entry| {
                self.apply_update(
                    rules,
                    multiverse,
                    sender,
                    StateAddress::new(&entry.group, &entry.name),
                    entry.value(),
                )
            })
            .collect()
    }

    /// Turns a batch of outcomes into deliveries: sender echoes coalesce
    /// into one message, scope-wide broadcasts are grouped per scope, and
    /// multiverse-scoped results also reach the session's observers.
    pub fn publish(
        &self,
        registry: &ConnectionRegistry,
        multiverse: MultiverseId,
        sender: PlayerId,
        sender_conn: Option<&Arc<Connection>>,
        outcomes: &[UpdateOutcome],
    ) -> Result<(), EngineError> {
        let mut echo: Vec<StateEntry> = Vec::new();
        let mut broadcasts: HashMap<ShareScope, Vec<StateEntry>> = HashMap::new();

        for outcome in outcomes {
            let Some((notify, scope)) = outcome.rule else {
                continue;
            };
            if !outcome.triggered {
                continue;
            }
            let entry =
                StateEntry::new(&outcome.address.group, &outcome.address.name, outcome.merged);

            let echo_sender = match notify {
                NotifyRule::All => true,
                NotifyRule::Different => outcome.merged != outcome.sent,
                NotifyRule::Others | NotifyRule::None => false,
            };
            if echo_sender {
                echo.push(entry.clone());
            }

            let broadcast = match notify {
                NotifyRule::All => true,
                NotifyRule::Different | NotifyRule::Others => {
                    Some(outcome.merged) != outcome.old
                }
                NotifyRule::None => false,
            };
            if broadcast {
                broadcasts.entry(scope).or_default().push(entry);
            }
        }

        if !echo.is_empty() {
            if let Some(conn) = sender_conn {
                let message = Message::StateUpdate(StateUpdate {
                    scope: ShareScope::Player,
                    entries: echo,
                });
                if let Err(e) = conn.send(&message) {
                    log::warn!("state echo to player {sender} failed: {e}");
                }
            }
        }

        for (scope, entries) in broadcasts {
            let message = Message::StateUpdate(StateUpdate { scope, entries });
            registry.to_players(scope, multiverse, sender, true, &message)?;
            if scope == ShareScope::Multiverse {
                registry.to_observers(multiverse, false, &message);
            }
        }
        Ok(())
    }
}
