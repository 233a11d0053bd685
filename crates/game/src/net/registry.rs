//! Process-wide directory of live connections.
//!
//! Maps players, sessions and observers to connections and performs
//! addressed best-effort fan-out. All maps live behind their own locks and
//! expose only atomic register/remove operations; fan-out snapshots the
//! recipient list before delivering so concurrent mutation never corrupts
//! an in-flight iteration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::{ConsistencyError, MultiverseId, PlayerId, SessionDirectory};
use crate::sync::ShareScope;

use super::connection::Connection;
use super::protocol::Message;

struct ObserverEntry {
    conn: Arc<Connection>,
    spectating: bool,
}

pub struct ConnectionRegistry {
    directory: Arc<SessionDirectory>,
    players: Mutex<HashMap<PlayerId, Arc<Connection>>>,
    channels: Mutex<HashMap<u16, Arc<Connection>>>,
    observers: Mutex<HashMap<MultiverseId, Vec<ObserverEntry>>>,
    player_observers: Mutex<HashMap<(Option<MultiverseId>, PlayerId), Vec<Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new(directory: Arc<SessionDirectory>) -> Self {
        Self {
            directory,
            players: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            player_observers: Mutex::new(HashMap::new()),
        }
    }

    /// Binds a player's active connection. Last write wins: a reconnect
    /// replaces the old entry without closing the superseded socket, which
    /// is left to fail on its next read or send.
    pub fn register_player(
        &self,
        player: PlayerId,
        conn: Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        let previous = self.players.lock().unwrap().insert(player, conn);
        if previous.is_some() {
            log::info!("player {player} reconnected; superseding previous connection");
        }
        previous
    }

    /// Removes the player binding only if it still points at `conn`, so a
    /// late teardown of a superseded socket cannot evict its replacement.
    pub fn unregister_player(&self, player: PlayerId, conn: &Arc<Connection>) {
        let mut players = self.players.lock().unwrap();
        if players
            .get(&player)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            players.remove(&player);
        }
    }

    pub fn active(&self, player: PlayerId) -> Option<Arc<Connection>> {
        self.players.lock().unwrap().get(&player).cloned()
    }

    pub fn register_channel(&self, id: u16, conn: Arc<Connection>) {
        self.channels.lock().unwrap().insert(id, conn);
    }

    pub fn unregister_channel(&self, id: u16) {
        self.channels.lock().unwrap().remove(&id);
    }

    pub fn by_channel(&self, id: u16) -> Option<Arc<Connection>> {
        self.channels.lock().unwrap().get(&id).cloned()
    }

    pub fn add_observer(&self, multiverse: MultiverseId, conn: Arc<Connection>, spectating: bool) {
        self.observers
            .lock()
            .unwrap()
            .entry(multiverse)
            .or_default()
            .push(ObserverEntry { conn, spectating });
    }

    pub fn add_player_observer(
        &self,
        multiverse: Option<MultiverseId>,
        player: PlayerId,
        conn: Arc<Connection>,
    ) {
        self.player_observers
            .lock()
            .unwrap()
            .entry((multiverse, player))
            .or_default()
            .push(conn);
    }

    /// Drops every observer registration held by `conn`. Called on close.
    pub fn purge_observer(&self, conn: &Arc<Connection>) {
        let mut observers = self.observers.lock().unwrap();
        for entries in observers.values_mut() {
            entries.retain(|e| !Arc::ptr_eq(&e.conn, conn));
        }
        observers.retain(|_, entries| !entries.is_empty());
        drop(observers);

        let mut player_observers = self.player_observers.lock().unwrap();
        for entries in player_observers.values_mut() {
            entries.retain(|c| !Arc::ptr_eq(c, conn));
        }
        player_observers.retain(|_, entries| !entries.is_empty());
    }

    /// Delivers to every member of `scope` relative to `sender`'s position
    /// in the session. A recipient is skipped when its connection is
    /// currently bound to a different session (stale cross-session
    /// filter). Returns the number of deliveries attempted.
    pub fn to_players(
        &self,
        scope: ShareScope,
        multiverse: MultiverseId,
        sender: PlayerId,
        exclude_sender: bool,
        message: &Message,
    ) -> Result<usize, ConsistencyError> {
        let members = self.directory.members(multiverse, scope, sender)?;
        let targets: Vec<Arc<Connection>> = {
            let players = self.players.lock().unwrap();
            members
                .iter()
                .filter(|&&p| !(exclude_sender && p == sender))
                .filter_map(|p| players.get(p).cloned())
                .collect()
        };

        let mut delivered = 0;
        for conn in targets {
            if conn.multiverse() != Some(multiverse) {
                continue;
            }
            deliver(&conn, message, "player");
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Delivers to every observer of the session, optionally only those
    /// flagged as spectating.
    pub fn to_observers(
        &self,
        multiverse: MultiverseId,
        spectators_only: bool,
        message: &Message,
    ) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let observers = self.observers.lock().unwrap();
            observers
                .get(&multiverse)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.spectating || !spectators_only)
                        .map(|e| Arc::clone(&e.conn))
                        .collect()
                })
                .unwrap_or_default()
        };
        for conn in &targets {
            deliver(conn, message, "observer");
        }
        targets.len()
    }

    /// Delivers to observers explicitly tracking `(multiverse, player)`,
    /// plus follow-the-player observers (`(None, player)`) when the
    /// player's most recent session is in fact this multiverse.
    pub fn to_player_observers(
        &self,
        multiverse: MultiverseId,
        player: PlayerId,
        message: &Message,
    ) -> usize {
        let follow_applies = self
            .active(player)
            .is_some_and(|conn| conn.multiverse() == Some(multiverse));

        let targets: Vec<Arc<Connection>> = {
            let player_observers = self.player_observers.lock().unwrap();
            let mut targets: Vec<Arc<Connection>> = player_observers
                .get(&(Some(multiverse), player))
                .cloned()
                .unwrap_or_default();
            if follow_applies {
                if let Some(followers) = player_observers.get(&(None, player)) {
                    targets.extend(followers.iter().cloned());
                }
            }
            targets
        };
        for conn in &targets {
            deliver(conn, message, "player observer");
        }
        targets.len()
    }

    /// Every live connection: active players plus observers. Used for the
    /// shutdown notice.
    pub fn broadcast_all(&self, message: &Message) {
        let mut targets: Vec<Arc<Connection>> =
            self.players.lock().unwrap().values().cloned().collect();
        {
            let observers = self.observers.lock().unwrap();
            targets.extend(
                observers
                    .values()
                    .flat_map(|entries| entries.iter().map(|e| Arc::clone(&e.conn))),
            );
        }
        for conn in &targets {
            deliver(conn, message, "shutdown");
        }
    }

    pub fn connected_players(&self) -> usize {
        self.players.lock().unwrap().len()
    }

    /// Snapshot of the active player connections. Used by the idle sweep.
    pub fn players_snapshot(&self) -> Vec<(PlayerId, Arc<Connection>)> {
        self.players
            .lock()
            .unwrap()
            .iter()
            .map(|(&player, conn)| (player, Arc::clone(conn)))
            .collect()
    }
}

/// One failed recipient never aborts delivery to the rest.
fn deliver(conn: &Arc<Connection>, message: &Message, audience: &str) {
    if let Err(e) = conn.send(message) {
        log::warn!("best-effort {audience} delivery failed: {e}");
    }
}
