//! Session roster: multiverses (whole sessions) containing universes
//! (groups of worlds) containing worlds containing players.
//!
//! The directory is the membership source of truth for audience
//! resolution and bucket-owner lookup. Structural changes return a
//! [`SessionEvent`] that the caller routes into the active session
//! handler and uses to invalidate the cached strategy registry.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::sync::ShareScope;

pub type PlayerId = u64;
pub type WorldId = u64;
pub type UniverseId = u64;
pub type MultiverseId = u64;

/// Invariant violations: membership bookkeeping desynchronized from what
/// the caller believes. These fail loudly and are never absorbed.
#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
    #[error("unknown session {0}")]
    UnknownSession(MultiverseId),
    #[error("unknown universe {universe} in session {multiverse}")]
    UnknownUniverse {
        multiverse: MultiverseId,
        universe: UniverseId,
    },
    #[error("unknown world {world} in session {multiverse}")]
    UnknownWorld {
        multiverse: MultiverseId,
        world: WorldId,
    },
    #[error("player {player} is not a member of session {multiverse}")]
    NotAMember {
        multiverse: MultiverseId,
        player: PlayerId,
    },
    #[error("player {player} is already a member of session {multiverse}")]
    AlreadyMember {
        multiverse: MultiverseId,
        player: PlayerId,
    },
}

/// Structural changes fed into the handler lifecycle channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    WorldCreated {
        multiverse: MultiverseId,
        universe: UniverseId,
        world: WorldId,
    },
    WorldDeleted {
        multiverse: MultiverseId,
        universe: UniverseId,
        world: WorldId,
    },
    PlayerJoined {
        multiverse: MultiverseId,
        player: PlayerId,
        world: WorldId,
    },
    PlayerLeft {
        multiverse: MultiverseId,
        player: PlayerId,
    },
    PlayerMoved {
        multiverse: MultiverseId,
        player: PlayerId,
        from_world: WorldId,
        to_world: WorldId,
    },
    /// Operator-triggered debug event, forwarded verbatim to the handler.
    Debug {
        multiverse: MultiverseId,
        tag: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub mode: String,
    pub name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mode: "freeplay".to_string(),
            name: "Session".to_string(),
        }
    }
}

#[derive(Debug)]
struct World {
    players: Vec<PlayerId>,
}

#[derive(Debug)]
struct Universe {
    worlds: HashMap<WorldId, World>,
}

#[derive(Debug)]
struct Multiverse {
    settings: SessionSettings,
    universes: HashMap<UniverseId, Universe>,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    sessions: HashMap<MultiverseId, Multiverse>,
    // last-join-wins, mirrors the active-connection semantics
    player_sessions: HashMap<PlayerId, MultiverseId>,
}

#[derive(Debug, Default)]
pub struct SessionDirectory {
    inner: Mutex<DirectoryInner>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&self, multiverse: MultiverseId, settings: SessionSettings) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(&multiverse) {
            return false;
        }
        inner.sessions.insert(
            multiverse,
            Multiverse {
                settings,
                universes: HashMap::new(),
            },
        );
        true
    }

    pub fn session_exists(&self, multiverse: MultiverseId) -> bool {
        self.inner.lock().unwrap().sessions.contains_key(&multiverse)
    }

    pub fn mode(&self, multiverse: MultiverseId) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(&multiverse)
            .map(|m| m.settings.mode.clone())
    }

    pub fn create_world(
        &self,
        multiverse: MultiverseId,
        universe: UniverseId,
        world: WorldId,
    ) -> Result<SessionEvent, ConsistencyError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&multiverse)
            .ok_or(ConsistencyError::UnknownSession(multiverse))?;
        session
            .universes
            .entry(universe)
            .or_insert_with(|| Universe {
                worlds: HashMap::new(),
            })
            .worlds
            .insert(world, World { players: Vec::new() });
        Ok(SessionEvent::WorldCreated {
            multiverse,
            universe,
            world,
        })
    }

    pub fn delete_world(
        &self,
        multiverse: MultiverseId,
        universe: UniverseId,
        world: WorldId,
    ) -> Result<SessionEvent, ConsistencyError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&multiverse)
            .ok_or(ConsistencyError::UnknownSession(multiverse))?;
        let uni = session
            .universes
            .get_mut(&universe)
            .ok_or(ConsistencyError::UnknownUniverse {
                multiverse,
                universe,
            })?;
        uni.worlds
            .remove(&world)
            .ok_or(ConsistencyError::UnknownWorld { multiverse, world })?;
        Ok(SessionEvent::WorldDeleted {
            multiverse,
            universe,
            world,
        })
    }

    pub fn join(
        &self,
        multiverse: MultiverseId,
        player: PlayerId,
        world: WorldId,
    ) -> Result<SessionEvent, ConsistencyError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&multiverse)
            .ok_or(ConsistencyError::UnknownSession(multiverse))?;
        if session
            .universes
            .values()
            .any(|u| u.worlds.values().any(|w| w.players.contains(&player)))
        {
            return Err(ConsistencyError::AlreadyMember { multiverse, player });
        }
        let target = session
            .universes
            .values_mut()
            .find_map(|u| u.worlds.get_mut(&world))
            .ok_or(ConsistencyError::UnknownWorld { multiverse, world })?;
        target.players.push(player);
        inner.player_sessions.insert(player, multiverse);
        Ok(SessionEvent::PlayerJoined {
            multiverse,
            player,
            world,
        })
    }

    pub fn leave(
        &self,
        multiverse: MultiverseId,
        player: PlayerId,
    ) -> Result<SessionEvent, ConsistencyError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&multiverse)
            .ok_or(ConsistencyError::UnknownSession(multiverse))?;
        let mut found = false;
        for universe in session.universes.values_mut() {
            for world in universe.worlds.values_mut() {
                if let Some(pos) = world.players.iter().position(|&p| p == player) {
                    world.players.remove(pos);
                    found = true;
                }
            }
        }
        if !found {
            return Err(ConsistencyError::NotAMember { multiverse, player });
        }
        if inner.player_sessions.get(&player) == Some(&multiverse) {
            inner.player_sessions.remove(&player);
        }
        Ok(SessionEvent::PlayerLeft { multiverse, player })
    }

    pub fn move_player(
        &self,
        multiverse: MultiverseId,
        player: PlayerId,
        to_world: WorldId,
    ) -> Result<SessionEvent, ConsistencyError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&multiverse)
            .ok_or(ConsistencyError::UnknownSession(multiverse))?;
        let mut from_world = None;
        for universe in session.universes.values_mut() {
            for (&wid, world) in universe.worlds.iter_mut() {
                if let Some(pos) = world.players.iter().position(|&p| p == player) {
                    world.players.remove(pos);
                    from_world = Some(wid);
                }
            }
        }
        let from_world =
            from_world.ok_or(ConsistencyError::NotAMember { multiverse, player })?;
        let target = session
            .universes
            .values_mut()
            .find_map(|u| u.worlds.get_mut(&to_world))
            .ok_or(ConsistencyError::UnknownWorld {
                multiverse,
                world: to_world,
            })?;
        target.players.push(player);
        Ok(SessionEvent::PlayerMoved {
            multiverse,
            player,
            from_world,
            to_world,
        })
    }

    /// The session a player most recently joined, if any.
    pub fn session_of(&self, player: PlayerId) -> Option<MultiverseId> {
        self.inner.lock().unwrap().player_sessions.get(&player).copied()
    }

    /// Universe and world holding the player within the session.
    pub fn locate(
        &self,
        multiverse: MultiverseId,
        player: PlayerId,
    ) -> Option<(UniverseId, WorldId)> {
        let inner = self.inner.lock().unwrap();
        let session = inner.sessions.get(&multiverse)?;
        for (&uid, universe) in &session.universes {
            for (&wid, world) in &universe.worlds {
                if world.players.contains(&player) {
                    return Some((uid, wid));
                }
            }
        }
        None
    }

    pub fn players(&self, multiverse: MultiverseId) -> Vec<PlayerId> {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get(&multiverse) else {
            return Vec::new();
        };
        session
            .universes
            .values()
            .flat_map(|u| u.worlds.values())
            .flat_map(|w| w.players.iter().copied())
            .collect()
    }

    pub fn worlds(&self, multiverse: MultiverseId) -> Vec<(UniverseId, WorldId)> {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get(&multiverse) else {
            return Vec::new();
        };
        session
            .universes
            .iter()
            .flat_map(|(&uid, u)| u.worlds.keys().map(move |&wid| (uid, wid)))
            .collect()
    }

    /// The player-id audience for a scope, relative to `player`'s position
    /// in the session. Fails loudly when the player is not where the
    /// caller believes they are.
    pub fn members(
        &self,
        multiverse: MultiverseId,
        scope: ShareScope,
        player: PlayerId,
    ) -> Result<Vec<PlayerId>, ConsistencyError> {
        if scope == ShareScope::Player {
            return Ok(vec![player]);
        }
        let inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get(&multiverse)
            .ok_or(ConsistencyError::UnknownSession(multiverse))?;
        if scope == ShareScope::Multiverse {
            return Ok(session
                .universes
                .values()
                .flat_map(|u| u.worlds.values())
                .flat_map(|w| w.players.iter().copied())
                .collect());
        }
        for universe in session.universes.values() {
            for world in universe.worlds.values() {
                if world.players.contains(&player) {
                    return Ok(match scope {
                        ShareScope::World => world.players.clone(),
                        ShareScope::Universe => universe
                            .worlds
                            .values()
                            .flat_map(|w| w.players.iter().copied())
                            .collect(),
                        ShareScope::Player | ShareScope::Multiverse => unreachable!(),
                    });
                }
            }
        }
        Err(ConsistencyError::NotAMember { multiverse, player })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_world_session(directory: &SessionDirectory) {
        directory.create_session(1, SessionSettings::default());
        directory.create_world(1, 10, 100).unwrap();
        directory.create_world(1, 10, 101).unwrap();
        directory.create_world(1, 11, 110).unwrap();
        directory.join(1, 7, 100).unwrap();
        directory.join(1, 8, 100).unwrap();
        directory.join(1, 9, 101).unwrap();
        directory.join(1, 5, 110).unwrap();
    }

    #[test]
    fn scope_membership() {
        let directory = SessionDirectory::new();
        two_world_session(&directory);

        assert_eq!(directory.members(1, ShareScope::Player, 7).unwrap(), vec![7]);

        let mut world = directory.members(1, ShareScope::World, 7).unwrap();
        world.sort();
        assert_eq!(world, vec![7, 8]);

        let mut universe = directory.members(1, ShareScope::Universe, 7).unwrap();
        universe.sort();
        assert_eq!(universe, vec![7, 8, 9]);

        let mut all = directory.members(1, ShareScope::Multiverse, 7).unwrap();
        all.sort();
        assert_eq!(all, vec![5, 7, 8, 9]);
    }

    #[test]
    fn join_twice_is_a_consistency_error() {
        let directory = SessionDirectory::new();
        two_world_session(&directory);
        assert!(matches!(
            directory.join(1, 7, 101),
            Err(ConsistencyError::AlreadyMember { .. })
        ));
    }

    #[test]
    fn move_between_worlds() {
        let directory = SessionDirectory::new();
        two_world_session(&directory);

        let event = directory.move_player(1, 7, 110).unwrap();
        assert_eq!(
            event,
            SessionEvent::PlayerMoved {
                multiverse: 1,
                player: 7,
                from_world: 100,
                to_world: 110,
            }
        );
        assert_eq!(directory.locate(1, 7), Some((11, 110)));
    }

    #[test]
    fn leave_clears_session_index() {
        let directory = SessionDirectory::new();
        two_world_session(&directory);
        assert_eq!(directory.session_of(7), Some(1));
        directory.leave(1, 7).unwrap();
        assert_eq!(directory.session_of(7), None);
        assert!(matches!(
            directory.members(1, ShareScope::World, 7),
            Err(ConsistencyError::NotAMember { .. })
        ));
    }
}
