//! Player presence and paint tallies.
//!
//! ```text
//! ConnectionId ──► PlayerId ──► PlayerEntry { pixels_painted, connections }
//!   (private)        (public)
//! ```
//!
//! Connections are the internal key; everything the outside world sees is
//! keyed by player id. Several connections may claim the same id (two tabs,
//! or two people picking the same name). They share one tally, and the
//! player only disappears when the last of those connections leaves.
//!
//! Ordering is stable: players are kept in a `BTreeMap`, so roster order is
//! id order and leaderboard ties fall back to id order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::protocol::{ConnectionId, PlayerId};

/// A player as exposed on the wire and in leaderboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub pixels_painted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("connection {connection} already joined as {player}")]
    AlreadyJoined {
        connection: ConnectionId,
        player: PlayerId,
    },
    #[error("player {0} is not joined")]
    NotJoined(PlayerId),
}

#[derive(Debug, Clone, Default)]
struct PlayerEntry {
    pixels_painted: u64,
    connections: usize,
}

/// Authority-side registry of who is online and how much they painted.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    connections: HashMap<ConnectionId, PlayerId>,
    players: BTreeMap<PlayerId, PlayerEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `player` to `connection`.
    ///
    /// A connection holds at most one identity for its whole lifetime.
    pub fn join(&mut self, connection: ConnectionId, player: PlayerId) -> Result<(), PresenceError> {
        if let Some(existing) = self.connections.get(&connection) {
            return Err(PresenceError::AlreadyJoined {
                connection,
                player: existing.clone(),
            });
        }
        self.players.entry(player.clone()).or_default().connections += 1;
        self.connections.insert(connection, player);
        Ok(())
    }

    /// Drop the connection's identity. Returns the player it held, if any.
    ///
    /// The player's entry (and tally) goes away with its last connection.
    pub fn leave(&mut self, connection: &ConnectionId) -> Option<PlayerId> {
        let player = self.connections.remove(connection)?;
        if let Some(entry) = self.players.get_mut(&player) {
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                self.players.remove(&player);
            }
        }
        Some(player)
    }

    /// Distinct online player ids, in id order.
    pub fn roster(&self) -> Vec<PlayerId> {
        self.players.keys().cloned().collect()
    }

    pub fn player_for(&self, connection: &ConnectionId) -> Option<&PlayerId> {
        self.connections.get(connection)
    }

    pub fn is_present(&self, player: &PlayerId) -> bool {
        self.players.contains_key(player)
    }

    pub fn pixels_painted(&self, player: &PlayerId) -> Option<u64> {
        self.players.get(player).map(|e| e.pixels_painted)
    }

    pub fn record_paint(&mut self, player: &PlayerId) -> Result<u64, PresenceError> {
        let entry = self
            .players
            .get_mut(player)
            .ok_or_else(|| PresenceError::NotJoined(player.clone()))?;
        entry.pixels_painted += 1;
        Ok(entry.pixels_painted)
    }

    /// Take back one paint. Never goes below zero.
    pub fn record_undo(&mut self, player: &PlayerId) -> Result<u64, PresenceError> {
        let entry = self
            .players
            .get_mut(player)
            .ok_or_else(|| PresenceError::NotJoined(player.clone()))?;
        entry.pixels_painted = entry.pixels_painted.saturating_sub(1);
        Ok(entry.pixels_painted)
    }

    /// Online players by tally, highest first.
    pub fn leaderboard(&self) -> Vec<Player> {
        rank(self.players.iter().map(|(id, entry)| Player {
            id: id.clone(),
            pixels_painted: entry.pixels_painted,
        }))
    }

    /// Number of live connections with an identity.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct online players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}

/// Sort players by tally, highest first. The sort is stable, so ties keep
/// the input order.
pub fn rank(players: impl IntoIterator<Item = Player>) -> Vec<Player> {
    let mut ranked: Vec<Player> = players.into_iter().collect();
    ranked.sort_by(|a, b| b.pixels_painted.cmp(&a.pixels_painted));
    ranked
}
