//! Serialized mutation and N-1 fan-out.
//!
//! ```text
//!                   ┌──────────── Mutex ────────────┐
//! cellChange(A) ──► │ GridStore::set → tally → send │ ──► broadcast::Sender
//!                   └───────────────────────────────┘          │
//!                                          ┌───────────────────┼───────────┐
//!                                          ▼                   ▼           ▼
//!                                  Subscription(A)     Subscription(B)   ...
//!                                   (skips own)           delivers
//! ```
//!
//! Grid and presence share one lock, and publishing happens while it is
//! held, so channel order is mutation order. `connect` snapshots and
//! subscribes under the same lock: a late joiner's `init` contains every
//! write published before it and none published after.
//!
//! Each subscriber buffers up to `broadcast_capacity` envelopes. One that
//! falls further behind gets `RecvError::Lagged` and should be dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex};

use pixboard_core::{Color, Coord, GridError, GridSnapshot, GridStore};

use crate::config::{RejectionPolicy, ServerConfig};
use crate::presence::{Player, PresenceError, PresenceRegistry};
use crate::protocol::{
    CellChange, ChangeKind, ConnectionId, InitPayload, PlayerId, RejectReason, Rejection,
    ServerMessage,
};

/// A published message and the connection that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `None` for messages every connection should see.
    pub origin: Option<ConnectionId>,
    pub message: ServerMessage,
}

/// Receiving end for one connection. Never yields its own connection's
/// envelopes.
pub struct Subscription {
    connection: ConnectionId,
    receiver: broadcast::Receiver<Arc<Envelope>>,
}

impl Subscription {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Next envelope from another connection. Cancel safe.
    pub async fn recv(&mut self) -> Result<Arc<Envelope>, RecvError> {
        loop {
            let envelope = self.receiver.recv().await?;
            if envelope.origin != Some(self.connection) {
                return Ok(envelope);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Arc<Envelope>, TryRecvError> {
        loop {
            let envelope = self.receiver.try_recv()?;
            if envelope.origin != Some(self.connection) {
                return Ok(envelope);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub presence: bool,
    pub rejection: RejectionPolicy,
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for HubConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            presence: config.presence,
            rejection: config.rejection,
            broadcast_capacity: config.broadcast_capacity,
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("presence is disabled on this canvas")]
    PresenceDisabled,
}

/// Counters for monitoring. Read with [`BroadcastHub::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub changes_applied: u64,
    pub changes_rejected: u64,
    pub messages_published: u64,
    pub subscribers: usize,
    /// Cells that differ from the background.
    pub painted_cells: usize,
    /// Distinct player ids online.
    pub players: usize,
    /// Connections that have joined with a player id.
    pub joined_connections: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    changes_applied: AtomicU64,
    changes_rejected: AtomicU64,
    messages_published: AtomicU64,
}

struct CanvasState {
    grid: GridStore,
    presence: PresenceRegistry,
}

/// The authority: owns the grid and the roster, and fans changes out.
pub struct BroadcastHub {
    state: Mutex<CanvasState>,
    sender: broadcast::Sender<Arc<Envelope>>,
    config: HubConfig,
    stats: AtomicHubStats,
}

impl BroadcastHub {
    pub fn new(grid: GridStore, config: HubConfig) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            state: Mutex::new(CanvasState {
                grid,
                presence: PresenceRegistry::new(),
            }),
            sender,
            config,
            stats: AtomicHubStats::default(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Open a subscription for `connection` and build its `init`.
    pub async fn connect(&self, connection: ConnectionId) -> (ServerMessage, Subscription) {
        let state = self.state.lock().await;
        let (players, leaderboard) = if self.config.presence {
            (
                Some(state.presence.roster()),
                Some(state.presence.leaderboard()),
            )
        } else {
            (None, None)
        };
        let init = ServerMessage::Init(InitPayload {
            grid: state.grid.snapshot(),
            players,
            leaderboard,
            editable_region: state.grid.editable_region(),
        });
        let subscription = Subscription {
            connection,
            receiver: self.sender.subscribe(),
        };
        (init, subscription)
    }

    /// Register the connection's player id.
    ///
    /// Returns `true` when the id was not present before, in which case
    /// `playerJoined` went out to every other connection.
    pub async fn join(&self, connection: ConnectionId, player: PlayerId) -> Result<bool, HubError> {
        if !self.config.presence {
            return Err(HubError::PresenceDisabled);
        }
        let mut state = self.state.lock().await;
        let first = !state.presence.is_present(&player);
        state.presence.join(connection, player.clone())?;
        if first {
            log::info!("Player {} joined", player);
            self.publish(Some(connection), ServerMessage::PlayerJoined { id: player });
        } else {
            log::debug!("Player {} opened another connection {}", player, connection);
        }
        Ok(first)
    }

    /// Validate and apply a mutation, then publish it to everyone else.
    ///
    /// The `player` field of `change` is replaced with the connection's
    /// registered id. On error nothing is applied or published.
    pub async fn cell_change(
        &self,
        connection: ConnectionId,
        change: CellChange,
    ) -> Result<CellChange, HubError> {
        let mut state = self.state.lock().await;
        let player = if self.config.presence {
            state.presence.player_for(&connection).cloned()
        } else {
            None
        };

        if let Err(e) = state.grid.set(change.x, change.y, change.color) {
            self.stats.changes_rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!("Rejected change from {}: {}", connection, e);
            return Err(e.into());
        }

        if let Some(player) = &player {
            match change.kind {
                ChangeKind::Paint => state.presence.record_paint(player)?,
                ChangeKind::Undo => state.presence.record_undo(player)?,
            };
        }

        let applied = change.with_player(player);
        log::debug!(
            "Applied {:?} ({}, {}) = {} from {}",
            applied.kind,
            applied.x,
            applied.y,
            applied.color,
            connection
        );
        self.stats.changes_applied.fetch_add(1, Ordering::Relaxed);
        self.publish(Some(connection), ServerMessage::CellChange(applied.clone()));
        Ok(applied)
    }

    /// The `rejected` reply owed to the originator of a refused change, if
    /// the policy asks for one.
    pub fn rejection_for(&self, change: &CellChange, err: &HubError) -> Option<ServerMessage> {
        if self.config.rejection != RejectionPolicy::Acknowledge {
            return None;
        }
        let HubError::Grid(grid_err) = err else {
            return None;
        };
        let reason = RejectReason::from_grid_error(grid_err)?;
        Some(ServerMessage::Rejected(Rejection {
            x: change.x,
            y: change.y,
            kind: change.kind,
            reason,
        }))
    }

    /// Drop the connection's presence. Publishes `playerLeft` once the
    /// player's last connection is gone. Painted cells stay.
    pub async fn disconnect(&self, connection: ConnectionId) -> Option<PlayerId> {
        let mut state = self.state.lock().await;
        let player = state.presence.leave(&connection)?;
        if !state.presence.is_present(&player) {
            log::info!("Player {} left", player);
            self.publish(Some(connection), ServerMessage::PlayerLeft { id: player.clone() });
        }
        Some(player)
    }

    pub async fn snapshot(&self) -> GridSnapshot {
        self.state.lock().await.grid.snapshot()
    }

    pub async fn cell(&self, x: Coord, y: Coord) -> Result<Color, GridError> {
        self.state.lock().await.grid.get(x, y)
    }

    pub async fn roster(&self) -> Vec<PlayerId> {
        self.state.lock().await.presence.roster()
    }

    pub async fn leaderboard(&self) -> Vec<Player> {
        self.state.lock().await.presence.leaderboard()
    }

    pub async fn pixels_painted(&self, player: &PlayerId) -> Option<u64> {
        self.state.lock().await.presence.pixels_painted(player)
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.lock().await;
        HubStats {
            changes_applied: self.stats.changes_applied.load(Ordering::Relaxed),
            changes_rejected: self.stats.changes_rejected.load(Ordering::Relaxed),
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
            painted_cells: state.grid.painted_cells(),
            players: state.presence.player_count(),
            joined_connections: state.presence.connection_count(),
        }
    }

    /// Caller must hold the state lock.
    fn publish(&self, origin: Option<ConnectionId>, message: ServerMessage) -> usize {
        let count = self
            .sender
            .send(Arc::new(Envelope { origin, message }))
            .unwrap_or(0);
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        count
    }
}
