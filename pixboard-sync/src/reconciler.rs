//! Client-side mirror of the canvas.
//!
//! Local paints apply immediately and are remembered on an undo stack as
//! `{x, y, previous}`. Server messages are folded in as they arrive:
//!
//! ```text
//! init          replace mirror, roster, tallies; clear undo stack
//! cellChange    set one cell, adjust attributed tally
//! playerJoined  roster += id
//! playerLeft    roster -= id
//! rejected      undo the latest local paint of that cell
//! ```
//!
//! The undo stack only knows this client's own paints. Undoing restores the
//! color the cell had before *our* paint, even if someone else has painted it
//! since.

use std::collections::BTreeMap;
use thiserror::Error;

use pixboard_core::{Color, Coord, GridError, GridStore};

use crate::presence::{rank, Player};
use crate::protocol::{
    CellChange, ChangeKind, ClientMessage, InitPayload, PlayerId, Rejection, ServerMessage,
};

/// One local paint, enough to take it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoRecord {
    pub x: Coord,
    pub y: Coord,
    pub previous: Color,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("received {0} before init")]
    NotInitialized(&'static str),
}

pub struct ClientReconciler {
    grid: GridStore,
    player: Option<PlayerId>,
    /// Online players and their tallies; the roster is the key set.
    tallies: BTreeMap<PlayerId, u64>,
    undo_stack: Vec<UndoRecord>,
    initialized: bool,
}

impl ClientReconciler {
    /// `grid` must be built from the same canvas settings as the server's;
    /// its editable region is what local paints are checked against.
    pub fn new(grid: GridStore, player: Option<PlayerId>) -> Self {
        Self {
            grid,
            player,
            tallies: BTreeMap::new(),
            undo_stack: Vec::new(),
            initialized: false,
        }
    }

    pub fn grid(&self) -> &GridStore {
        &self.grid
    }

    pub fn player(&self) -> Option<&PlayerId> {
        self.player.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn roster(&self) -> Vec<PlayerId> {
        self.tallies.keys().cloned().collect()
    }

    pub fn pixels_painted(&self, player: &PlayerId) -> Option<u64> {
        self.tallies.get(player).copied()
    }

    pub fn leaderboard(&self) -> Vec<Player> {
        rank(self.tallies.iter().map(|(id, count)| Player {
            id: id.clone(),
            pixels_painted: *count,
        }))
    }

    pub fn apply(&mut self, message: &ServerMessage) -> Result<(), ReconcileError> {
        if !self.initialized && !matches!(message, ServerMessage::Init(_) | ServerMessage::Pong) {
            return Err(ReconcileError::NotInitialized(message.label()));
        }
        match message {
            ServerMessage::Init(payload) => self.apply_init(payload)?,
            ServerMessage::CellChange(change) => self.apply_change(change)?,
            ServerMessage::PlayerJoined { id } => {
                self.tallies.entry(id.clone()).or_insert(0);
            }
            ServerMessage::PlayerLeft { id } => {
                self.tallies.remove(id);
            }
            ServerMessage::Rejected(rejection) => self.rollback(rejection),
            ServerMessage::Pong => {}
        }
        Ok(())
    }

    /// Paint locally and return the message to send.
    ///
    /// Fails, with nothing changed, on the same conditions the authority
    /// would refuse.
    pub fn paint(&mut self, x: Coord, y: Coord, color: Color) -> Result<ClientMessage, GridError> {
        let previous = self.grid.set(x, y, color)?;
        self.undo_stack.push(UndoRecord { x, y, previous });
        if let Some(player) = &self.player {
            *self.tallies.entry(player.clone()).or_insert(0) += 1;
        }
        Ok(ClientMessage::CellChange(
            CellChange::paint(x, y, color).with_player(self.player.clone()),
        ))
    }

    /// Take back the latest local paint. `None` when there is nothing to undo.
    pub fn undo(&mut self) -> Option<ClientMessage> {
        let record = self.undo_stack.pop()?;
        if let Err(e) = self.grid.set(record.x, record.y, record.previous) {
            log::warn!("Dropping undo record {:?}: {}", record, e);
            return None;
        }
        self.decrement_own_tally();
        Some(ClientMessage::CellChange(
            CellChange::undo(record.x, record.y, record.previous).with_player(self.player.clone()),
        ))
    }

    fn apply_init(&mut self, payload: &InitPayload) -> Result<(), ReconcileError> {
        self.grid.replace(&payload.grid)?;
        if payload.editable_region != self.grid.editable_region() {
            log::warn!(
                "Server editable region {:?} differs from local {:?}",
                payload.editable_region,
                self.grid.editable_region()
            );
        }

        self.tallies.clear();
        for id in payload.players.iter().flatten() {
            self.tallies.insert(id.clone(), 0);
        }
        for entry in payload.leaderboard.iter().flatten() {
            self.tallies.insert(entry.id.clone(), entry.pixels_painted);
        }
        if let Some(player) = &self.player {
            self.tallies.entry(player.clone()).or_insert(0);
        }

        self.undo_stack.clear();
        self.initialized = true;
        Ok(())
    }

    fn apply_change(&mut self, change: &CellChange) -> Result<(), ReconcileError> {
        self.grid.set(change.x, change.y, change.color)?;
        if let Some(count) = change.player.as_ref().and_then(|p| self.tallies.get_mut(p)) {
            match change.kind {
                ChangeKind::Paint => *count += 1,
                ChangeKind::Undo => *count = count.saturating_sub(1),
            }
        }
        Ok(())
    }

    fn rollback(&mut self, rejection: &Rejection) {
        if rejection.kind == ChangeKind::Undo {
            // The undo record is already gone; the mirror stays diverged
            // until the next init.
            log::debug!("Undo at ({}, {}) was rejected", rejection.x, rejection.y);
            return;
        }
        let Some(pos) = self
            .undo_stack
            .iter()
            .rposition(|r| r.x == rejection.x && r.y == rejection.y)
        else {
            log::debug!("No local paint at ({}, {}) to roll back", rejection.x, rejection.y);
            return;
        };
        let record = self.undo_stack.remove(pos);
        if let Err(e) = self.grid.set(record.x, record.y, record.previous) {
            log::warn!("Rollback at ({}, {}) failed: {}", record.x, record.y, e);
        }
        self.decrement_own_tally();
    }

    fn decrement_own_tally(&mut self) {
        if let Some(count) = self.player.as_ref().and_then(|p| self.tallies.get_mut(p)) {
            *count = count.saturating_sub(1);
        }
    }
}
