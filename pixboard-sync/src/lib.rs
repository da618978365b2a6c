//! # pixboard-sync: Real-time sync layer for a shared pixel canvas
//!
//! One authority holds the canvas; every client mirrors it and paints
//! optimistically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient       │ ◄────────────────► │ SyncServer       │
//! │ + Reconciler     │  bincode or JSON   │ (one canvas)     │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │
//!          ▼                                       ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ GridStore        │                    │ BroadcastHub     │
//! │ (mirror + undo)  │                    │ GridStore        │
//! └──────────────────┘                    │ PresenceRegistry │
//!                                         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Message schema and its binary/JSON encodings
//! - [`presence`]: Who is online and how many pixels they painted
//! - [`broadcast`]: Serialized mutation and N-1 fan-out
//! - [`reconciler`]: Client mirror, undo stack, rejection rollback
//! - [`config`]: Server configuration (JSON file + environment)
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod broadcast;
pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, Envelope, HubConfig, HubError, HubStats, Subscription};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{CanvasConfig, ConfigError, RejectionPolicy, ServerConfig};
pub use presence::{Player, PresenceError, PresenceRegistry};
pub use protocol::{
    CellChange, ChangeKind, ClientMessage, ConnectionId, Frame, InitPayload, PlayerId,
    ProtocolError, RejectReason, Rejection, ServerMessage, WireFormat,
};
pub use reconciler::{ClientReconciler, ReconcileError, UndoRecord};
pub use server::{ServerStats, SyncServer};
