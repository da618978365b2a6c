//! Wire protocol between the canvas authority and its clients.
//!
//! One serde schema, two encodings:
//! ```text
//! Binary frame ── bincode (size-limited)     ── native clients (default)
//! Text frame   ── JSON, externally tagged    ── browser clients
//! ```
//!
//! JSON examples:
//! ```text
//! {"join":{"id":"p1"}}
//! {"cellChange":{"x":5,"y":5,"color":"#FF0000","player":"p1","kind":"paint"}}
//! {"playerLeft":{"id":"p1"}}
//! "ping"
//! ```
//!
//! Every payload is validated while decoding: colors must be hex, player ids
//! must be 1-64 printable characters, and `cellChange` refuses unknown
//! fields. Anything that fails is [`ProtocolError::Malformed`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use pixboard_core::{Color, Coord, GridError, GridSnapshot, Region};

use crate::presence::Player;

/// Longest accepted player id, in characters.
pub const MAX_PLAYER_ID_LEN: usize = 64;

/// Decode limit for binary client frames. A `join` or `cellChange` is a few
/// dozen bytes.
pub const MAX_CLIENT_FRAME_BYTES: usize = 4 * 1024;

/// Decode limit for binary server frames, bounded by the largest `init`.
pub const MAX_SERVER_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on the encoded size of one grid cell inside `init`.
pub const INIT_BYTES_PER_CELL: usize = 16;

/// Transport-session identity, assigned by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen player identity. Opaque; uniqueness is not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        let len = id.chars().count();
        if len == 0 || len > MAX_PLAYER_ID_LEN {
            return Err(ProtocolError::Malformed(format!(
                "player id must be 1-{MAX_PLAYER_ID_LEN} characters, got {len}"
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ProtocolError::Malformed(
                "player id contains control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PlayerId {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<PlayerId> for String {
    fn from(id: PlayerId) -> Self {
        id.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a mutation is a fresh paint or the undo of an earlier one.
/// Tallies go up for paints and down for undos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    #[default]
    Paint,
    Undo,
}

/// Single-cell mutation.
///
/// Client → authority it is a proposal; `player` is ignored and replaced by
/// the sender's registered id. Authority → clients it is the applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CellChange {
    pub x: Coord,
    pub y: Coord,
    pub color: Color,
    #[serde(default)]
    pub player: Option<PlayerId>,
    #[serde(default)]
    pub kind: ChangeKind,
}

impl CellChange {
    pub fn paint(x: Coord, y: Coord, color: Color) -> Self {
        Self { x, y, color, player: None, kind: ChangeKind::Paint }
    }

    pub fn undo(x: Coord, y: Coord, color: Color) -> Self {
        Self { x, y, color, player: None, kind: ChangeKind::Undo }
    }

    pub fn with_player(mut self, player: Option<PlayerId>) -> Self {
        self.player = player;
        self
    }
}

/// Late-joiner catch-up: everything a fresh client needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    /// `grid[y][x]`, including cells outside the editable region.
    pub grid: GridSnapshot,
    /// Online player ids. `None` when presence is disabled.
    #[serde(default)]
    pub players: Option<Vec<PlayerId>>,
    /// Paint tallies of online players. `None` when presence is disabled.
    #[serde(default)]
    pub leaderboard: Option<Vec<Player>>,
    #[serde(default)]
    pub editable_region: Option<Region>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    OutOfBounds,
    OutsideEditableRegion,
}

impl RejectReason {
    /// Reason to report for a failed `set`, if the error is one a client
    /// can cause.
    pub fn from_grid_error(err: &GridError) -> Option<Self> {
        match err {
            GridError::OutOfBounds { .. } => Some(Self::OutOfBounds),
            GridError::OutsideEditableRegion { .. } => Some(Self::OutsideEditableRegion),
            _ => None,
        }
    }
}

/// Negative acknowledgment for a refused `cellChange`, sent only to the
/// originator and only under the acknowledge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub x: Coord,
    pub y: Coord,
    pub kind: ChangeKind,
    pub reason: RejectReason,
}

/// Client → authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Announce the player id for this connection.
    Join { id: PlayerId },
    CellChange(CellChange),
    Ping,
}

/// Authority → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerMessage {
    Init(InitPayload),
    CellChange(CellChange),
    PlayerJoined { id: PlayerId },
    PlayerLeft { id: PlayerId },
    Rejected(Rejection),
    Pong,
}

impl ServerMessage {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::CellChange(_) => "cellChange",
            Self::PlayerJoined { .. } => "playerJoined",
            Self::PlayerLeft { .. } => "playerLeft",
            Self::Rejected(_) => "rejected",
            Self::Pong => "pong",
        }
    }
}

/// Which encoding a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

impl WireFormat {
    /// Pick the format from an upgrade-request query string
    /// (`format=json` or `format=binary`). Defaults to binary.
    pub fn from_query(query: Option<&str>) -> Self {
        query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "format")
            .map_or(Self::Binary, |(_, v)| match v {
                "json" => Self::Json,
                _ => Self::Binary,
            })
    }

    pub fn query_value(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }
}

/// An encoded message, ready for a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Binary(b) => b.len(),
            Frame::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Text(text) => Message::Text(text.into()),
        }
    }
}

fn encode_frame<T: Serialize>(value: &T, format: WireFormat) -> Result<Frame, ProtocolError> {
    match format {
        WireFormat::Binary => bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map(Frame::Binary)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
        WireFormat::Json => serde_json::to_string(value)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
    }
}

/// Length prefixes are checked against `LIMIT` before anything is allocated.
fn decode_binary<T: DeserializeOwned, const LIMIT: usize>(
    bytes: &[u8],
) -> Result<T, ProtocolError> {
    if bytes.len() > LIMIT {
        return Err(ProtocolError::Malformed(format!(
            "frame of {} bytes exceeds {LIMIT}",
            bytes.len()
        )));
    }
    let config = bincode::config::standard().with_limit::<LIMIT>();
    let (value, read) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after message",
            bytes.len() - read
        )));
    }
    Ok(value)
}

fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

impl ClientMessage {
    pub fn encode(&self, format: WireFormat) -> Result<Frame, ProtocolError> {
        encode_frame(self, format)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary::<_, MAX_CLIENT_FRAME_BYTES>(bytes)
    }

    pub fn decode_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

impl ServerMessage {
    pub fn encode(&self, format: WireFormat) -> Result<Frame, ProtocolError> {
        encode_frame(self, format)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary::<_, MAX_SERVER_FRAME_BYTES>(bytes)
    }

    pub fn decode_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
