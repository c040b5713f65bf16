//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON envelope `{"t": <tag>, "d": <payload | null>}`
//! with short fixed tags. Client and server tags live in separate
//! namespaces, so the same code can mean different things per direction.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// =============================================================================
// PLAYER ID
// =============================================================================

/// Opaque player identifier, as issued by the account service.
///
/// Implements Ord so registries can use BTreeMap.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PlayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// TAGS
// =============================================================================

/// Tags sent from client to server.
pub mod client_tag {
    /// Credential handshake, first frame on every connection.
    pub const AUTH: &str = "au";
    /// Game state snapshot for the opponent.
    pub const GAME_DATA: &str = "gd";
    /// Local game ended.
    pub const GAME_OVER: &str = "go";
    /// Join the waiting list.
    pub const WAITING_LIST_ADD: &str = "wa";
    /// Leave the waiting list.
    pub const WAITING_LIST_REMOVE: &str = "wr";
    /// Ask for the current waiting list.
    pub const WAITING_LIST_GET: &str = "wg";
    /// Approach a waiter.
    pub const APPROACH: &str = "a";
    /// Withdraw the open approach.
    pub const APPROACH_CANCEL: &str = "ac";
    /// Accept an approacher.
    pub const HOST_ACCEPT: &str = "ha";
    /// Reject an approacher.
    pub const HOST_REJECT: &str = "hr";
}

/// Tags sent from server to client.
pub mod server_tag {
    /// Relayed opponent snapshot.
    pub const GAME_DATA: &str = "gd";
    /// Opponent's game ended.
    pub const GAME_OVER: &str = "go";
    /// Opponent assigned.
    pub const MATCH_SET: &str = "ms";
    /// Match ended without a result.
    pub const MATCH_COMPLETE: &str = "mc";
    /// Match begins.
    pub const GAME_START: &str = "gs";
    /// Current waiting list.
    pub const WAITER_LIST: &str = "wl";
    /// Host accepted our approach.
    pub const HOST_ACCEPTED: &str = "ha";
    /// Host rejected our approach.
    pub const HOST_REJECTED: &str = "hr";
    /// Players currently approaching us.
    pub const APPROACHER_LIST: &str = "al";
    /// We lost the match.
    pub const LOSE: &str = "lo";
    /// We won the match.
    pub const WIN: &str = "wi";
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// The `{t, d}` frame both directions share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message tag.
    pub t: String,
    /// Payload, `null` for tags without data.
    #[serde(default)]
    pub d: Value,
}

impl Envelope {
    /// Build an envelope without payload.
    pub fn bare(tag: &str) -> Self {
        Self { t: tag.to_string(), d: Value::Null }
    }

    /// Build an envelope with a payload.
    pub fn with(tag: &str, d: Value) -> Self {
        Self { t: tag.to_string(), d }
    }

    /// Parse text into an envelope.
    ///
    /// Returns `Ok(None)` for a top-level empty array, which peers may emit
    /// as a keep-alive and which carries no message.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if matches!(&value, Value::Array(items) if items.is_empty()) {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ProtocolError::NotAnEnvelope(e.to_string()))
    }
}

fn payload<T: DeserializeOwned>(tag: &str, d: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(d).map_err(|e| ProtocolError::InvalidPayload {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// Protocol decode errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON does not have the envelope shape.
    #[error("not an envelope: {0}")]
    NotAnEnvelope(String),

    /// Known tag with a payload of the wrong shape.
    #[error("invalid payload for tag {tag:?}: {reason}")]
    InvalidPayload {
        /// Offending tag.
        tag: String,
        /// Decoder message.
        reason: String,
    },
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Credential handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Player id claimed by the client.
    pub id: PlayerId,
    /// Opaque credential (JWT).
    pub jwt: String,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Authenticate the connection.
    Auth(AuthRequest),
    /// Snapshot to relay to the opponent, kept as raw JSON.
    GameData(Value),
    /// Local game ended.
    GameOver,
    /// Join the waiting list.
    WaitingListAdd,
    /// Leave the waiting list.
    WaitingListRemove,
    /// Request the waiting list.
    WaitingListGet,
    /// Approach the named waiter.
    Approach(PlayerId),
    /// Withdraw the open approach.
    ApproachCancel,
    /// Accept the named approacher.
    HostAccept(PlayerId),
    /// Reject the named approacher.
    HostReject(PlayerId),
}

impl ClientMessage {
    /// Build a game data message from a snapshot.
    pub fn game_data(snapshot: &GameStateSnapshot) -> Result<Self, serde_json::Error> {
        Ok(Self::GameData(serde_json::to_value(snapshot)?))
    }

    /// Wire tag for this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Auth(_) => client_tag::AUTH,
            Self::GameData(_) => client_tag::GAME_DATA,
            Self::GameOver => client_tag::GAME_OVER,
            Self::WaitingListAdd => client_tag::WAITING_LIST_ADD,
            Self::WaitingListRemove => client_tag::WAITING_LIST_REMOVE,
            Self::WaitingListGet => client_tag::WAITING_LIST_GET,
            Self::Approach(_) => client_tag::APPROACH,
            Self::ApproachCancel => client_tag::APPROACH_CANCEL,
            Self::HostAccept(_) => client_tag::HOST_ACCEPT,
            Self::HostReject(_) => client_tag::HOST_REJECT,
        }
    }

    /// Convert to the wire envelope.
    pub fn to_envelope(&self) -> Envelope {
        let tag = self.tag();
        match self {
            Self::Auth(auth) => Envelope::with(tag, json!({ "id": auth.id.as_str(), "jwt": auth.jwt })),
            Self::GameData(data) => Envelope::with(tag, data.clone()),
            Self::Approach(id) | Self::HostAccept(id) | Self::HostReject(id) => {
                Envelope::with(tag, Value::from(id.as_str()))
            }
            Self::GameOver
            | Self::WaitingListAdd
            | Self::WaitingListRemove
            | Self::WaitingListGet
            | Self::ApproachCancel => Envelope::bare(tag),
        }
    }

    /// Convert from the wire envelope. Unknown tags yield `Ok(None)`.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, ProtocolError> {
        let Envelope { t, d } = envelope;
        let msg = match t.as_str() {
            client_tag::AUTH => Self::Auth(payload(&t, d)?),
            client_tag::GAME_DATA => Self::GameData(d),
            client_tag::GAME_OVER => Self::GameOver,
            client_tag::WAITING_LIST_ADD => Self::WaitingListAdd,
            client_tag::WAITING_LIST_REMOVE => Self::WaitingListRemove,
            client_tag::WAITING_LIST_GET => Self::WaitingListGet,
            client_tag::APPROACH => Self::Approach(payload(&t, d)?),
            client_tag::APPROACH_CANCEL => Self::ApproachCancel,
            client_tag::HOST_ACCEPT => Self::HostAccept(payload(&t, d)?),
            client_tag::HOST_REJECT => Self::HostReject(payload(&t, d)?),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope())
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Option<Self>, ProtocolError> {
        match Envelope::parse(s)? {
            Some(envelope) => Self::from_envelope(envelope),
            None => Ok(None),
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Opponent snapshot, relayed verbatim.
    GameData(Value),
    /// Opponent's game ended.
    GameOver,
    /// Opponent assigned for the coming match.
    MatchSet(PlayerId),
    /// Match ended without a result.
    MatchComplete,
    /// Match begins.
    GameStart,
    /// Current waiting list.
    WaiterList(Vec<PlayerId>),
    /// The named waiter accepted our approach.
    HostAccepted(PlayerId),
    /// Our approach was rejected (by the named waiter, if known).
    HostRejected(Option<PlayerId>),
    /// Players currently approaching us.
    ApproacherList(Vec<PlayerId>),
    /// We lost.
    Lose,
    /// We won.
    Win,
}

impl ServerMessage {
    /// Wire tag for this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::GameData(_) => server_tag::GAME_DATA,
            Self::GameOver => server_tag::GAME_OVER,
            Self::MatchSet(_) => server_tag::MATCH_SET,
            Self::MatchComplete => server_tag::MATCH_COMPLETE,
            Self::GameStart => server_tag::GAME_START,
            Self::WaiterList(_) => server_tag::WAITER_LIST,
            Self::HostAccepted(_) => server_tag::HOST_ACCEPTED,
            Self::HostRejected(_) => server_tag::HOST_REJECTED,
            Self::ApproacherList(_) => server_tag::APPROACHER_LIST,
            Self::Lose => server_tag::LOSE,
            Self::Win => server_tag::WIN,
        }
    }

    /// Control messages must be delivered; only game data may be dropped.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::GameData(_))
    }

    /// Convert to the wire envelope.
    pub fn to_envelope(&self) -> Envelope {
        let tag = self.tag();
        match self {
            Self::GameData(data) => Envelope::with(tag, data.clone()),
            Self::MatchSet(id) | Self::HostAccepted(id) => {
                Envelope::with(tag, Value::from(id.as_str()))
            }
            Self::HostRejected(id) => Envelope::with(
                tag,
                id.as_ref().map_or(Value::Null, |id| Value::from(id.as_str())),
            ),
            Self::WaiterList(ids) | Self::ApproacherList(ids) => Envelope::with(
                tag,
                Value::Array(ids.iter().map(|id| Value::from(id.as_str())).collect()),
            ),
            Self::GameOver | Self::MatchComplete | Self::GameStart | Self::Lose | Self::Win => {
                Envelope::bare(tag)
            }
        }
    }

    /// Convert from the wire envelope. Unknown tags yield `Ok(None)`.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, ProtocolError> {
        let Envelope { t, d } = envelope;
        let msg = match t.as_str() {
            server_tag::GAME_DATA => Self::GameData(d),
            server_tag::GAME_OVER => Self::GameOver,
            server_tag::MATCH_SET => Self::MatchSet(payload(&t, d)?),
            server_tag::MATCH_COMPLETE => Self::MatchComplete,
            server_tag::GAME_START => Self::GameStart,
            server_tag::WAITER_LIST => Self::WaiterList(payload(&t, d)?),
            server_tag::HOST_ACCEPTED => Self::HostAccepted(payload(&t, d)?),
            server_tag::HOST_REJECTED => Self::HostRejected(payload(&t, d)?),
            server_tag::APPROACHER_LIST => Self::ApproacherList(payload(&t, d)?),
            server_tag::LOSE => Self::Lose,
            server_tag::WIN => Self::Win,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope())
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Option<Self>, ProtocolError> {
        match Envelope::parse(s)? {
            Some(envelope) => Self::from_envelope(envelope),
            None => Ok(None),
        }
    }
}

// =============================================================================
// GAME STATE SNAPSHOT
// =============================================================================

/// Compact game state shared with the opponent every relay interval.
///
/// Every field is required on decode: partial snapshots are rejected
/// rather than merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStateSnapshot {
    /// Sender id, attached by clients for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PlayerId>,
    /// Current score.
    pub score: u64,
    /// Current level.
    pub level: u32,
    /// Lines left to clear the level.
    pub goal: u32,
    /// Board cells, row-major.
    pub matrix: Vec<Vec<i32>>,
    /// Shape index of the next piece.
    #[serde(rename = "next_mino_index")]
    pub next_piece: u8,
    /// Shape index of the held piece; `-1` on the wire when nothing is held.
    #[serde(rename = "hold_mino_index", with = "hold_sentinel")]
    pub hold_piece: Option<u8>,
}

impl GameStateSnapshot {
    /// Decode a relayed payload.
    pub fn from_payload(value: Value) -> Result<Self, ProtocolError> {
        payload(server_tag::GAME_DATA, value)
    }
}

mod hold_sentinel {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    const NONE_HELD: i32 = -1;

    pub fn serialize<S: Serializer>(value: &Option<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i32(value.map_or(NONE_HELD, i32::from))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
        let raw = i32::deserialize(d)?;
        if raw == NONE_HELD {
            return Ok(None);
        }
        u8::try_from(raw)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("hold piece index out of range: {raw}")))
    }
}
