//! Network Layer
//!
//! WebSocket relay server: matchmaking directory, per-connection sessions and
//! the wire protocol they speak. The server never interprets game state, it
//! only forwards snapshots between the two players of a match.

pub mod auth;
pub mod directory;
pub mod outbox;
pub mod protocol;
pub mod session;
pub mod server;

pub use auth::{authenticate, AuthError};
pub use directory::{Directory, DirectoryError, Match};
pub use outbox::{Outbox, OutboxReceiver};
pub use protocol::{
    AuthRequest, ClientMessage, Envelope, GameStateSnapshot, PlayerId, ProtocolError,
    ServerMessage,
};
pub use server::{HandshakeError, RelayServer, ServerConfig, ServerError};
pub use session::{PlayerSession, PlayerStatus};
