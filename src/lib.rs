//! # Stackline
//!
//! Matchmaking and game-state relay for head-to-head tile-stacking matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        STACKLINE                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/        - Relay server                              │
//! │  ├── protocol.rs - Wire envelope and message types           │
//! │  ├── auth.rs     - Handshake identity check                  │
//! │  ├── directory.rs- Waiting list, solicitations, matches      │
//! │  ├── outbox.rs   - Per-player control/frame delivery lanes   │
//! │  ├── session.rs  - Per-connection status and dispatch        │
//! │  └── server.rs   - WebSocket accept loop                     │
//! │                                                              │
//! │  client/         - Game client side                          │
//! │  ├── bridge.rs   - Intents out, server messages in           │
//! │  ├── relay.rs    - Periodic board snapshots during a match   │
//! │  ├── engine.rs   - Game instance seam                        │
//! │  └── signal.rs   - UI notifications                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Relay Model
//!
//! The server never simulates a game. Each client plays its own board and
//! ships a full snapshot every [`RELAY_INTERVAL`]; the server forwards it to
//! the opponent verbatim. The server only decides who plays whom and who
//! topped out first.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

use std::time::Duration;

pub mod client;
pub mod network;

// Re-export commonly used types
pub use client::{BridgeConfig, ClientStatus, GameInstance, GamePhase, Intent, ProtocolBridge, UiSignal};
pub use network::{
    ClientMessage, Directory, GameStateSnapshot, PlayerId, RelayServer, ServerConfig,
    ServerMessage,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Period at which clients relay their board during a match.
pub const RELAY_INTERVAL: Duration = Duration::from_millis(100);
