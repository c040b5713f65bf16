//! Client Layer
//!
//! Everything a game client needs to talk to the relay server: the protocol
//! bridge, the per-match state relay and the seams to the game engine and UI.

pub mod bridge;
pub mod engine;
pub mod relay;
pub mod signal;

pub use bridge::{BridgeConfig, BridgeError, ClientStatus, Intent, ProtocolBridge};
pub use engine::{shared, GameInstance, GamePhase, SharedInstance, SnapshotGame};
pub use relay::{GameStateRelay, RelayExit};
pub use signal::{SignalReceiver, UiSignal};
