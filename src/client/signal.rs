//! Notifications from the bridge to the presentation layer.

use tokio::sync::mpsc;

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSignal {
    /// A match is starting; show both boards.
    GameStart,
    /// Return to the lobby screen.
    Init,
    /// Our approach was turned down.
    ApproachRejected,
    /// The server connection is gone for good.
    ServerConnectionLost,
    /// Fresh waiting list.
    WaiterListUpdated(Vec<String>),
    /// Fresh list of players approaching us.
    ApproacherListUpdated(Vec<String>),
    /// Opponent for the coming match.
    MatchSet(String),
}

/// Sending half of the signal channel.
pub type SignalSender = mpsc::UnboundedSender<UiSignal>;

/// Receiving half, drained by the presentation layer.
pub type SignalReceiver = mpsc::UnboundedReceiver<UiSignal>;
