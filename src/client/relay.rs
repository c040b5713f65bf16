//! Game State Relay
//!
//! Periodically ships the local board to the opponent while a match is in
//! progress, and reports the local top-out exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::client::bridge::ClientStatus;
use crate::client::engine::{lock, GamePhase, SharedInstance};
use crate::client::signal::{SignalSender, UiSignal};
use crate::network::protocol::ClientMessage;

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// Status left InGame (match ended or connection lost).
    LeftGame,
    /// The local game ended and `go` was sent.
    GameOver,
    /// The outbound queue was closed.
    QueueClosed,
}

/// One relay run, bound to a single match.
pub struct GameStateRelay {
    interval: Duration,
    local: SharedInstance,
    status: Arc<watch::Sender<ClientStatus>>,
    signals: SignalSender,
    outbound: mpsc::Sender<ClientMessage>,
}

impl GameStateRelay {
    /// Relay the `local` board every `interval` while status is InGame.
    pub fn new(
        interval: Duration,
        local: SharedInstance,
        status: Arc<watch::Sender<ClientStatus>>,
        signals: SignalSender,
        outbound: mpsc::Sender<ClientMessage>,
    ) -> Self {
        Self { interval, local, status, signals, outbound }
    }

    /// Tick until the match ends for this client.
    pub async fn run(self) -> RelayExit {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if *self.status.borrow() != ClientStatus::InGame {
                debug!("Relay stopping, no longer in game");
                return RelayExit::LeftGame;
            }
            if self.outbound.is_closed() {
                return RelayExit::QueueClosed;
            }

            let (phase, snapshot) = {
                let game = lock(&self.local);
                let phase = game.phase();
                (phase, (phase == GamePhase::Playing).then(|| game.snapshot()))
            };

            match (phase, snapshot) {
                (GamePhase::Playing, Some(snapshot)) => {
                    let frame = match ClientMessage::game_data(&snapshot) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Failed to encode snapshot: {}", e);
                            continue;
                        }
                    };
                    match self.outbound.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!("Outbound queue full, dropping frame"),
                        Err(TrySendError::Closed(_)) => return RelayExit::QueueClosed,
                    }
                }
                (GamePhase::GameOver, _) => {
                    // Status first: the server's verdict may arrive before send returns.
                    if !mark_game_over(&self.status) {
                        debug!("Match ended before local game over was reported");
                        return RelayExit::LeftGame;
                    }
                    if self.outbound.send(ClientMessage::GameOver).await.is_err() {
                        return RelayExit::QueueClosed;
                    }
                    info!("Local game over reported");
                    let _ = self.signals.send(UiSignal::Init);
                    return RelayExit::GameOver;
                }
                _ => {}
            }
        }
    }
}

/// Move InGame to GameOver in one step; any other status is left alone.
fn mark_game_over(status: &watch::Sender<ClientStatus>) -> bool {
    status.send_if_modified(|current| {
        if *current != ClientStatus::InGame {
            return false;
        }
        *current = ClientStatus::GameOver;
        true
    })
}
