//! Per-player delivery queues.
//!
//! Control messages travel on an unbounded lane and are never dropped.
//! Game data travels on a small bounded lane; when the peer falls behind the
//! newest frame is dropped, since the next one supersedes it within one
//! relay interval.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::network::protocol::ServerMessage;

/// Default capacity of the game data lane.
pub const DEFAULT_FRAME_CAPACITY: usize = 8;

/// Sending half, held by the directory.
#[derive(Debug, Clone)]
pub struct Outbox {
    control: mpsc::UnboundedSender<ServerMessage>,
    frames: mpsc::Sender<ServerMessage>,
}

/// Receiving half, drained by the connection's writer task.
#[derive(Debug)]
pub struct OutboxReceiver {
    control: mpsc::UnboundedReceiver<ServerMessage>,
    frames: mpsc::Receiver<ServerMessage>,
}

impl Outbox {
    /// Create a connected outbox pair.
    pub fn channel(frame_capacity: usize) -> (Outbox, OutboxReceiver) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(frame_capacity.max(1));
        (
            Outbox { control: control_tx, frames: frames_tx },
            OutboxReceiver { control: control_rx, frames: frames_rx },
        )
    }

    /// Queue a message without blocking.
    ///
    /// Returns false if the message was not queued (receiver gone, or a
    /// game data frame hit a full lane).
    pub fn send(&self, message: ServerMessage) -> bool {
        if message.is_control() {
            return self.control.send(message).is_ok();
        }
        match self.frames.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Frame lane full, dropping game data");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl OutboxReceiver {
    /// Wait for the next message, control lane first.
    ///
    /// Returns None once both lanes are closed and drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        tokio::select! {
            biased;
            Some(msg) = self.control.recv() => Some(msg),
            Some(msg) = self.frames.recv() => Some(msg),
            else => None,
        }
    }

    /// Take the next queued message if one is ready, control lane first.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.control
            .try_recv()
            .ok()
            .or_else(|| self.frames.try_recv().ok())
    }
}
