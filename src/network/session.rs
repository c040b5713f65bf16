//! Connection Session
//!
//! One per authenticated socket. Translates inbound protocol messages into
//! directory operations and reports stale references back to the player
//! who made them.

use std::sync::Arc;

use tracing::debug;

use crate::network::directory::{Directory, DirectoryError};
use crate::network::outbox::Outbox;
use crate::network::protocol::{ClientMessage, PlayerId, ServerMessage};

/// Server-side player status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerStatus {
    /// Idle, connected.
    #[default]
    Hello,
    /// Listed, accepting approaches.
    Waiting,
    /// Has an open approach to a waiter.
    Soliciting,
    /// Playing a match.
    InGame,
    /// Own game ended, match being settled.
    GameOver,
}

impl PlayerStatus {
    /// Transition table.
    pub fn can_become(self, next: PlayerStatus) -> bool {
        use PlayerStatus::*;
        matches!(
            (self, next),
            (Hello, Hello | Waiting | Soliciting)
                | (Waiting, Hello | Waiting | Soliciting | InGame)
                | (Soliciting, Hello | Waiting | Soliciting | InGame)
                | (InGame, InGame | GameOver | Hello)
                | (GameOver, Hello)
        )
    }

    /// Whether the player is bound to a match.
    pub fn in_match(self) -> bool {
        matches!(self, PlayerStatus::InGame | PlayerStatus::GameOver)
    }
}

/// A player's live connection.
pub struct PlayerSession {
    player_id: PlayerId,
    credential: String,
    directory: Arc<Directory>,
}

impl PlayerSession {
    /// Register the player with the directory and open its session.
    pub async fn open(
        player_id: PlayerId,
        credential: String,
        directory: Arc<Directory>,
        outbox: Outbox,
    ) -> Result<Self, DirectoryError> {
        directory.register(player_id.clone(), outbox).await?;
        Ok(Self { player_id, credential, directory })
    }

    /// Player identifier.
    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    /// Credential presented at handshake.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Current status.
    pub async fn status(&self) -> PlayerStatus {
        self.directory.status(&self.player_id).await.unwrap_or_default()
    }

    /// Apply one inbound message.
    ///
    /// Errors are already handled (the actor was notified where the
    /// protocol calls for it); they are returned for logging.
    pub async fn handle_message(&self, msg: ClientMessage) -> Result<(), DirectoryError> {
        let me = &self.player_id;
        let dir = &self.directory;

        match msg {
            ClientMessage::Auth(_) => {
                debug!("{} sent a second auth, ignoring", me);
                Ok(())
            }
            ClientMessage::WaitingListAdd => dir.add_waiting(me).await,
            ClientMessage::WaitingListRemove => dir.remove_waiting(me).await,
            ClientMessage::WaitingListGet => {
                let waiters = dir.list_waiting().await;
                dir.send_to(me, ServerMessage::WaiterList(waiters)).await;
                Ok(())
            }
            ClientMessage::Approach(waiter) => {
                let result = dir.solicit(me, &waiter).await;
                if let Err(DirectoryError::StaleReference(_)) = result {
                    dir.send_to(me, ServerMessage::HostRejected(Some(waiter))).await;
                }
                result
            }
            ClientMessage::ApproachCancel => dir.cancel_solicit(me).await,
            ClientMessage::HostAccept(approacher) => {
                let result = dir.accept(me, &approacher).await.map(|_| ());
                self.refresh_on_stale(&result).await;
                result
            }
            ClientMessage::HostReject(approacher) => {
                let result = dir.reject(me, &approacher).await;
                self.refresh_on_stale(&result).await;
                result
            }
            ClientMessage::GameData(payload) => dir.relay_game_data(me, payload).await,
            ClientMessage::GameOver => dir.relay_game_over(me).await.map(|_| ()),
        }
    }

    /// Re-send the approacher list so the host sees who is really there.
    async fn refresh_on_stale(&self, result: &Result<(), DirectoryError>) {
        if let Err(DirectoryError::StaleReference(_)) = result {
            let list = self.directory.list_approachers(&self.player_id).await;
            self.directory
                .send_to(&self.player_id, ServerMessage::ApproacherList(list))
                .await;
        }
    }

    /// Close the session, releasing everything the player held.
    pub async fn close(self) {
        self.directory.unregister(&self.player_id).await;
    }
}
