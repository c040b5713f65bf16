//! Matchmaking Directory
//!
//! The waiting list, the solicitation graph and the opponent map, shared by
//! every connection. All state sits behind one lock; mutating operations
//! hold the write lock for their whole duration, including notification
//! fan-out, which never blocks (see [`Outbox`]).

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::network::outbox::Outbox;
use crate::network::protocol::{PlayerId, ServerMessage};
use crate::network::session::PlayerStatus;

/// A formed match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The listed player who accepted.
    pub waiter: PlayerId,
    /// The player whose approach was accepted.
    pub approacher: PlayerId,
}

/// Directory errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// Player is not registered.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// A connection for this player already exists.
    #[error("player {0} is already connected")]
    AlreadyRegistered(PlayerId),

    /// The named player is no longer in the expected position.
    #[error("stale reference to {0}")]
    StaleReference(PlayerId),

    /// Solicitor already has an open approach to another waiter.
    #[error("already soliciting {waiter}")]
    AlreadySoliciting {
        /// Waiter of the open approach.
        waiter: PlayerId,
    },

    /// Player has no active match.
    #[error("not in game")]
    NotInGame,

    /// Status change not allowed by the transition table.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status.
        from: PlayerStatus,
        /// Requested status.
        to: PlayerStatus,
    },
}

/// A registered connection.
#[derive(Debug)]
struct PlayerEntry {
    status: PlayerStatus,
    outbox: Outbox,
}

#[derive(Debug, Default)]
struct DirectoryState {
    players: BTreeMap<PlayerId, PlayerEntry>,
    /// Insertion-ordered, unique.
    waiting: Vec<PlayerId>,
    /// Solicitor -> waiter.
    solicitations: BTreeMap<PlayerId, PlayerId>,
    /// Waiter -> solicitors, insertion order.
    approachers: BTreeMap<PlayerId, Vec<PlayerId>>,
    /// Both directions of every active match.
    opponents: BTreeMap<PlayerId, PlayerId>,
}

impl DirectoryState {
    fn status_of(&self, id: &PlayerId) -> Result<PlayerStatus, DirectoryError> {
        self.players
            .get(id)
            .map(|p| p.status)
            .ok_or_else(|| DirectoryError::UnknownPlayer(id.clone()))
    }

    fn transition(&mut self, id: &PlayerId, to: PlayerStatus) -> Result<(), DirectoryError> {
        let entry = self
            .players
            .get_mut(id)
            .ok_or_else(|| DirectoryError::UnknownPlayer(id.clone()))?;
        if !entry.status.can_become(to) {
            return Err(DirectoryError::InvalidTransition { from: entry.status, to });
        }
        entry.status = to;
        Ok(())
    }

    /// Transition on a path the directory itself guarantees is legal.
    fn force_transition(&mut self, id: &PlayerId, to: PlayerStatus) {
        if let Err(e) = self.transition(id, to) {
            warn!("Directory bookkeeping for {}: {}", id, e);
        }
    }

    fn notify(&self, id: &PlayerId, message: ServerMessage) {
        match self.players.get(id) {
            Some(entry) => {
                if !entry.outbox.send(message) {
                    debug!("Message to {} not queued", id);
                }
            }
            None => debug!("Dropping message for disconnected player {}", id),
        }
    }

    fn approacher_list(&self, waiter: &PlayerId) -> Vec<PlayerId> {
        self.approachers.get(waiter).cloned().unwrap_or_default()
    }

    fn ensure_not_in_match(&self, id: &PlayerId, to: PlayerStatus) -> Result<(), DirectoryError> {
        let from = self.status_of(id)?;
        if from.in_match() {
            return Err(DirectoryError::InvalidTransition { from, to });
        }
        Ok(())
    }

    /// Take `waiter` off the list and turn away everyone approaching it.
    fn withdraw_waiting(&mut self, waiter: &PlayerId) {
        self.waiting.retain(|id| id != waiter);
        let pending = self.approachers.remove(waiter).unwrap_or_default();
        for approacher in pending {
            self.solicitations.remove(&approacher);
            self.force_transition(&approacher, PlayerStatus::Hello);
            self.notify(&approacher, ServerMessage::HostRejected(Some(waiter.clone())));
        }
    }

    /// Drop `solicitor`'s open approach, refreshing the waiter's list.
    fn withdraw_solicitation(&mut self, solicitor: &PlayerId) -> Option<PlayerId> {
        let waiter = self.solicitations.remove(solicitor)?;
        if let Some(list) = self.approachers.get_mut(&waiter) {
            list.retain(|id| id != solicitor);
            if list.is_empty() {
                self.approachers.remove(&waiter);
            }
        }
        self.notify(&waiter, ServerMessage::ApproacherList(self.approacher_list(&waiter)));
        Some(waiter)
    }
}

/// Shared matchmaking registry.
#[derive(Debug, Default)]
pub struct Directory {
    state: RwLock<DirectoryState>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    /// Register a connected player.
    pub async fn register(&self, id: PlayerId, outbox: Outbox) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        if state.players.contains_key(&id) {
            return Err(DirectoryError::AlreadyRegistered(id));
        }
        state.players.insert(id, PlayerEntry { status: PlayerStatus::Hello, outbox });
        Ok(())
    }

    /// Remove a player whose connection closed, releasing everything it held.
    ///
    /// Pending approachers are rejected, an open approach is withdrawn and a
    /// running match ends with `match_complete` for the opponent.
    pub async fn unregister(&self, id: &PlayerId) {
        let mut state = self.state.write().await;
        if !state.players.contains_key(id) {
            return;
        }

        state.withdraw_waiting(id);
        state.withdraw_solicitation(id);

        if let Some(opponent) = state.opponents.remove(id) {
            state.opponents.remove(&opponent);
            state.force_transition(&opponent, PlayerStatus::Hello);
            state.notify(&opponent, ServerMessage::MatchComplete);
            info!("Match {} vs {} abandoned", id, opponent);
        }

        state.players.remove(id);
    }

    /// Current status of a player.
    pub async fn status(&self, id: &PlayerId) -> Option<PlayerStatus> {
        self.state.read().await.players.get(id).map(|p| p.status)
    }

    /// Current opponent of a player.
    pub async fn opponent(&self, id: &PlayerId) -> Option<PlayerId> {
        self.state.read().await.opponents.get(id).cloned()
    }

    /// Number of connected players.
    pub async fn player_count(&self) -> usize {
        self.state.read().await.players.len()
    }

    /// Number of listed players.
    pub async fn waiting_count(&self) -> usize {
        self.state.read().await.waiting.len()
    }

    /// Queue a message for a single player.
    pub async fn send_to(&self, id: &PlayerId, message: ServerMessage) {
        self.state.read().await.notify(id, message);
    }

    // =========================================================================
    // WAITING LIST
    // =========================================================================

    /// List a player as available. Re-adding is a no-op.
    pub async fn add_waiting(&self, id: &PlayerId) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        state.ensure_not_in_match(id, PlayerStatus::Waiting)?;

        state.withdraw_solicitation(id);
        if !state.waiting.contains(id) {
            state.waiting.push(id.clone());
        }
        state.transition(id, PlayerStatus::Waiting)
    }

    /// Unlist a player and drop any approach it has open.
    pub async fn remove_waiting(&self, id: &PlayerId) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        state.ensure_not_in_match(id, PlayerStatus::Hello)?;

        state.withdraw_waiting(id);
        state.withdraw_solicitation(id);
        state.transition(id, PlayerStatus::Hello)
    }

    /// Listed players in the order they joined.
    pub async fn list_waiting(&self) -> Vec<PlayerId> {
        self.state.read().await.waiting.clone()
    }

    // =========================================================================
    // SOLICITATION
    // =========================================================================

    /// Open an approach from `solicitor` to `waiter`.
    ///
    /// Repeating the same approach is a refresh: the waiter is re-sent its
    /// approacher list and nothing else changes.
    pub async fn solicit(&self, solicitor: &PlayerId, waiter: &PlayerId) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        state.ensure_not_in_match(solicitor, PlayerStatus::Soliciting)?;

        match state.solicitations.get(solicitor) {
            Some(current) if current == waiter => {
                state.notify(waiter, ServerMessage::ApproacherList(state.approacher_list(waiter)));
                return Ok(());
            }
            Some(current) => {
                return Err(DirectoryError::AlreadySoliciting { waiter: current.clone() });
            }
            None => {}
        }

        if solicitor == waiter || !state.waiting.contains(waiter) {
            return Err(DirectoryError::StaleReference(waiter.clone()));
        }

        state.withdraw_waiting(solicitor);
        state.transition(solicitor, PlayerStatus::Soliciting)?;
        state.solicitations.insert(solicitor.clone(), waiter.clone());
        state.approachers.entry(waiter.clone()).or_default().push(solicitor.clone());

        let list = state.approacher_list(waiter);
        state.notify(waiter, ServerMessage::ApproacherList(list));
        debug!("{} approached {}", solicitor, waiter);
        Ok(())
    }

    /// Players currently approaching `waiter`.
    pub async fn list_approachers(&self, waiter: &PlayerId) -> Vec<PlayerId> {
        self.state.read().await.approacher_list(waiter)
    }

    /// Withdraw `solicitor`'s open approach.
    pub async fn cancel_solicit(&self, solicitor: &PlayerId) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        state.status_of(solicitor)?;

        match state.withdraw_solicitation(solicitor) {
            Some(_) => state.transition(solicitor, PlayerStatus::Hello),
            None => Err(DirectoryError::StaleReference(solicitor.clone())),
        }
    }

    /// Turn down one approacher.
    pub async fn reject(&self, waiter: &PlayerId, approacher: &PlayerId) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        if state.solicitations.get(approacher) != Some(waiter) {
            return Err(DirectoryError::StaleReference(approacher.clone()));
        }

        state.withdraw_solicitation(approacher);
        state.force_transition(approacher, PlayerStatus::Hello);
        state.notify(approacher, ServerMessage::HostRejected(Some(waiter.clone())));
        debug!("{} rejected {}", waiter, approacher);
        Ok(())
    }

    /// Form a match between `waiter` and one of its approachers.
    ///
    /// The approacher must still be in the waiter's list when the write lock
    /// is taken; both players are then removed from every waiting and
    /// solicitation structure before anyone is notified. A concurrent accept
    /// that lost the race sees [`DirectoryError::StaleReference`].
    pub async fn accept(&self, waiter: &PlayerId, approacher: &PlayerId) -> Result<Match, DirectoryError> {
        let mut state = self.state.write().await;

        let listed = state
            .approachers
            .get(waiter)
            .is_some_and(|list| list.contains(approacher));
        if !listed
            || state.solicitations.get(approacher) != Some(waiter)
            || state.status_of(waiter)? != PlayerStatus::Waiting
        {
            return Err(DirectoryError::StaleReference(approacher.clone()));
        }

        state.solicitations.remove(approacher);
        if let Some(list) = state.approachers.get_mut(waiter) {
            list.retain(|id| id != approacher);
        }
        state.withdraw_waiting(waiter);

        state.transition(waiter, PlayerStatus::InGame)?;
        state.transition(approacher, PlayerStatus::InGame)?;
        state.opponents.insert(waiter.clone(), approacher.clone());
        state.opponents.insert(approacher.clone(), waiter.clone());

        state.notify(waiter, ServerMessage::MatchSet(approacher.clone()));
        state.notify(approacher, ServerMessage::MatchSet(waiter.clone()));
        state.notify(approacher, ServerMessage::HostAccepted(waiter.clone()));
        state.notify(waiter, ServerMessage::GameStart);
        state.notify(approacher, ServerMessage::GameStart);

        info!("Match formed: {} vs {}", waiter, approacher);
        Ok(Match { waiter: waiter.clone(), approacher: approacher.clone() })
    }

    // =========================================================================
    // RELAY
    // =========================================================================

    /// Forward a snapshot to the sender's opponent, verbatim.
    pub async fn relay_game_data(&self, from: &PlayerId, payload: Value) -> Result<(), DirectoryError> {
        let state = self.state.read().await;
        if state.status_of(from)? != PlayerStatus::InGame {
            return Err(DirectoryError::NotInGame);
        }
        let opponent = state.opponents.get(from).ok_or(DirectoryError::NotInGame)?;
        state.notify(opponent, ServerMessage::GameData(payload));
        Ok(())
    }

    /// The sender's game ended: tell the opponent, then settle the match.
    ///
    /// The first player to top out loses. Both players return to Hello and
    /// neither is put back on the waiting list.
    pub async fn relay_game_over(&self, from: &PlayerId) -> Result<PlayerId, DirectoryError> {
        let mut state = self.state.write().await;
        if state.status_of(from)? != PlayerStatus::InGame {
            return Err(DirectoryError::NotInGame);
        }
        let opponent = state.opponents.remove(from).ok_or(DirectoryError::NotInGame)?;
        state.opponents.remove(&opponent);

        state.transition(from, PlayerStatus::GameOver)?;
        state.notify(&opponent, ServerMessage::GameOver);
        state.notify(from, ServerMessage::Lose);
        state.notify(&opponent, ServerMessage::Win);
        state.transition(from, PlayerStatus::Hello)?;
        state.force_transition(&opponent, PlayerStatus::Hello);

        info!("Match complete: {} beat {}", opponent, from);
        Ok(opponent)
    }
}
