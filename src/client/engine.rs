//! Game engine boundary.
//!
//! The bridge never looks inside a game. It only needs to take and apply
//! snapshots and to drive the coarse lifecycle phase.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::network::protocol::GameStateSnapshot;

/// Lifecycle phase of one game instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GamePhase {
    /// No game loaded.
    #[default]
    Idle,
    /// Board reset, waiting for the start grace period.
    Ready,
    /// Accepting input.
    Playing,
    /// Topped out.
    GameOver,
    /// Match won.
    Won,
    /// Match lost.
    Lost,
}

/// A playable (or mirrored) game.
pub trait GameInstance: Send + 'static {
    /// Current state, for relaying to the opponent.
    fn snapshot(&self) -> GameStateSnapshot;
    /// Overwrite the state wholesale.
    fn apply_snapshot(&mut self, snapshot: &GameStateSnapshot);
    /// Clear the board for a new match.
    fn reset(&mut self);
    /// Current phase.
    fn phase(&self) -> GamePhase;
    /// Move to a new phase.
    fn set_phase(&mut self, phase: GamePhase);
}

/// Game instance shared between the UI thread and the bridge tasks.
pub type SharedInstance = Arc<Mutex<dyn GameInstance>>;

/// Wrap an instance for sharing.
pub fn shared<G: GameInstance>(game: G) -> SharedInstance {
    Arc::new(Mutex::new(game))
}

/// Lock a shared instance. A panic on another thread does not make the
/// board unusable, so poisoning is ignored.
pub fn lock(instance: &SharedInstance) -> MutexGuard<'_, dyn GameInstance> {
    instance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Snapshot-only game with no rules attached.
///
/// Suits the mirrored opponent board and headless clients.
#[derive(Debug, Clone, Default)]
pub struct SnapshotGame {
    state: GameStateSnapshot,
    phase: GamePhase,
}

impl SnapshotGame {
    /// Empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable access to the state, for drivers that play headless.
    pub fn state_mut(&mut self) -> &mut GameStateSnapshot {
        &mut self.state
    }
}

impl GameInstance for SnapshotGame {
    fn snapshot(&self) -> GameStateSnapshot {
        self.state.clone()
    }

    fn apply_snapshot(&mut self, snapshot: &GameStateSnapshot) {
        self.state = snapshot.clone();
    }

    fn reset(&mut self) {
        self.state = GameStateSnapshot::default();
        self.phase = GamePhase::Idle;
    }

    fn phase(&self) -> GamePhase {
        self.phase
    }

    fn set_phase(&mut self, phase: GamePhase) {
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_game_overwrites_wholesale() {
        let game = shared(SnapshotGame::new());
        let incoming = GameStateSnapshot {
            score: 120,
            level: 3,
            matrix: vec![vec![1, 0]],
            hold_piece: Some(2),
            ..Default::default()
        };

        lock(&game).apply_snapshot(&incoming);
        assert_eq!(lock(&game).snapshot(), incoming);

        lock(&game).reset();
        assert_eq!(lock(&game).snapshot(), GameStateSnapshot::default());
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut game = SnapshotGame::new();
        game.set_phase(GamePhase::Playing);
        game.state_mut().score = 50;

        game.reset();
        assert_eq!(game.phase(), GamePhase::Idle);
        assert_eq!(game.snapshot().score, 0);
    }
}
