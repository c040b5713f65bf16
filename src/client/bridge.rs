//! Client Protocol Bridge
//!
//! Owns one player's server connection. UI intents go out as wire messages,
//! server messages come back as status changes, board updates and
//! [`UiSignal`]s.
//!
//! ```text
//! UI ──Intent──► intent loop ──► outbound queue ──► writer ──► socket
//!                                      ▲
//!                              relay (per match)
//! socket ──► reader ──► dispatch ──► status (watch) / boards / UiSignal
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::client::engine::{lock, GamePhase, SharedInstance};
use crate::client::relay::{GameStateRelay, RelayExit};
use crate::client::signal::{SignalReceiver, SignalSender, UiSignal};
use crate::network::protocol::{
    AuthRequest, ClientMessage, GameStateSnapshot, PlayerId, ServerMessage,
};
use crate::RELAY_INTERVAL;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Delay between `game_start` and the first relayed frame.
pub const START_GRACE: Duration = Duration::from_secs(3);

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket URL of the relay server.
    pub server_url: String,
    /// Id to authenticate as.
    pub player_id: PlayerId,
    /// Credential sent with the auth frame.
    pub jwt: String,
    /// Period of the game state relay.
    pub relay_interval: Duration,
    /// Countdown before play begins.
    pub start_grace: Duration,
    /// Capacity of the UI intent queue.
    pub intent_capacity: usize,
    /// Capacity of the socket write queue.
    pub outbound_capacity: usize,
}

impl BridgeConfig {
    /// Config with default timings and queue sizes.
    pub fn new(
        server_url: impl Into<String>,
        player_id: impl Into<PlayerId>,
        jwt: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            player_id: player_id.into(),
            jwt: jwt.into(),
            relay_interval: RELAY_INTERVAL,
            start_grace: START_GRACE,
            intent_capacity: 32,
            outbound_capacity: 64,
        }
    }

    /// Set the relay period.
    pub fn with_relay_interval(mut self, interval: Duration) -> Self {
        self.relay_interval = interval;
        self
    }

    /// Set the countdown before play.
    pub fn with_start_grace(mut self, grace: Duration) -> Self {
        self.start_grace = grace;
        self
    }

    /// Clamped to at least 1.
    pub fn with_intent_capacity(mut self, capacity: usize) -> Self {
        self.intent_capacity = capacity.max(1);
        self
    }

    /// Clamped to at least 1.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }
}

/// Local view of where this player is in the matchmaking flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStatus {
    /// Connected, idle in the lobby.
    #[default]
    Hello,
    /// Listed on the waiting list.
    Waiting,
    /// Approach sent, waiting for the host.
    Approaching,
    /// Match in progress.
    InGame,
    /// Local board topped out, waiting for the verdict.
    GameOver,
    /// Match won.
    Won,
    /// Match lost.
    Lost,
    /// Match ended without a result.
    MatchComplete,
    /// Server connection gone.
    Disconnected,
}

impl ClientStatus {
    /// Whether a match is running for this client.
    pub fn in_match(self) -> bool {
        matches!(self, ClientStatus::InGame | ClientStatus::GameOver)
    }
}

/// A user action to forward to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Get listed.
    WaitingListAdd,
    /// Get unlisted.
    WaitingListRemove,
    /// Ask for the waiting list.
    WaitingListGet,
    /// Ask a waiter for a match.
    Approach(PlayerId),
    /// Withdraw the open approach.
    ApproachCancel,
    /// Start a match with an approacher.
    HostAccept(PlayerId),
    /// Turn an approacher down.
    HostReject(PlayerId),
}

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Could not reach the server.
    #[error("connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    /// WebSocket failure after connecting.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Intent queue is full.
    #[error("intent queue full")]
    QueueFull,

    /// The bridge has shut down.
    #[error("bridge closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Mirror {
    waiters: Vec<PlayerId>,
    approachers: Vec<PlayerId>,
    opponent: Option<PlayerId>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the bridge tasks.
struct BridgeCore {
    config: BridgeConfig,
    status: Arc<watch::Sender<ClientStatus>>,
    signals: SignalSender,
    outbound: mpsc::Sender<ClientMessage>,
    local: SharedInstance,
    opponent: SharedInstance,
    mirror: Mutex<Mirror>,
    relay: Mutex<Option<JoinHandle<RelayExit>>>,
    lost: AtomicBool,
}

impl BridgeCore {
    fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ClientStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("{}: {:?} -> {:?}", self.config.player_id, previous, status);
        }
    }

    fn emit(&self, signal: UiSignal) {
        // Nobody listening is fine; the bridge keeps working headless.
        let _ = self.signals.send(signal);
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), BridgeError> {
        self.outbound.send(msg).await.map_err(|_| BridgeError::Closed)
    }

    /// Translate one UI intent into a wire message.
    async fn handle_intent(&self, intent: Intent) -> Result<(), BridgeError> {
        let lobby_move = matches!(
            intent,
            Intent::WaitingListAdd
                | Intent::WaitingListRemove
                | Intent::Approach(_)
                | Intent::ApproachCancel
        );
        if lobby_move && self.status().in_match() {
            debug!("In a match, dropping {:?}", intent);
            return Ok(());
        }

        match intent {
            Intent::WaitingListAdd => {
                self.set_status(ClientStatus::Waiting);
                self.send(ClientMessage::WaitingListAdd).await
            }
            Intent::WaitingListRemove => {
                self.set_status(ClientStatus::Hello);
                self.send(ClientMessage::WaitingListRemove).await
            }
            Intent::WaitingListGet => self.send(ClientMessage::WaitingListGet).await,
            Intent::Approach(waiter) => {
                if self.status() == ClientStatus::Approaching {
                    debug!("Already approaching, dropping approach to {}", waiter);
                    return Ok(());
                }
                self.set_status(ClientStatus::Approaching);
                self.send(ClientMessage::Approach(waiter)).await
            }
            Intent::ApproachCancel => {
                self.set_status(ClientStatus::Hello);
                self.send(ClientMessage::ApproachCancel).await
            }
            Intent::HostAccept(approacher) => self.send(ClientMessage::HostAccept(approacher)).await,
            Intent::HostReject(approacher) => self.send(ClientMessage::HostReject(approacher)).await,
        }
    }

    /// Apply one server message. Never blocks.
    fn dispatch(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::GameData(value) => {
                // Frames can trail the match verdict; the board is final by then.
                if self.status() != ClientStatus::InGame {
                    debug!("Dropping opponent snapshot outside a match");
                    return;
                }
                match GameStateSnapshot::from_payload(value) {
                    Ok(snapshot) => lock(&self.opponent).apply_snapshot(&snapshot),
                    Err(e) => debug!("Dropping opponent snapshot: {}", e),
                }
            }
            ServerMessage::GameOver => {
                lock(&self.opponent).set_phase(GamePhase::GameOver);
            }
            ServerMessage::MatchSet(opponent) => {
                info!("{} matched with {}", self.config.player_id, opponent);
                guard(&self.mirror).opponent = Some(opponent.clone());
                self.emit(UiSignal::MatchSet(opponent.to_string()));
            }
            ServerMessage::HostAccepted(waiter) => {
                debug!("{} accepted our approach", waiter);
            }
            ServerMessage::GameStart => self.start_match(),
            ServerMessage::MatchComplete => {
                self.finish_match(GamePhase::Idle, ClientStatus::MatchComplete)
            }
            ServerMessage::Win => self.finish_match(GamePhase::Won, ClientStatus::Won),
            ServerMessage::Lose => self.finish_match(GamePhase::Lost, ClientStatus::Lost),
            ServerMessage::ApproacherList(list) => {
                let names = list.iter().map(ToString::to_string).collect();
                guard(&self.mirror).approachers = list;
                self.emit(UiSignal::ApproacherListUpdated(names));
            }
            ServerMessage::WaiterList(list) => {
                let names = list.iter().map(ToString::to_string).collect();
                guard(&self.mirror).waiters = list;
                self.emit(UiSignal::WaiterListUpdated(names));
            }
            ServerMessage::HostRejected(waiter) => {
                debug!("Approach rejected by {:?}", waiter);
                self.set_status(ClientStatus::Hello);
                self.emit(UiSignal::ApproachRejected);
            }
        }
    }

    fn start_match(self: &Arc<Self>) {
        self.set_status(ClientStatus::InGame);
        lock(&self.local).reset();
        lock(&self.opponent).reset();
        lock(&self.local).set_phase(GamePhase::Ready);
        self.emit(UiSignal::GameStart);

        let mut slot = guard(&self.relay);
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let relay = GameStateRelay::new(
            self.config.relay_interval,
            self.local.clone(),
            self.status.clone(),
            self.signals.clone(),
            self.outbound.clone(),
        );
        let local = self.local.clone();
        let status = self.status.clone();
        let grace = self.config.start_grace;

        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if *status.borrow() != ClientStatus::InGame {
                return RelayExit::LeftGame;
            }
            lock(&local).set_phase(GamePhase::Playing);
            relay.run().await
        }));
    }

    fn finish_match(&self, phase: GamePhase, outcome: ClientStatus) {
        info!("{} match finished: {:?}", self.config.player_id, outcome);
        lock(&self.local).set_phase(phase);
        self.set_status(outcome);
        guard(&self.mirror).opponent = None;
        self.emit(UiSignal::Init);
        self.set_status(ClientStatus::Hello);
    }

    fn abort_relay(&self) {
        if let Some(relay) = guard(&self.relay).take() {
            relay.abort();
        }
    }

    /// Terminal. Signals the UI once no matter how many tasks notice.
    fn connection_lost(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("{} lost connection to server", self.config.player_id);
        self.abort_relay();
        self.set_status(ClientStatus::Disconnected);
        self.emit(UiSignal::ServerConnectionLost);
    }
}

/// Handle to a connected bridge.
///
/// Dropping it tears the connection down.
pub struct ProtocolBridge {
    core: Arc<BridgeCore>,
    intents: mpsc::Sender<Intent>,
    status: watch::Receiver<ClientStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProtocolBridge {
    /// Connect, authenticate and start the bridge tasks.
    ///
    /// `local` is the board this player drives; `opponent` receives the
    /// relayed snapshots.
    pub async fn connect(
        config: BridgeConfig,
        local: SharedInstance,
        opponent: SharedInstance,
    ) -> Result<(Self, SignalReceiver), BridgeError> {
        info!("Connecting to {} as {}", config.server_url, config.player_id);
        let (ws_stream, _) = connect_async(config.server_url.as_str())
            .await
            .map_err(BridgeError::Connect)?;
        let (mut write, read) = ws_stream.split();

        let auth = ClientMessage::Auth(AuthRequest {
            id: config.player_id.clone(),
            jwt: config.jwt.clone(),
        });
        write.send(Message::Text(auth.to_json()?)).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (intent_tx, intent_rx) = mpsc::channel(config.intent_capacity.max(1));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::Hello);

        let core = Arc::new(BridgeCore {
            config,
            status: Arc::new(status_tx),
            signals: signal_tx,
            outbound: outbound_tx,
            local,
            opponent,
            mirror: Mutex::new(Mirror::default()),
            relay: Mutex::new(None),
            lost: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(write_loop(write, outbound_rx, core.clone())),
            tokio::spawn(read_loop(read, core.clone())),
            tokio::spawn(intent_loop(intent_rx, core.clone())),
        ];

        let bridge = Self { core, intents: intent_tx, status: status_rx, tasks };
        Ok((bridge, signal_rx))
    }

    /// Queue an intent without waiting. Safe to call from the UI thread.
    pub fn submit(&self, intent: Intent) -> Result<(), BridgeError> {
        self.intents.try_send(intent).map_err(|e| match e {
            TrySendError::Full(_) => BridgeError::QueueFull,
            TrySendError::Closed(_) => BridgeError::Closed,
        })
    }

    /// Queue an intent, waiting for room.
    pub async fn send(&self, intent: Intent) -> Result<(), BridgeError> {
        self.intents.send(intent).await.map_err(|_| BridgeError::Closed)
    }

    /// Id this bridge authenticated as.
    pub fn player_id(&self) -> &PlayerId {
        &self.core.config.player_id
    }

    /// Current status.
    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Last waiting list received.
    pub fn waiters(&self) -> Vec<PlayerId> {
        guard(&self.core.mirror).waiters.clone()
    }

    /// Last approacher list received.
    pub fn approachers(&self) -> Vec<PlayerId> {
        guard(&self.core.mirror).approachers.clone()
    }

    /// Opponent of the current match, if any.
    pub fn opponent_id(&self) -> Option<PlayerId> {
        guard(&self.core.mirror).opponent.clone()
    }

    /// False once the connection has been lost.
    pub fn is_connected(&self) -> bool {
        !self.core.lost.load(Ordering::SeqCst)
    }
}

impl Drop for ProtocolBridge {
    fn drop(&mut self) {
        self.core.abort_relay();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    core: Arc<BridgeCore>,
) {
    while let Some(msg) = outbound.recv().await {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize {}: {}", msg.tag(), e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(text)).await {
            error!("Failed to send {}: {}", msg.tag(), e);
            core.connection_lost();
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(mut read: SplitStream<WsStream>, core: Arc<BridgeCore>) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                Ok(Some(msg)) => core.dispatch(msg),
                Ok(None) => debug!("Ignoring server frame: {}", text),
                Err(e) => warn!("Failed to decode server message: {}", e),
            },
            Ok(Message::Close(_)) => {
                info!("Server closed connection");
                break;
            }
            Err(e) => {
                error!("WebSocket read error: {}", e);
                break;
            }
            Ok(_) => {}
        }
    }
    core.connection_lost();
}

async fn intent_loop(mut intents: mpsc::Receiver<Intent>, core: Arc<BridgeCore>) {
    while let Some(intent) = intents.recv().await {
        if let Err(e) = core.handle_intent(intent).await {
            debug!("Intent loop stopping: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::engine::{shared, SnapshotGame};
    use crate::network::server::{RelayServer, ServerConfig};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct TestCore {
        core: Arc<BridgeCore>,
        outbound: mpsc::Receiver<ClientMessage>,
        signals: SignalReceiver,
    }

    fn test_core(config: BridgeConfig) -> TestCore {
        let (outbound_tx, outbound) = mpsc::channel(16);
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let core = Arc::new(BridgeCore {
            config,
            status: Arc::new(watch::channel(ClientStatus::Hello).0),
            signals: signal_tx,
            outbound: outbound_tx,
            local: shared(SnapshotGame::new()),
            opponent: shared(SnapshotGame::new()),
            mirror: Mutex::new(Mirror::default()),
            relay: Mutex::new(None),
            lost: AtomicBool::new(false),
        });
        TestCore { core, outbound, signals }
    }

    fn offline_config() -> BridgeConfig {
        BridgeConfig::new("ws://unused", "alice", "jwt")
            .with_relay_interval(Duration::from_millis(10))
            .with_start_grace(Duration::from_millis(20))
    }

    fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn drain_signals(rx: &mut SignalReceiver) -> Vec<UiSignal> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = BridgeConfig::new("ws://localhost:8080", "alice", "jwt");
        assert_eq!(config.relay_interval, Duration::from_millis(100));
        assert_eq!(config.start_grace, Duration::from_secs(3));

        let config = config.with_intent_capacity(0).with_outbound_capacity(0);
        assert_eq!(config.intent_capacity, 1);
        assert_eq!(config.outbound_capacity, 1);
    }

    #[tokio::test]
    async fn test_second_approach_suppressed() {
        let mut t = test_core(offline_config());
        t.core.handle_intent(Intent::Approach("bob".into())).await.unwrap();
        t.core.handle_intent(Intent::Approach("bob".into())).await.unwrap();

        assert_eq!(drain(&mut t.outbound), vec![ClientMessage::Approach("bob".into())]);
        assert_eq!(t.core.status(), ClientStatus::Approaching);
    }

    #[tokio::test]
    async fn test_intents_update_status() {
        let mut t = test_core(offline_config());
        t.core.handle_intent(Intent::WaitingListAdd).await.unwrap();
        assert_eq!(t.core.status(), ClientStatus::Waiting);
        t.core.handle_intent(Intent::WaitingListRemove).await.unwrap();
        assert_eq!(t.core.status(), ClientStatus::Hello);
        t.core.handle_intent(Intent::HostReject("carol".into())).await.unwrap();

        assert_eq!(
            drain(&mut t.outbound),
            vec![
                ClientMessage::WaitingListAdd,
                ClientMessage::WaitingListRemove,
                ClientMessage::HostReject("carol".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_intent_after_queue_closed() {
        let t = test_core(offline_config());
        drop(t.outbound);
        let result = t.core.handle_intent(Intent::WaitingListGet).await;
        assert!(matches!(result, Err(BridgeError::Closed)));
    }

    fn full_snapshot(score: u64) -> serde_json::Value {
        json!({
            "score": score, "level": 2, "goal": 5,
            "matrix": [[0, 1]], "next_mino_index": 3, "hold_mino_index": -1
        })
    }

    #[tokio::test]
    async fn test_game_data_overwrites_mirror() {
        let t = test_core(offline_config());
        t.core.set_status(ClientStatus::InGame);
        t.core.dispatch(ServerMessage::GameData(full_snapshot(120)));
        assert_eq!(lock(&t.core.opponent).snapshot().score, 120);

        // Partial snapshots are dropped, not merged.
        t.core.dispatch(ServerMessage::GameData(json!({ "score": 999 })));
        assert_eq!(lock(&t.core.opponent).snapshot().score, 120);
    }

    #[tokio::test]
    async fn test_trailing_game_data_after_verdict_ignored() {
        let t = test_core(offline_config());
        t.core.set_status(ClientStatus::InGame);
        t.core.dispatch(ServerMessage::GameData(full_snapshot(120)));

        t.core.dispatch(ServerMessage::GameOver);
        t.core.dispatch(ServerMessage::Win);
        t.core.dispatch(ServerMessage::GameData(full_snapshot(80)));

        assert_eq!(t.core.status(), ClientStatus::Hello);
        assert_eq!(lock(&t.core.opponent).snapshot().score, 120);
        assert_eq!(lock(&t.core.opponent).phase(), GamePhase::GameOver);
    }

    #[tokio::test]
    async fn test_lobby_intents_ignored_during_match() {
        let mut t = test_core(offline_config());
        t.core.dispatch(ServerMessage::GameStart);
        timeout(Duration::from_secs(1), async {
            while lock(&t.core.local).phase() != GamePhase::Playing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for intent in [
            Intent::WaitingListAdd,
            Intent::WaitingListRemove,
            Intent::Approach("carol".into()),
            Intent::ApproachCancel,
        ] {
            t.core.handle_intent(intent).await.unwrap();
            assert_eq!(t.core.status(), ClientStatus::InGame);
        }

        // The relay is still alive and reports the top-out.
        lock(&t.core.local).set_phase(GamePhase::GameOver);
        let sent = timeout(Duration::from_secs(1), async {
            let mut sent = Vec::new();
            while let Some(msg) = t.outbound.recv().await {
                let done = msg == ClientMessage::GameOver;
                sent.push(msg);
                if done {
                    break;
                }
            }
            sent
        })
        .await
        .unwrap();

        assert_eq!(sent.last(), Some(&ClientMessage::GameOver));
        assert!(sent.iter().all(|m| matches!(m, ClientMessage::GameData(_) | ClientMessage::GameOver)));
        assert_eq!(t.core.status(), ClientStatus::GameOver);

        // Still in a match until the verdict arrives.
        t.core.handle_intent(Intent::WaitingListAdd).await.unwrap();
        assert_eq!(t.core.status(), ClientStatus::GameOver);
        assert!(drain(&mut t.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_opponent_game_over_marks_mirror() {
        let t = test_core(offline_config());
        t.core.dispatch(ServerMessage::GameOver);
        assert_eq!(lock(&t.core.opponent).phase(), GamePhase::GameOver);
    }

    #[tokio::test]
    async fn test_lists_and_match_set() {
        let mut t = test_core(offline_config());
        t.core.dispatch(ServerMessage::WaiterList(vec!["bob".into(), "carol".into()]));
        t.core.dispatch(ServerMessage::ApproacherList(vec!["dave".into()]));
        t.core.dispatch(ServerMessage::MatchSet("dave".into()));

        assert_eq!(
            drain_signals(&mut t.signals),
            vec![
                UiSignal::WaiterListUpdated(vec!["bob".into(), "carol".into()]),
                UiSignal::ApproacherListUpdated(vec!["dave".into()]),
                UiSignal::MatchSet("dave".into()),
            ]
        );
        assert_eq!(guard(&t.core.mirror).opponent, Some(PlayerId::from("dave")));
    }

    #[tokio::test]
    async fn test_host_rejected_returns_to_hello() {
        let mut t = test_core(offline_config());
        t.core.handle_intent(Intent::Approach("bob".into())).await.unwrap();
        t.core.dispatch(ServerMessage::HostRejected(Some("bob".into())));

        assert_eq!(t.core.status(), ClientStatus::Hello);
        assert_eq!(drain_signals(&mut t.signals), vec![UiSignal::ApproachRejected]);

        // A fresh approach is allowed again.
        drain(&mut t.outbound);
        t.core.handle_intent(Intent::Approach("carol".into())).await.unwrap();
        assert_eq!(drain(&mut t.outbound), vec![ClientMessage::Approach("carol".into())]);
    }

    #[tokio::test]
    async fn test_match_outcomes() {
        for (msg, phase) in [
            (ServerMessage::Win, GamePhase::Won),
            (ServerMessage::Lose, GamePhase::Lost),
            (ServerMessage::MatchComplete, GamePhase::Idle),
        ] {
            let mut t = test_core(offline_config());
            t.core.dispatch(msg);
            assert_eq!(lock(&t.core.local).phase(), phase);
            assert_eq!(t.core.status(), ClientStatus::Hello);
            assert_eq!(drain_signals(&mut t.signals), vec![UiSignal::Init]);
        }
    }

    #[tokio::test]
    async fn test_game_start_relays_after_grace() {
        let mut t = test_core(offline_config());
        t.core.dispatch(ServerMessage::GameStart);

        assert_eq!(t.core.status(), ClientStatus::InGame);
        assert_eq!(lock(&t.core.local).phase(), GamePhase::Ready);
        assert_eq!(drain_signals(&mut t.signals), vec![UiSignal::GameStart]);
        assert!(drain(&mut t.outbound).is_empty());

        let frame = timeout(Duration::from_secs(1), t.outbound.recv()).await.unwrap();
        assert!(matches!(frame, Some(ClientMessage::GameData(_))));
        assert_eq!(lock(&t.core.local).phase(), GamePhase::Playing);

        t.core.dispatch(ServerMessage::MatchComplete);
        assert_eq!(t.core.status(), ClientStatus::Hello);
    }

    #[tokio::test]
    async fn test_second_game_start_replaces_relay() {
        let t = test_core(offline_config());
        let (alive, aborted) = tokio::sync::oneshot::channel::<()>();
        *guard(&t.core.relay) = Some(tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await;
            RelayExit::LeftGame
        }));

        t.core.dispatch(ServerMessage::GameStart);

        // The old relay was dropped without completing.
        assert!(timeout(Duration::from_secs(1), aborted).await.unwrap().is_err());
        assert!(guard(&t.core.relay).is_some());
    }

    #[tokio::test]
    async fn test_connection_lost_signalled_once() {
        let mut t = test_core(offline_config());
        t.core.connection_lost();
        t.core.connection_lost();

        assert_eq!(t.core.status(), ClientStatus::Disconnected);
        assert_eq!(drain_signals(&mut t.signals), vec![UiSignal::ServerConnectionLost]);
    }

    // -------------------------------------------------------------------------
    // End to end against a real relay server
    // -------------------------------------------------------------------------

    struct Player {
        bridge: ProtocolBridge,
        signals: SignalReceiver,
        local: SharedInstance,
        opponent: SharedInstance,
    }

    async fn start_server() -> (Arc<RelayServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new(ServerConfig {
            bind_addr: addr,
            ..Default::default()
        }));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, format!("ws://{addr}"))
    }

    async fn join(url: &str, id: &str) -> Player {
        let config = BridgeConfig::new(url, id, "opaque")
            .with_relay_interval(Duration::from_millis(20))
            .with_start_grace(Duration::from_millis(50));
        let local = shared(SnapshotGame::new());
        let opponent = shared(SnapshotGame::new());
        let (bridge, signals) =
            ProtocolBridge::connect(config, local.clone(), opponent.clone()).await.unwrap();
        Player { bridge, signals, local, opponent }
    }

    async fn expect_signal(player: &mut Player, expected: UiSignal) {
        let deadline = Duration::from_secs(3);
        timeout(deadline, async {
            while let Some(signal) = player.signals.recv().await {
                if signal == expected {
                    return;
                }
            }
            panic!("signal channel closed");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected));
    }

    async fn eventually<F: FnMut() -> bool>(mut check: F) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_match_between_two_bridges() {
        let (server, url) = start_server().await;
        let mut alice = join(&url, "alice").await;
        let mut bob = join(&url, "bob").await;
        let dir = server.directory().clone();

        alice.bridge.submit(Intent::WaitingListAdd).unwrap();
        for _ in 0..300 {
            if dir.waiting_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        bob.bridge.submit(Intent::WaitingListGet).unwrap();
        expect_signal(&mut bob, UiSignal::WaiterListUpdated(vec!["alice".into()])).await;
        assert_eq!(bob.bridge.waiters(), vec![PlayerId::from("alice")]);

        bob.bridge.submit(Intent::Approach("alice".into())).unwrap();
        bob.bridge.submit(Intent::Approach("alice".into())).unwrap();
        expect_signal(&mut alice, UiSignal::ApproacherListUpdated(vec!["bob".into()])).await;
        assert_eq!(bob.bridge.status(), ClientStatus::Approaching);

        alice.bridge.submit(Intent::HostAccept("bob".into())).unwrap();
        expect_signal(&mut alice, UiSignal::GameStart).await;
        expect_signal(&mut bob, UiSignal::GameStart).await;
        assert_eq!(alice.bridge.status(), ClientStatus::InGame);
        assert_eq!(bob.bridge.status(), ClientStatus::InGame);
        assert_eq!(alice.bridge.opponent_id(), Some(PlayerId::from("bob")));
        assert_eq!(dir.waiting_count().await, 0);

        // Wait for the grace period, then put a score on alice's board.
        eventually(|| lock(&alice.local).phase() == GamePhase::Playing).await;
        lock(&alice.local).apply_snapshot(&GameStateSnapshot { score: 120, ..Default::default() });
        eventually(|| lock(&bob.opponent).snapshot().score == 120).await;

        // Alice tops out.
        lock(&alice.local).set_phase(GamePhase::GameOver);
        expect_signal(&mut bob, UiSignal::Init).await;
        eventually(|| lock(&alice.local).phase() == GamePhase::Lost).await;
        eventually(|| lock(&bob.local).phase() == GamePhase::Won).await;
        assert_eq!(lock(&bob.opponent).phase(), GamePhase::GameOver);
        eventually(|| alice.bridge.status() == ClientStatus::Hello).await;
        eventually(|| bob.bridge.status() == ClientStatus::Hello).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_opponent_drop_and_server_loss() {
        let (server, url) = start_server().await;
        let alice = join(&url, "alice").await;
        let mut bob = join(&url, "bob").await;
        let dir = server.directory().clone();

        alice.bridge.submit(Intent::WaitingListAdd).unwrap();
        for _ in 0..300 {
            if dir.waiting_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bob.bridge.submit(Intent::Approach("alice".into())).unwrap();
        for _ in 0..300 {
            if !dir.list_approachers(&"alice".into()).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        alice.bridge.submit(Intent::HostAccept("bob".into())).unwrap();
        expect_signal(&mut bob, UiSignal::GameStart).await;

        drop(alice);
        expect_signal(&mut bob, UiSignal::Init).await;
        eventually(|| bob.bridge.status() == ClientStatus::Hello).await;
        assert_eq!(lock(&bob.local).phase(), GamePhase::Idle);
        assert_eq!(dir.waiting_count().await, 0);

        server.shutdown();
        expect_signal(&mut bob, UiSignal::ServerConnectionLost).await;
        assert_eq!(bob.bridge.status(), ClientStatus::Disconnected);
        assert!(!bob.bridge.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = BridgeConfig::new(format!("ws://{addr}"), "alice", "jwt");
        let result = ProtocolBridge::connect(
            config,
            shared(SnapshotGame::new()),
            shared(SnapshotGame::new()),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Connect(_))));
    }
}
