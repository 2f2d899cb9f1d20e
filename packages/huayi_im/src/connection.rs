//! ConnectionManager: the self-healing push connection.
//!
//! Lifecycle is `disconnected → connecting → connected → disconnected`. Each
//! successful open starts a ping emitter and a watchdog; every error or close
//! tears both down and, while logged in, schedules a reconnect with a linear
//! capped backoff. All methods are synchronous state transitions driven by the
//! session runtime's single dispatch loop; the only suspension point is
//! [`ConnectionManager::next_tick`].

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use huayi_store::{Action, ConnectionState, Store};

use crate::credentials::CredentialStore;
use crate::heartbeat::{Backoff, BackoffPolicy, Heartbeat, HeartbeatConfig};
use crate::protocol::OutboundFrame;
use crate::router::{self, InboundFrame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Push-channel URL without the session query parameter.
    pub ws_url: String,
    pub heartbeat: HeartbeatConfig,
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/api/ws".to_string(),
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Transport callbacks, tagged with the generation of the socket that
/// produced them so late events from a replaced socket can be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open { generation: u64 },
    Frame { generation: u64, text: String },
    Error { generation: u64, reason: String },
    Closed { generation: u64 },
}

impl TransportEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Open { generation }
            | Self::Frame { generation, .. }
            | Self::Error { generation, .. }
            | Self::Closed { generation } => *generation,
        }
    }
}

/// The manager's side of one socket: a queue of outbound text frames and a
/// token that closes the socket when cancelled.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<String>,
    pub cancel: CancellationToken,
}

/// Opens duplex channels. Implementations report progress exclusively
/// through `events`: `Open`, any number of `Frame`s, then `Error` and/or
/// `Closed`.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        url: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Heartbeat,
    Watchdog,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Done,
    /// The watchdog wants the command API asked whether the session is alive.
    ProbeSession,
    /// The watchdog found the connection silent and closed it.
    ForcedClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Opening,
    Open,
    Closed,
}

struct Link {
    generation: u64,
    handle: TransportHandle,
    state: LinkState,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Box<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    events_tx: mpsc::Sender<TransportEvent>,
    link: Option<Link>,
    generation: u64,
    heartbeat: Heartbeat,
    backoff: Backoff,
    ping_timer: Option<Interval>,
    watchdog_timer: Option<Interval>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Box<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            config,
            connector,
            credentials,
            events_tx,
            link: None,
            generation: 0,
            heartbeat: Heartbeat::new(Instant::now()),
            backoff,
            ping_timer: None,
            watchdog_timer: None,
            reconnect_timer: None,
        }
    }

    /// Open the push connection if logged in, a session token is available,
    /// and no socket is already open or opening. Returns whether a new
    /// socket was requested.
    pub fn connect(&mut self, store: &mut Store) -> bool {
        let session = store.session();
        if !session.is_logged_in() || session.me.is_none() {
            debug!(auth = %session.auth, "not connecting: not logged in");
            return false;
        }
        if self
            .link
            .as_ref()
            .is_some_and(|link| link.state != LinkState::Closed)
        {
            debug!("not connecting: socket already open or opening");
            return false;
        }
        let Some(token) = self.credentials.session_token() else {
            debug!("not connecting: no session token");
            return false;
        };
        let url = match url_with_session(&self.config.ws_url, &token) {
            Ok(url) => url,
            Err(e) => {
                warn!(ws_url = %self.config.ws_url, error = %e, "invalid push channel URL");
                return false;
            }
        };

        self.generation += 1;
        info!(generation = self.generation, "opening push connection");
        store.dispatch(Action::ConnectionStateChanged(ConnectionState::Connecting));
        let handle = self
            .connector
            .open(&url, self.generation, self.events_tx.clone());
        self.link = Some(Link {
            generation: self.generation,
            handle,
            state: LinkState::Opening,
        });
        true
    }

    /// Apply one transport event.
    pub fn handle_event(&mut self, event: TransportEvent, store: &mut Store) {
        let current = self
            .link
            .as_ref()
            .filter(|link| link.state != LinkState::Closed)
            .map(|link| link.generation);
        if current != Some(event.generation()) {
            trace!(generation = event.generation(), "ignoring stale transport event");
            return;
        }

        match event {
            TransportEvent::Open { .. } => self.on_open(store),
            TransportEvent::Frame { text, .. } => self.on_frame(&text, store),
            TransportEvent::Error { reason, .. } => {
                warn!(reason = %reason, "push connection error");
                self.on_down(store);
            }
            TransportEvent::Closed { .. } => {
                info!("push connection closed");
                self.on_down(store);
            }
        }
    }

    /// Wait for the next armed timer. Pends forever when none is armed.
    pub async fn next_tick(&mut self) -> Tick {
        tokio::select! {
            () = tick_of(&mut self.ping_timer) => Tick::Heartbeat,
            () = tick_of(&mut self.watchdog_timer) => Tick::Watchdog,
            () = sleep_of(&mut self.reconnect_timer) => Tick::Reconnect,
        }
    }

    pub fn handle_tick(&mut self, tick: Tick, store: &mut Store) -> TickOutcome {
        match tick {
            Tick::Heartbeat => {
                self.send_ping(store);
                TickOutcome::Done
            }
            Tick::Watchdog => self.on_watchdog(store),
            Tick::Reconnect => {
                self.reconnect_timer = None;
                debug!(attempt = self.backoff.attempt(), "reconnect timer fired");
                self.connect(store);
                TickOutcome::Done
            }
        }
    }

    /// Arm the reconnect timer unless one is already pending. No-op unless
    /// logged in.
    pub fn schedule_reconnect(&mut self, store: &Store) {
        if !store.session().is_logged_in() {
            return;
        }
        if self.reconnect_timer.is_some() {
            debug!("reconnect already scheduled");
            return;
        }
        let delay = self.backoff.next_delay();
        info!(
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.reconnect_timer = Some(Box::pin(sleep(delay)));
    }

    /// Tear down every timer and the socket. Safe from any state.
    pub fn shutdown(&mut self, store: &mut Store) {
        self.stop_timers();
        self.reconnect_timer = None;
        // The next login starts from attempt zero with no outstanding pings.
        self.backoff.reset();
        self.heartbeat.reset(Instant::now());
        if let Some(link) = self.link.take() {
            if link.state != LinkState::Closed {
                info!(generation = link.generation, "closing push connection");
                link.handle.cancel.cancel();
            }
        }
        store.dispatch(Action::ConnectionStateChanged(ConnectionState::Disconnected));
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    fn on_open(&mut self, store: &mut Store) {
        let now = Instant::now();
        if let Some(link) = self.link.as_mut() {
            link.state = LinkState::Open;
            info!(generation = link.generation, "push connection open");
        }
        self.backoff.reset();
        self.heartbeat.reset(now);
        store.dispatch(Action::ConnectionStateChanged(ConnectionState::Connected));

        let hb = self.config.heartbeat;
        self.ping_timer = Some(periodic(now, hb.ping_interval));
        self.watchdog_timer = Some(periodic(now, hb.watchdog_interval));
    }

    fn on_frame(&mut self, text: &str, store: &mut Store) {
        let Some(frame) = router::classify(text) else {
            return;
        };
        match frame {
            InboundFrame::Ping { message_id } => self.respond_to_probe(message_id),
            InboundFrame::Pong { message_id } => {
                // Our own ping ids are small counters; anything else is the
                // server probing us.
                if !self.confirm_own_probe(message_id) {
                    self.respond_to_probe(message_id);
                }
            }
            InboundFrame::Ack { ack_id } => {
                if !self.confirm_own_probe(ack_id) {
                    trace!(ack_id, "ack for unknown ping");
                }
            }
            InboundFrame::Message(message) => {
                store.dispatch(message.into_action(Utc::now()));
            }
        }
    }

    fn respond_to_probe(&self, message_id: i64) {
        trace!(message_id, "answering server probe");
        self.send_frame(&OutboundFrame::Ack { ack_id: message_id });
    }

    fn confirm_own_probe(&mut self, id: i64) -> bool {
        let confirmed = self.heartbeat.confirm(id, Instant::now());
        if confirmed {
            trace!(id, "ping acknowledged");
        }
        confirmed
    }

    fn send_ping(&mut self, store: &Store) {
        if !self.is_open() {
            return;
        }
        let Some(me) = store.session().me.clone() else {
            return;
        };
        let message_id = self.heartbeat.next_ping();
        trace!(message_id, "sending ping");
        self.send_frame(&OutboundFrame::Ping {
            message_id,
            from: me,
        });
    }

    fn on_watchdog(&mut self, store: &mut Store) -> TickOutcome {
        if self
            .heartbeat
            .is_stale(Instant::now(), self.config.heartbeat.stale_after)
        {
            warn!(
                pending = self.heartbeat.pending_count(),
                "no heartbeat ack within threshold, closing push connection"
            );
            self.on_down(store);
            return TickOutcome::ForcedClose;
        }
        if store.session().is_logged_in() {
            TickOutcome::ProbeSession
        } else {
            TickOutcome::Done
        }
    }

    /// Shared error/close path: the socket is gone (or being force-closed).
    fn on_down(&mut self, store: &mut Store) {
        if let Some(link) = self.link.as_mut() {
            link.state = LinkState::Closed;
            link.handle.cancel.cancel();
        }
        self.stop_timers();
        store.dispatch(Action::ConnectionStateChanged(ConnectionState::Disconnected));
        self.schedule_reconnect(store);
    }

    fn stop_timers(&mut self) {
        self.ping_timer = None;
        self.watchdog_timer = None;
    }

    fn is_open(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.state == LinkState::Open)
    }

    fn send_frame(&self, frame: &OutboundFrame) {
        let Some(link) = self.link.as_ref().filter(|l| l.state == LinkState::Open) else {
            return;
        };
        if link.handle.outbound.send(frame.to_json()).is_err() {
            debug!("push connection writer already gone");
        }
    }
}

fn periodic(now: Instant, period: std::time::Duration) -> Interval {
    // First tick one full period after open, like a browser interval.
    let mut timer = interval_at(now + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick_of(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_of(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

fn url_with_session(ws_url: &str, token: &str) -> Result<String, String> {
    let mut url = reqwest::Url::parse(ws_url).map_err(|e| e.to_string())?;
    url.query_pairs_mut().append_pair("sid", token);
    Ok(url.to_string())
}

// =============================================================================
// WebSocket connector
// =============================================================================

/// [`Connector`] backed by `tokio-tungstenite`. Each socket runs in its own
/// task that forwards frames both ways until cancelled or closed.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(
        &self,
        url: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_socket(
            url.to_string(),
            generation,
            events,
            outbound_rx,
            cancel.clone(),
        ));
        TransportHandle {
            outbound: outbound_tx,
            cancel,
        }
    }
}

async fn run_socket(
    url: String,
    generation: u64,
    events: mpsc::Sender<TransportEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(TransportEvent::Closed { generation }).await;
            return;
        }
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = events
                .send(TransportEvent::Error {
                    generation,
                    reason: e.to_string(),
                })
                .await;
            let _ = events.send(TransportEvent::Closed { generation }).await;
            return;
        }
    };
    if events
        .send(TransportEvent::Open { generation })
        .await
        .is_err()
    {
        return;
    }

    let (mut ws_write, mut ws_read) = ws_stream.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                break;
            }
            msg = outbound_rx.recv() => {
                let Some(text) = msg else { break };
                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                    let _ = events
                        .send(TransportEvent::Error { generation, reason: e.to_string() })
                        .await;
                    break;
                }
            }
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let event = TransportEvent::Frame {
                            generation,
                            text: text.as_str().to_string(),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events
                            .send(TransportEvent::Error { generation, reason: e.to_string() })
                            .await;
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(TransportEvent::Closed { generation }).await;
}
