//! End-to-end runs of the client runtime against an in-memory command API
//! and an in-memory push connector.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use huayi_im::connection::TransportHandle;
use huayi_im::credentials::Credentials;
use huayi_im::{
    ApiError, Client, ClientHandle, CommandApi, ConnectionConfig, Connector, CredentialStore,
    MemoryCredentialStore, SendRequest, TransportEvent,
};
use huayi_store::{AuthState, ConnectionState, ConversationKey, ConversationKind, State};

// =============================================================================
// Fakes
// =============================================================================

struct Socket {
    generation: u64,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
struct Sockets(Arc<Mutex<Vec<Socket>>>);

impl Sockets {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn last(&self) -> (u64, mpsc::Sender<TransportEvent>) {
        let sockets = self.0.lock().unwrap();
        let socket = sockets.last().expect("no socket opened");
        (socket.generation, socket.events.clone())
    }

    fn is_cancelled(&self, index: usize) -> bool {
        self.0.lock().unwrap()[index].cancel.is_cancelled()
    }

    fn written(&self, index: usize) -> Vec<serde_json::Value> {
        let mut sockets = self.0.lock().unwrap();
        let mut frames = Vec::new();
        while let Ok(text) = sockets[index].outbound.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    async fn push(&self, text: &str) {
        let (generation, events) = self.last();
        events
            .send(TransportEvent::Frame {
                generation,
                text: text.to_string(),
            })
            .await
            .unwrap();
    }
}

/// Opens immediately, like a healthy server.
struct InstantConnector(Sockets);

impl Connector for InstantConnector {
    fn open(
        &self,
        _url: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let _ = events.try_send(TransportEvent::Open { generation });
        self.0.0.lock().unwrap().push(Socket {
            generation,
            events,
            outbound: outbound_rx,
            cancel: cancel.clone(),
        });
        TransportHandle {
            outbound: outbound_tx,
            cancel,
        }
    }
}

#[derive(Default)]
struct ApiState {
    calls: Vec<String>,
    sent: Vec<SendRequest>,
    groups: Vec<String>,
    users_error: Option<ApiError>,
    send_error: Option<ApiError>,
}

/// Uses the default `probe_session`, so probes go through `list_users`.
#[derive(Clone, Default)]
struct Server(Arc<Mutex<ApiState>>);

impl Server {
    fn with_groups(groups: &[&str]) -> Self {
        let server = Self::default();
        server.0.lock().unwrap().groups = groups.iter().map(|g| g.to_string()).collect();
        server
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    fn sent(&self) -> Vec<SendRequest> {
        self.0.lock().unwrap().sent.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().calls.push(call.into());
    }
}

#[async_trait]
impl CommandApi for Server {
    async fn login(&self, username: &str) -> Result<String, ApiError> {
        self.record(format!("login {username}"));
        Ok(format!("sid-{username}"))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.record("logout");
        Ok(())
    }

    async fn list_users(&self, online: Option<bool>) -> Result<Vec<String>, ApiError> {
        self.record(format!("list_users {online:?}"));
        match self.0.lock().unwrap().users_error.clone() {
            Some(err) => Err(err),
            None => Ok(vec!["Harry".to_string(), "Ron".to_string()]),
        }
    }

    async fn list_groups(&self) -> Result<Vec<String>, ApiError> {
        self.record("list_groups");
        Ok(self.0.lock().unwrap().groups.clone())
    }

    async fn create_group(&self, id: &str) -> Result<(), ApiError> {
        self.record(format!("create_group {id}"));
        Err(ApiError::new(409, "topic exists"))
    }

    async fn delete_group(&self, id: &str) -> Result<(), ApiError> {
        self.record(format!("delete_group {id}"));
        Ok(())
    }

    async fn join_group(&self, id: &str) -> Result<(), ApiError> {
        self.record(format!("join_group {id}"));
        Ok(())
    }

    async fn quit_group(&self, id: &str) -> Result<(), ApiError> {
        self.record(format!("quit_group {id}"));
        Ok(())
    }

    async fn send_message(&self, request: &SendRequest) -> Result<(), ApiError> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(format!("send_message {}", request.id));
        if let Some(err) = state.send_error.clone() {
            return Err(err);
        }
        state.sent.push(request.clone());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    handle: ClientHandle,
    server: Server,
    sockets: Sockets,
    credentials: Arc<MemoryCredentialStore>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn start(server: Server, saved: Credentials) -> Harness {
    let sockets = Sockets::default();
    let credentials = Arc::new(MemoryCredentialStore::with(saved));
    let (client, handle) = Client::new(
        Arc::new(server.clone()),
        credentials.clone(),
        Box::new(InstantConnector(sockets.clone())),
        ConnectionConfig::default(),
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(client.run(shutdown.clone()));
    Harness {
        handle,
        server,
        sockets,
        credentials,
        shutdown,
    }
}

async fn logged_in(server: Server) -> Harness {
    let h = start(server, Credentials::default());
    h.handle.login("Harry").await.unwrap();
    h.wait_for(|s| s.session.connection == ConnectionState::Connected)
        .await;
    h
}

impl Harness {
    async fn wait_for(&self, pred: impl FnMut(&State) -> bool) -> State {
        let mut rx = self.handle.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("client runtime stopped");
        state.clone()
    }
}

fn direct_frame(from: &str, content: &str) -> String {
    serde_json::json!({
        "message-type": "message",
        "from": from,
        "to": ["Harry"],
        "content-type": "text/plain",
        "content": content,
    })
    .to_string()
}

fn group_frame(from: &str, topic: &str, content: &str) -> String {
    serde_json::json!({
        "message-type": "message",
        "from": from,
        "to": [],
        "topic": topic,
        "content-type": "text/plain",
        "content": content,
    })
    .to_string()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn inbound_direct_message_counts_unread() {
    let h = logged_in(Server::default()).await;
    h.sockets.push(&direct_frame("Ron", "hi")).await;

    let ron = ConversationKey::direct("Ron");
    let state = h.wait_for(|s| s.conversation(&ron).is_some()).await;
    let conversation = state.conversation(&ron).unwrap();
    assert_eq!(conversation.unread_count, 1);
    assert_eq!(conversation.last_preview, "hi");
    assert_eq!(state.selected, None);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_send_logs_out() {
    let h = logged_in(Server::default()).await;
    h.sockets.push(&direct_frame("Ron", "hi")).await;
    let ron = ConversationKey::direct("Ron");
    h.wait_for(|s| s.conversation(&ron).is_some()).await;

    h.handle.select(Some(ron.clone())).await.unwrap();
    h.server.0.lock().unwrap().send_error = Some(ApiError::unauthorized("session expired"));
    h.handle.send(&ron, "hey", "").await.unwrap();

    // The send resolves only after the logout it forced has been applied.
    let state = h.handle.state();
    assert_eq!(state.session.auth, AuthState::LoggedOut);
    assert!(state.conversations.is_empty());
    assert!(state.order.is_empty());
    assert_eq!(state.session.me, None);
    assert_eq!(h.credentials.load(), Credentials::default());
    assert!(h.sockets.is_cancelled(0));
    assert!(h.server.calls().contains(&"logout".to_string()));
}

#[tokio::test(start_paused = true)]
async fn transient_send_failure_keeps_draft() {
    let h = logged_in(Server::default()).await;
    h.handle
        .start_conversation(ConversationKind::Direct, "Ron")
        .await
        .unwrap();
    let ron = ConversationKey::direct("Ron");
    h.handle.set_draft_text(&ron, "hey").await.unwrap();
    h.server.0.lock().unwrap().send_error = Some(ApiError::new(503, "server busy"));
    h.handle.send(&ron, "hey", "").await.unwrap();

    let state = h.handle.state();
    assert_eq!(state.session.auth, AuthState::LoggedIn);
    assert_eq!(state.session.last_error.as_deref(), Some("server busy"));
    assert_eq!(state.draft_text(&ron), "hey");
    assert!(state.conversation(&ron).unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn group_history_is_capped() {
    let h = logged_in(Server::default()).await;
    for i in 1..=201 {
        h.sockets
            .push(&group_frame("Ron", "hogwarts", &format!("msg {i}")))
            .await;
    }

    let key = ConversationKey::group("hogwarts");
    let state = h
        .wait_for(|s| {
            s.conversation(&key)
                .is_some_and(|c| c.last_preview == "msg 201")
        })
        .await;
    let conversation = state.conversation(&key).unwrap();
    assert_eq!(conversation.messages.len(), 200);
    assert_eq!(conversation.messages.front().unwrap().content, "msg 2");
    assert_eq!(conversation.messages.back().unwrap().content, "msg 201");
    assert_eq!(conversation.unread_count, 201);
}

#[tokio::test(start_paused = true)]
async fn group_send_clears_text_but_keeps_mentions() {
    let h = logged_in(Server::default()).await;
    h.handle
        .start_conversation(ConversationKind::Group, "hogwarts")
        .await
        .unwrap();
    let key = ConversationKey::group("hogwarts");
    h.handle.set_draft_text(&key, "meet at 8").await.unwrap();
    h.handle
        .set_draft_mentions(&key, "Ron, Hermione,")
        .await
        .unwrap();
    h.handle
        .send(&key, "  meet at 8 ", "Ron, Hermione,")
        .await
        .unwrap();

    let state = h.handle.state();
    assert_eq!(state.selected.as_ref(), Some(&key));
    assert_eq!(state.draft_text(&key), "");
    assert_eq!(state.draft_mentions(&key), "Ron, Hermione,");
    let conversation = state.conversation(&key).unwrap();
    assert_eq!(conversation.unread_count, 0);
    assert_eq!(conversation.last_message().unwrap().content, "meet at 8");

    let sent = h.server.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, "Harry");
    assert_eq!(sent[0].mentions, vec!["Ron", "Hermione"]);

    // Group creation conflicts are swallowed; the join still happens.
    let calls = h.server.calls();
    assert!(calls.contains(&"create_group hogwarts".to_string()));
    assert!(calls.contains(&"join_group hogwarts".to_string()));
    assert_eq!(state.session.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_reconnects_once() {
    let h = logged_in(Server::default()).await;
    let (generation, events) = h.sockets.last();

    events
        .send(TransportEvent::Error {
            generation,
            reason: "reset by peer".into(),
        })
        .await
        .unwrap();
    events
        .send(TransportEvent::Closed { generation })
        .await
        .unwrap();
    h.wait_for(|s| s.session.connection == ConnectionState::Disconnected)
        .await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(h.sockets.count(), 1);

    h.wait_for(|s| s.session.connection == ConnectionState::Connected)
        .await;
    assert_eq!(h.sockets.count(), 2);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.sockets.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_probe_is_acknowledged() {
    let h = logged_in(Server::default()).await;
    h.sockets
        .push(r#"{"message-type":"pong","message-id":1700000000000,"from":"server","to":["Harry"]}"#)
        .await;
    h.sockets.push(&direct_frame("Ron", "sync")).await;
    h.wait_for(|s| s.conversation(&ConversationKey::direct("Ron")).is_some())
        .await;

    assert_eq!(
        h.sockets.written(0),
        vec![serde_json::json!({"message-type": "ack", "ack-id": 1_700_000_000_000i64})]
    );
}

#[tokio::test(start_paused = true)]
async fn revoked_session_is_noticed_by_watchdog() {
    let h = logged_in(Server::default()).await;
    h.server.0.lock().unwrap().users_error = Some(ApiError::unauthorized("revoked"));

    let state = h.wait_for(|s| s.session.auth == AuthState::LoggedOut).await;
    assert_eq!(state, State::default());
    assert!(h.server.calls().contains(&"list_users Some(true)".to_string()));
    assert_eq!(h.credentials.session_token(), None);
}

#[tokio::test(start_paused = true)]
async fn saved_session_is_restored() {
    let h = start(
        Server::with_groups(&["hogwarts", "dada"]),
        Credentials {
            session_token: Some("sid-Harry".into()),
            username: Some("Harry".into()),
        },
    );
    assert!(h.handle.restore().await.unwrap());

    let state = h
        .wait_for(|s| {
            s.session.connection == ConnectionState::Connected && s.conversations.len() == 2
        })
        .await;
    assert_eq!(state.session.me.as_deref(), Some("Harry"));
    let titles: Vec<_> = state
        .ordered_conversations()
        .map(|c| c.title.clone())
        .collect();
    assert_eq!(titles, vec!["#hogwarts", "#dada"]);
}

#[tokio::test(start_paused = true)]
async fn relogin_starts_from_a_clean_slate() {
    let h = logged_in(Server::default()).await;
    h.sockets.push(&direct_frame("Ron", "hi")).await;
    h.wait_for(|s| !s.conversations.is_empty()).await;

    h.handle.logout().await.unwrap();
    h.handle.login("Hermione").await.unwrap();
    let state = h
        .wait_for(|s| s.session.connection == ConnectionState::Connected)
        .await;

    assert_eq!(state.session.me.as_deref(), Some("Hermione"));
    assert!(state.conversations.is_empty());
    assert_eq!(state.selected, None);
    assert_eq!(h.sockets.count(), 2);
    assert_eq!(h.credentials.session_token().as_deref(), Some("sid-Hermione"));
}
