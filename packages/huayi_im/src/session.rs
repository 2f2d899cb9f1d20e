//! Session gate and client runtime.
//!
//! [`Client`] owns the store, the connection manager, and every collaborator.
//! It runs a single dispatch loop: each user command, transport event, timer
//! tick, and remote-call completion is applied to completion before the next
//! one is looked at. Remote calls run on spawned tasks and report back as
//! [`Completion`]s through the same loop, so the store is never touched from
//! more than one place.
//!
//! Callers talk to the runtime through a cloneable [`ClientHandle`] and
//! observe it through a `watch` channel of [`State`] snapshots.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huayi_store::{Action, AuthState, ConversationKey, ConversationKind, State, Store};

use crate::api::{ApiError, CommandApi};
use crate::connection::{
    ConnectionConfig, ConnectionManager, Connector, Tick, TickOutcome, TransportEvent,
};
use crate::credentials::CredentialStore;
use crate::outbound::{self, GroupCommand, PendingSend, SendFailure};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const TRANSPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client runtime has shut down")]
    Closed,

    #[error(transparent)]
    Api(#[from] ApiError),
}

type Done = oneshot::Sender<()>;
type Reply<T> = oneshot::Sender<Result<T, ApiError>>;

/// User intents accepted by the runtime.
#[derive(Debug)]
enum Command {
    Login {
        username: String,
        done: Done,
    },
    Restore {
        done: oneshot::Sender<bool>,
    },
    Logout {
        done: Done,
    },
    Send {
        key: ConversationKey,
        content: String,
        mentions: String,
        done: Done,
    },
    StartConversation {
        kind: ConversationKind,
        id: String,
    },
    Select(Option<ConversationKey>),
    SetDraftText {
        key: ConversationKey,
        text: String,
    },
    SetDraftMentions {
        key: ConversationKey,
        text: String,
    },
    DismissError,
    Group {
        command: GroupCommand,
        id: String,
        done: Done,
    },
    ListUsers {
        online: Option<bool>,
        reply: Reply<Vec<String>>,
    },
    ListGroups {
        reply: Reply<Vec<String>>,
    },
}

/// Results of remote calls, fed back into the dispatch loop.
///
/// `epoch` is the login epoch the call was issued in; results that arrive
/// after a logout or a new login are dropped.
enum Completion {
    Login {
        username: String,
        result: Result<String, ApiError>,
        done: Done,
    },
    Restore {
        username: String,
        result: Result<(), ApiError>,
        done: oneshot::Sender<bool>,
    },
    LoggedOut {
        epoch: u64,
    },
    Groups {
        epoch: u64,
        result: Result<Vec<String>, ApiError>,
    },
    Sent {
        epoch: u64,
        pending: PendingSend,
        result: Result<(), ApiError>,
        done: Done,
    },
    Command {
        epoch: u64,
        fallback: &'static str,
        result: Result<(), ApiError>,
        done: Option<Done>,
    },
    Probe {
        epoch: u64,
        result: Result<(), ApiError>,
    },
}

/// A logout whose remote call is still in flight.
struct PendingLogout {
    epoch: u64,
    waiters: Vec<Done>,
}

enum LoopEvent {
    Command(Command),
    Transport(TransportEvent),
    Tick(Tick),
    Completion(Completion),
}

/// Cloneable front door to a running [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<State>,
}

impl ClientHandle {
    /// Latest published state.
    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// Log in and wait until the attempt has been applied. The outcome is in
    /// the session state (`auth` and `last_error`).
    pub async fn login(&self, username: &str) -> Result<(), ClientError> {
        let username = username.to_string();
        self.request(|done| Command::Login { username, done }).await
    }

    /// Resume a persisted session. Returns whether one was restored.
    pub async fn restore(&self) -> Result<bool, ClientError> {
        self.request(|done| Command::Restore { done }).await
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.request(|done| Command::Logout { done }).await
    }

    /// Send `content` to the conversation `key`, waiting for the remote call.
    pub async fn send(
        &self,
        key: &ConversationKey,
        content: &str,
        mentions: &str,
    ) -> Result<(), ClientError> {
        let key = key.clone();
        let content = content.to_string();
        let mentions = mentions.to_string();
        self.request(|done| Command::Send {
            key,
            content,
            mentions,
            done,
        })
        .await
    }

    pub async fn start_conversation(
        &self,
        kind: ConversationKind,
        id: &str,
    ) -> Result<(), ClientError> {
        self.post(Command::StartConversation {
            kind,
            id: id.to_string(),
        })
        .await
    }

    pub async fn select(&self, key: Option<ConversationKey>) -> Result<(), ClientError> {
        self.post(Command::Select(key)).await
    }

    pub async fn set_draft_text(&self, key: &ConversationKey, text: &str) -> Result<(), ClientError> {
        self.post(Command::SetDraftText {
            key: key.clone(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn set_draft_mentions(
        &self,
        key: &ConversationKey,
        text: &str,
    ) -> Result<(), ClientError> {
        self.post(Command::SetDraftMentions {
            key: key.clone(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn dismiss_error(&self) -> Result<(), ClientError> {
        self.post(Command::DismissError).await
    }

    pub async fn join_group(&self, id: &str) -> Result<(), ClientError> {
        self.group(GroupCommand::Join, id).await
    }

    pub async fn quit_group(&self, id: &str) -> Result<(), ClientError> {
        self.group(GroupCommand::Quit, id).await
    }

    pub async fn delete_group(&self, id: &str) -> Result<(), ClientError> {
        self.group(GroupCommand::Delete, id).await
    }

    pub async fn list_users(&self, online: Option<bool>) -> Result<Vec<String>, ClientError> {
        let users = self
            .request(|reply| Command::ListUsers { online, reply })
            .await?;
        Ok(users?)
    }

    pub async fn list_groups(&self) -> Result<Vec<String>, ClientError> {
        let groups = self.request(|reply| Command::ListGroups { reply }).await?;
        Ok(groups?)
    }

    async fn group(&self, command: GroupCommand, id: &str) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|done| Command::Group { command, id, done })
            .await
    }

    async fn post(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx)).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }
}

/// The client runtime. Build with [`Client::new`], then drive with
/// [`Client::run`] on a task of its own.
pub struct Client {
    store: Store,
    api: Arc<dyn CommandApi>,
    credentials: Arc<dyn CredentialStore>,
    connection: ConnectionManager,
    /// Whether the connection manager is currently started.
    connection_running: bool,
    /// Bumped on every login and logout; tags in-flight remote calls.
    epoch: u64,
    logout: Option<PendingLogout>,
    /// Replies owed to callers, sent once the resulting state is published.
    replies: Vec<Box<dyn FnOnce() + Send>>,
    commands_rx: mpsc::Receiver<Command>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    state_tx: watch::Sender<State>,
}

impl Client {
    pub fn new(
        api: Arc<dyn CommandApi>,
        credentials: Arc<dyn CredentialStore>,
        connector: Box<dyn Connector>,
        config: ConnectionConfig,
    ) -> (Self, ClientHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let store = Store::new();
        let (state_tx, state_rx) = watch::channel(store.state().clone());

        let connection =
            ConnectionManager::new(config, connector, Arc::clone(&credentials), transport_tx);
        let client = Self {
            store,
            api,
            credentials,
            connection,
            connection_running: false,
            epoch: 0,
            logout: None,
            replies: Vec::new(),
            commands_rx,
            transport_rx,
            completions_tx,
            completions_rx,
            state_tx,
        };
        let handle = ClientHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (client, handle)
    }

    /// Run until `shutdown` is cancelled or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("client runtime started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands_rx.recv() => match command {
                    Some(command) => LoopEvent::Command(command),
                    None => break,
                },
                Some(event) = self.transport_rx.recv() => LoopEvent::Transport(event),
                Some(completion) = self.completions_rx.recv() => LoopEvent::Completion(completion),
                tick = self.connection.next_tick() => LoopEvent::Tick(tick),
            };

            match event {
                LoopEvent::Command(command) => self.on_command(command),
                LoopEvent::Transport(event) => self.connection.handle_event(event, &mut self.store),
                LoopEvent::Tick(tick) => self.on_tick(tick),
                LoopEvent::Completion(completion) => self.on_completion(completion),
            }
            self.sync_connection();
            self.publish();
            for reply in self.replies.drain(..) {
                reply();
            }
        }

        self.connection.shutdown(&mut self.store);
        self.publish();
        info!("client runtime stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Login { username, done } => self.begin_login(username, done),
            Command::Restore { done } => self.begin_restore(done),
            Command::Logout { done } => self.begin_logout(Some(done)),
            Command::Send {
                key,
                content,
                mentions,
                done,
            } => self.begin_send(&key, &content, &mentions, done),
            Command::StartConversation { kind, id } => {
                let (key, remote) =
                    outbound::start_conversation(&mut self.store, kind, &id, Utc::now());
                debug!(conversation = %key, "conversation started");
                if remote {
                    let api = Arc::clone(&self.api);
                    tokio::spawn(async move {
                        outbound::ensure_group_membership(api.as_ref(), &id).await;
                    });
                }
            }
            Command::Select(key) => self.store.dispatch(Action::ConversationSelected(key)),
            Command::SetDraftText { key, text } => {
                self.store.dispatch(Action::DraftTextSet { key, text });
            }
            Command::SetDraftMentions { key, text } => {
                self.store.dispatch(Action::DraftMentionsSet { key, text });
            }
            Command::DismissError => self.store.dispatch(Action::ErrorSet(None)),
            Command::Group { command, id, done } => {
                self.store.dispatch(Action::ErrorSet(None));
                let api = Arc::clone(&self.api);
                let fallback = command.failure_message();
                self.spawn_call(move |epoch| async move {
                    let result = command.call(api.as_ref(), &id).await;
                    Completion::Command {
                        epoch,
                        fallback,
                        result,
                        done: Some(done),
                    }
                });
            }
            Command::ListUsers { online, reply } => {
                let api = Arc::clone(&self.api);
                self.spawn_call(move |epoch| async move {
                    let result = api.list_users(online).await;
                    let status = result.as_ref().map(|_| ()).map_err(Clone::clone);
                    let _ = reply.send(result);
                    Completion::Command {
                        epoch,
                        fallback: "list users failed",
                        result: status,
                        done: None,
                    }
                });
            }
            Command::ListGroups { reply } => {
                let api = Arc::clone(&self.api);
                self.spawn_call(move |epoch| async move {
                    let result = api.list_groups().await;
                    let status = result.as_ref().map(|_| ()).map_err(Clone::clone);
                    let _ = reply.send(result);
                    Completion::Command {
                        epoch,
                        fallback: "list groups failed",
                        result: status,
                        done: None,
                    }
                });
            }
        }
    }

    fn on_tick(&mut self, tick: Tick) {
        if self.connection.handle_tick(tick, &mut self.store) == TickOutcome::ProbeSession {
            let api = Arc::clone(&self.api);
            self.spawn_call(move |epoch| async move {
                Completion::Probe {
                    epoch,
                    result: api.probe_session().await,
                }
            });
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Login {
                username,
                result,
                done,
            } => {
                self.finish_login(username, result);
                self.reply(done, ());
            }
            Completion::Restore {
                username,
                result,
                done,
            } => {
                let restored = self.finish_restore(username, result);
                self.reply(done, restored);
            }
            Completion::LoggedOut { epoch } => self.finish_logout(epoch),
            Completion::Groups { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(groups) => {
                        debug!(count = groups.len(), "group list loaded");
                        for id in groups {
                            self.store.dispatch(Action::ConversationEnsured {
                                kind: ConversationKind::Group,
                                id,
                            });
                        }
                    }
                    Err(e) => debug!(error = %e, "group list unavailable (ignored)"),
                }
            }
            Completion::Sent {
                epoch,
                pending,
                result,
                done,
            } => {
                if epoch == self.epoch {
                    self.finish_send(pending, result, done);
                } else {
                    self.reply(done, ());
                }
            }
            Completion::Command {
                epoch,
                fallback,
                result,
                done,
            } => {
                match result {
                    Err(e) if epoch == self.epoch => {
                        warn!(error = %e, status = ?e.status, "{fallback}");
                        outbound::report_failure(&mut self.store, &e, fallback);
                    }
                    _ => {}
                }
                if let Some(done) = done {
                    self.reply(done, ());
                }
            }
            Completion::Probe { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(()) => debug!("session probe ok"),
                    Err(e) if e.is_session_invalid() => {
                        warn!(error = %e, "session revoked, logging out");
                        self.begin_logout(None);
                    }
                    Err(e) => debug!(error = %e, "session probe failed (ignored)"),
                }
            }
        }
    }

    // --- Login / restore / logout ---

    fn begin_login(&mut self, username: String, done: Done) {
        let username = username.trim().to_string();
        if username.is_empty() {
            self.reply(done, ());
            return;
        }
        info!(username = %username, "logging in");
        self.store.dispatch(Action::AuthStart);
        let api = Arc::clone(&self.api);
        self.spawn(async move {
            let result = api.login(&username).await;
            Completion::Login {
                username,
                result,
                done,
            }
        });
    }

    fn finish_login(&mut self, username: String, result: Result<String, ApiError>) {
        if self.store.session().auth != AuthState::LoggingIn {
            debug!("login result arrived after the attempt was abandoned");
            return;
        }
        match result {
            Ok(token) => {
                let saved = self
                    .credentials
                    .set_session_token(&token)
                    .and_then(|()| self.credentials.set_username(&username));
                if let Err(e) = saved {
                    warn!(error = %e, "failed to persist credentials");
                }
                self.authenticated(username);
            }
            Err(e) => {
                warn!(error = %e, status = ?e.status, "login failed");
                if let Err(e) = self.credentials.clear_session_token() {
                    warn!(error = %e, "failed to clear session token");
                }
                let message = if e.message.trim().is_empty() {
                    "login failed".to_string()
                } else {
                    e.message
                };
                self.store.dispatch(Action::AuthFailed { message });
            }
        }
    }

    fn begin_restore(&mut self, done: oneshot::Sender<bool>) {
        let saved = self.credentials.load();
        let (Some(username), Some(_)) = (saved.username, saved.session_token) else {
            debug!("no saved session to restore");
            self.reply(done, false);
            return;
        };
        info!(username = %username, "restoring saved session");
        let api = Arc::clone(&self.api);
        self.spawn(async move {
            let result = api.probe_session().await;
            Completion::Restore {
                username,
                result,
                done,
            }
        });
    }

    fn finish_restore(&mut self, username: String, result: Result<(), ApiError>) -> bool {
        if self.store.session().auth != AuthState::LoggedOut {
            debug!("restore result ignored: already logging in");
            return false;
        }
        match result {
            Ok(()) => {
                self.authenticated(username);
                true
            }
            Err(e) => {
                info!(error = %e, "saved session is no longer valid");
                if let Err(e) = self.credentials.clear() {
                    warn!(error = %e, "failed to clear saved credentials");
                }
                false
            }
        }
    }

    /// Enter a fresh logged-in session and bootstrap its group list.
    fn authenticated(&mut self, username: String) {
        info!(username = %username, "logged in");
        self.epoch += 1;
        // A socket opened for an earlier session carries its token.
        if self.connection_running {
            self.connection.shutdown(&mut self.store);
            self.connection_running = false;
        }
        self.store.dispatch(Action::AuthSucceeded { me: username });
        let api = Arc::clone(&self.api);
        self.spawn_call(move |epoch| async move {
            Completion::Groups {
                epoch,
                result: api.list_groups().await,
            }
        });
    }

    /// Start the full logout. Concurrent requests for the same session share
    /// the one in flight.
    fn begin_logout(&mut self, done: Option<Done>) {
        if let Some(pending) = self.logout.as_mut() {
            if pending.epoch == self.epoch {
                pending.waiters.extend(done);
                return;
            }
        }
        // A logout left over from an earlier session no longer concerns anyone.
        if let Some(stale) = self.logout.take() {
            self.release(stale.waiters);
        }
        info!("logging out");
        self.logout = Some(PendingLogout {
            epoch: self.epoch,
            waiters: done.into_iter().collect(),
        });
        let api = Arc::clone(&self.api);
        self.spawn_call(move |epoch| async move {
            if let Err(e) = api.logout().await {
                debug!(error = %e, "remote logout failed (ignored)");
            }
            Completion::LoggedOut { epoch }
        });
    }

    fn finish_logout(&mut self, epoch: u64) {
        let Some(pending) = self.logout.take_if(|pending| pending.epoch == epoch) else {
            debug!(epoch, "superseded logout finished");
            return;
        };
        if epoch == self.epoch {
            if let Err(e) = self.credentials.clear() {
                warn!(error = %e, "failed to clear saved credentials");
            }
            self.connection.shutdown(&mut self.store);
            self.connection_running = false;
            self.epoch += 1;
            self.store.dispatch(Action::AuthReset);
            info!("logged out");
        } else {
            info!("logout overtaken by a newer login; keeping that session");
        }
        self.release(pending.waiters);
    }

    fn release(&mut self, waiters: Vec<Done>) {
        for done in waiters {
            self.reply(done, ());
        }
    }

    // --- Sending ---

    fn begin_send(&mut self, key: &ConversationKey, content: &str, mentions: &str, done: Done) {
        let Some(pending) = outbound::prepare_send(&mut self.store, key, content, mentions) else {
            self.reply(done, ());
            return;
        };
        let api = Arc::clone(&self.api);
        self.spawn_call(move |epoch| async move {
            let result = api.send_message(&pending.request).await;
            Completion::Sent {
                epoch,
                pending,
                result,
                done,
            }
        });
    }

    /// Apply a send result. A rejected session answers the caller only once
    /// the logout it triggers has finished.
    fn finish_send(&mut self, pending: PendingSend, result: Result<(), ApiError>, done: Done) {
        match result {
            Ok(()) => outbound::commit_send(&mut self.store, pending, Utc::now()),
            Err(e) => {
                warn!(error = %e, status = ?e.status, conversation = %pending.key, "send failed");
                if outbound::fail_send(&mut self.store, &e) == SendFailure::SessionInvalid {
                    self.begin_logout(Some(done));
                    return;
                }
            }
        }
        self.reply(done, ());
    }

    // --- Plumbing ---

    /// Start the connection manager when the session becomes logged in and
    /// stop it when it leaves that state.
    fn sync_connection(&mut self) {
        let logged_in = self.store.session().is_logged_in();
        if logged_in && !self.connection_running {
            self.connection_running = true;
            self.connection.connect(&mut self.store);
        } else if !logged_in && self.connection_running {
            self.connection_running = false;
            self.connection.shutdown(&mut self.store);
        }
    }

    fn publish(&self) {
        let state = self.store.state();
        self.state_tx.send_if_modified(|published| {
            if published == state {
                false
            } else {
                *published = state.clone();
                true
            }
        });
    }

    fn reply<T: Send + 'static>(&mut self, tx: oneshot::Sender<T>, value: T) {
        self.replies.push(Box::new(move || {
            let _ = tx.send(value);
        }));
    }

    fn spawn<F>(&self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = completions.send(call.await);
        });
    }

    /// Spawn a remote call tagged with the current login epoch.
    fn spawn_call<F, Fut>(&self, make: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        self.spawn(make(self.epoch));
    }
}
