//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use huayi_store::{Action, Store};

use crate::api::{ApiError, CommandApi, SendRequest};
use crate::connection::{Connector, TransportEvent, TransportHandle};

pub fn logged_in_store(me: &str) -> Store {
    let mut store = Store::new();
    store.dispatch(Action::AuthSucceeded { me: me.to_string() });
    store
}

// =============================================================================
// Connector
// =============================================================================

pub struct FakeSocket {
    pub url: String,
    pub generation: u64,
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub cancel: CancellationToken,
}

/// Records every socket it is asked to open. Cloning shares the record, so a
/// test keeps one clone after boxing the other into the manager.
#[derive(Clone, Default)]
pub struct FakeConnector {
    sockets: Arc<Mutex<Vec<FakeSocket>>>,
    auto_open: bool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `Open` as soon as a socket is requested.
    pub fn auto_open() -> Self {
        Self {
            auto_open: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    pub fn url(&self, index: usize) -> String {
        self.sockets.lock().unwrap()[index].url.clone()
    }

    pub fn generation(&self, index: usize) -> u64 {
        self.sockets.lock().unwrap()[index].generation
    }

    pub fn is_cancelled(&self, index: usize) -> bool {
        self.sockets.lock().unwrap()[index].cancel.is_cancelled()
    }

    /// Everything written to socket `index` so far.
    pub fn drain_outbound(&self, index: usize) -> Vec<String> {
        let mut sockets = self.sockets.lock().unwrap();
        let mut frames = Vec::new();
        while let Ok(frame) = sockets[index].outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

impl Connector for FakeConnector {
    fn open(
        &self,
        url: &str,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        if self.auto_open {
            let _ = events.try_send(TransportEvent::Open { generation });
        }
        self.sockets.lock().unwrap().push(FakeSocket {
            url: url.to_string(),
            generation,
            outbound: outbound_rx,
            cancel: cancel.clone(),
        });
        TransportHandle {
            outbound: outbound_tx,
            cancel,
        }
    }
}

// =============================================================================
// Command API
// =============================================================================

#[derive(Default)]
struct FakeApiState {
    calls: Vec<String>,
    sent: Vec<SendRequest>,
    groups: Vec<String>,
    users: Vec<String>,
    login_results: VecDeque<Result<String, ApiError>>,
    send_error: Option<ApiError>,
    probe_error: Option<ApiError>,
    group_error: Option<ApiError>,
    logout_delay: Option<Duration>,
}

/// Scriptable [`CommandApi`]. Every call is recorded by name.
#[derive(Clone, Default)]
pub struct FakeApi {
    inner: Arc<Mutex<FakeApiState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(self, groups: &[&str]) -> Self {
        self.inner.lock().unwrap().groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_users(self, users: &[&str]) -> Self {
        self.inner.lock().unwrap().users = users.iter().map(|u| u.to_string()).collect();
        self
    }

    /// Queue the result of the next login call. Without one, login succeeds
    /// with a token derived from the username.
    pub fn push_login(&self, result: Result<String, ApiError>) {
        self.inner.lock().unwrap().login_results.push_back(result);
    }

    pub fn fail_sends(&self, err: Option<ApiError>) {
        self.inner.lock().unwrap().send_error = err;
    }

    pub fn fail_probes(&self, err: Option<ApiError>) {
        self.inner.lock().unwrap().probe_error = err;
    }

    pub fn fail_group_calls(&self, err: Option<ApiError>) {
        self.inner.lock().unwrap().group_error = err;
    }

    /// Hold every later logout call for `delay` before it succeeds.
    pub fn delay_logout(&self, delay: Duration) {
        self.inner.lock().unwrap().logout_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.inner.lock().unwrap().sent.clone()
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn group_result(&self, call: String) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        match inner.group_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommandApi for FakeApi {
    async fn login(&self, username: &str) -> Result<String, ApiError> {
        self.record(format!("login {username}"));
        let scripted = self.inner.lock().unwrap().login_results.pop_front();
        scripted.unwrap_or_else(|| Ok(format!("sid-{username}")))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.record("logout".to_string());
        let delay = self.inner.lock().unwrap().logout_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn list_users(&self, online: Option<bool>) -> Result<Vec<String>, ApiError> {
        self.record(format!("list_users {online:?}"));
        Ok(self.inner.lock().unwrap().users.clone())
    }

    async fn list_groups(&self) -> Result<Vec<String>, ApiError> {
        self.record("list_groups".to_string());
        Ok(self.inner.lock().unwrap().groups.clone())
    }

    async fn create_group(&self, id: &str) -> Result<(), ApiError> {
        self.group_result(format!("create_group {id}"))
    }

    async fn delete_group(&self, id: &str) -> Result<(), ApiError> {
        self.group_result(format!("delete_group {id}"))
    }

    async fn join_group(&self, id: &str) -> Result<(), ApiError> {
        self.group_result(format!("join_group {id}"))
    }

    async fn quit_group(&self, id: &str) -> Result<(), ApiError> {
        self.group_result(format!("quit_group {id}"))
    }

    async fn send_message(&self, request: &SendRequest) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("send_message {}", request.id));
        match inner.send_error.clone() {
            Some(err) => Err(err),
            None => {
                inner.sent.push(request.clone());
                Ok(())
            }
        }
    }

    async fn probe_session(&self) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push("probe_session".to_string());
        match inner.probe_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
