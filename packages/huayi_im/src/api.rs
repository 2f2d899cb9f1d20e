//! Request/response command API collaborator.
//!
//! The core treats every call as opaque: it resolves, or fails with an
//! HTTP-style status and message. Status 401 means the session is gone.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use huayi_store::ConversationKind;

use crate::credentials::CredentialStore;
use crate::protocol::{ChatFrame, OutboundFrame};

pub const STATUS_UNAUTHORIZED: u16 = 401;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    /// HTTP status, or `None` when the request never got a response.
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(STATUS_UNAUTHORIZED, message)
    }

    pub fn is_session_invalid(&self) -> bool {
        self.status == Some(STATUS_UNAUTHORIZED)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::new(status.as_u16(), err.to_string()),
            None => Self::transport(err.to_string()),
        }
    }
}

/// Outbound chat submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub from: String,
    pub kind: ConversationKind,
    /// Peer username (direct) or group id (group).
    pub id: String,
    pub content: String,
    /// Group recipients to mention; ignored for direct sends.
    pub mentions: Vec<String>,
}

impl SendRequest {
    pub fn to_frame(&self) -> OutboundFrame {
        let chat = match self.kind {
            ConversationKind::Direct => ChatFrame::direct(&self.from, &self.id, &self.content),
            ConversationKind::Group => {
                ChatFrame::group(&self.from, &self.id, self.mentions.clone(), &self.content)
            }
        };
        OutboundFrame::Message(chat)
    }
}

#[async_trait]
pub trait CommandApi: Send + Sync {
    /// Returns the new session token.
    async fn login(&self, username: &str) -> Result<String, ApiError>;
    async fn logout(&self) -> Result<(), ApiError>;
    async fn list_users(&self, online: Option<bool>) -> Result<Vec<String>, ApiError>;
    async fn list_groups(&self) -> Result<Vec<String>, ApiError>;
    async fn create_group(&self, id: &str) -> Result<(), ApiError>;
    async fn delete_group(&self, id: &str) -> Result<(), ApiError>;
    async fn join_group(&self, id: &str) -> Result<(), ApiError>;
    async fn quit_group(&self, id: &str) -> Result<(), ApiError>;
    async fn send_message(&self, request: &SendRequest) -> Result<(), ApiError>;

    /// Lightweight check that the session is still valid. The payload of the
    /// underlying call is discarded.
    async fn probe_session(&self) -> Result<(), ApiError> {
        self.list_users(Some(true)).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserList {
    list: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    username: String,
}

#[derive(Debug, Deserialize)]
struct TopicList {
    list: Vec<TopicEntry>,
}

#[derive(Debug, Deserialize)]
struct TopicEntry {
    topic: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// HTTP implementation of [`CommandApi`]. The bearer token is read from the
/// credential store on every request.
pub struct HttpCommandApi {
    client: reqwest::Client,
    base_url: reqwest::Url,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpCommandApi {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialStore>) -> anyhow::Result<Self> {
        let base_url = reqwest::Url::parse(base_url)
            .with_context(|| format!("invalid server base_url: {base_url}"))?;
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        debug!(base_url = %base_url, "command API client ready");
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut req = self
            .client
            .request(method, self.url(segments))
            .query(query);
        if let Some(token) = self.credentials.session_token() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }
}

async fn error_from_response(resp: reqwest::Response) -> ApiError {
    let status: StatusCode = resp.status();
    let fallback = status.canonical_reason().unwrap_or("request failed").to_string();
    let message = match resp.json::<ErrorBody>().await {
        Ok(ErrorBody { error: Some(error) }) if !error.is_empty() => error,
        _ => fallback,
    };
    ApiError::new(status.as_u16(), message)
}

#[async_trait]
impl CommandApi for HttpCommandApi {
    async fn login(&self, username: &str) -> Result<String, ApiError> {
        let resp = self
            .request(
                Method::POST,
                &["api", "login"],
                &[],
                Some(json!({ "username": username })),
            )
            .await?;
        let body: LoginResponse = resp.json().await.unwrap_or(LoginResponse { sid: None });
        body.sid
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| ApiError::transport("missing session token"))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.request(Method::POST, &["api", "logout"], &[], None)
            .await
            .map(|_| ())
    }

    async fn list_users(&self, online: Option<bool>) -> Result<Vec<String>, ApiError> {
        let query: Vec<(&str, String)> = online
            .map(|o| vec![("online", o.to_string())])
            .unwrap_or_default();
        let resp = self
            .request(Method::GET, &["api", "users"], &query, None)
            .await?;
        let users: UserList = resp.json().await?;
        Ok(users.list.into_iter().map(|u| u.username).collect())
    }

    async fn list_groups(&self) -> Result<Vec<String>, ApiError> {
        let resp = self
            .request(Method::GET, &["api", "topics"], &[], None)
            .await?;
        let topics: TopicList = resp.json().await?;
        Ok(topics.list.into_iter().map(|t| t.topic).collect())
    }

    async fn create_group(&self, id: &str) -> Result<(), ApiError> {
        self.request(
            Method::POST,
            &["api", "topics"],
            &[],
            Some(json!({ "topic": id })),
        )
        .await
        .map(|_| ())
    }

    async fn delete_group(&self, id: &str) -> Result<(), ApiError> {
        self.request(Method::DELETE, &["api", "topics", id], &[], None)
            .await
            .map(|_| ())
    }

    async fn join_group(&self, id: &str) -> Result<(), ApiError> {
        self.request(
            Method::POST,
            &["api", "topics", id, "actions", "join"],
            &[],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn quit_group(&self, id: &str) -> Result<(), ApiError> {
        self.request(
            Method::POST,
            &["api", "topics", id, "actions", "quit"],
            &[],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn send_message(&self, request: &SendRequest) -> Result<(), ApiError> {
        let body = serde_json::to_value(request.to_frame())
            .map_err(|e| ApiError::transport(e.to_string()))?;
        self.request(Method::POST, &["api", "messages"], &[], Some(body))
            .await
            .map(|_| ())
    }
}
