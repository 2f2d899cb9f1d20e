//! Session, push-connection, and delivery core of the Huayi IM client.
//!
//! The [`session::Client`] runtime ties together the conversation store from
//! `huayi_store`, the self-healing push connection ([`connection`]), the
//! command API ([`api`]), and the persisted credentials ([`credentials`]).

pub mod api;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod heartbeat;
pub mod outbound;
pub mod protocol;
pub mod router;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use api::{ApiError, CommandApi, HttpCommandApi, SendRequest};
pub use config::HuayiConfig;
pub use connection::{ConnectionConfig, ConnectionManager, Connector, TransportEvent, WsConnector};
pub use credentials::{CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use session::{Client, ClientError, ClientHandle};
