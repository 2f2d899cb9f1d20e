//! Conversation state, actions, and the pure reducer behind the Huayi IM client.
//!
//! Nothing in this crate performs I/O. Every change to client state goes
//! through [`State::reduce`], so a replayed action sequence always produces
//! the same state.

pub mod key;
pub mod model;
pub mod reducer;

pub use key::{ConversationKey, ConversationKind, KeyParseError};
pub use model::{AuthState, ConnectionState, Conversation, Direction, Message, Session};
pub use reducer::{Action, MESSAGE_HISTORY_LIMIT, State, Store};
