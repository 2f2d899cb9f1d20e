//! Line-oriented chat loop.
//!
//! Input lines starting with `/` are commands; anything else is sent to the
//! selected conversation. Output is printed from watched state snapshots, so
//! inbound and outbound messages appear the same way.

use std::collections::HashMap;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use huayi_im::ClientHandle;
use huayi_store::{AuthState, ConnectionState, ConversationKey, ConversationKind, State};

const HELP: &str = "\
commands:
  /open direct <user>   start (and select) a direct conversation
  /open group <id>      create, join, and select a group
  /select <kind:id>     select a conversation, e.g. /select group:hogwarts
  /join <id>            join a group
  /quit <id>            leave a group (history is kept)
  /mentions <a,b>       set who a group message mentions
  /list                 list conversations
  /users                list online users
  /logout               log out and exit
  /exit                 exit, keeping the session
anything else is sent to the selected conversation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Open(ConversationKind, String),
    Select(ConversationKey),
    Join(String),
    Quit(String),
    Mentions(String),
    List,
    Users,
    Logout,
    Exit,
    Help,
    Send(String),
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let require_arg = |input: fn(String) -> Input, usage: &str| {
        if rest.is_empty() {
            Input::Invalid(format!("usage: {usage}"))
        } else {
            input(rest.to_string())
        }
    };

    match name {
        "open" => {
            let Some((kind, id)) = rest.split_once(char::is_whitespace) else {
                return Input::Invalid("usage: /open direct|group <id>".to_string());
            };
            match kind.parse::<ConversationKind>() {
                Ok(kind) if !id.trim().is_empty() => Input::Open(kind, id.trim().to_string()),
                _ => Input::Invalid("usage: /open direct|group <id>".to_string()),
            }
        }
        "select" => match rest.parse::<ConversationKey>() {
            Ok(key) => Input::Select(key),
            Err(e) => Input::Invalid(format!("bad conversation key: {e}")),
        },
        "join" => require_arg(Input::Join, "/join <id>"),
        "quit" => require_arg(Input::Quit, "/quit <id>"),
        "mentions" => Input::Mentions(rest.to_string()),
        "list" => Input::List,
        "users" => Input::Users,
        "logout" => Input::Logout,
        "exit" => Input::Exit,
        "help" => Input::Help,
        other => Input::Invalid(format!("unknown command /{other} (try /help)")),
    }
}

/// Turns successive state snapshots into transcript lines.
#[derive(Debug, Default)]
pub struct Transcript {
    connection: Option<ConnectionState>,
    last_error: Option<String>,
    /// Id of the last message printed per conversation.
    printed: HashMap<ConversationKey, String>,
}

impl Transcript {
    pub fn update(&mut self, state: &State) -> Vec<String> {
        let mut lines = Vec::new();

        let session = &state.session;
        // The first snapshot only sets the baseline.
        if self
            .connection
            .is_some_and(|previous| previous != session.connection)
        {
            lines.push(format!("* {}", session.connection));
        }
        self.connection = Some(session.connection);
        if session.last_error != self.last_error {
            if let Some(error) = &session.last_error {
                lines.push(format!("! {error}"));
            }
            self.last_error = session.last_error.clone();
        }

        for conversation in state.ordered_conversations() {
            let start = match self.printed.get(&conversation.key) {
                Some(last) => conversation
                    .messages
                    .iter()
                    .position(|m| &m.id == last)
                    .map_or(0, |i| i + 1),
                None => 0,
            };
            for message in conversation.messages.iter().skip(start) {
                lines.push(format!(
                    "[{}] {}: {}",
                    conversation.title, message.sender, message.content
                ));
            }
            if let Some(last) = conversation.last_message() {
                self.printed
                    .insert(conversation.key.clone(), last.id.clone());
            }
        }
        lines
    }
}

pub fn conversation_list(state: &State) -> Vec<String> {
    state
        .ordered_conversations()
        .map(|c| {
            let marker = if state.selected.as_ref() == Some(&c.key) {
                '>'
            } else {
                ' '
            };
            let unread = if c.unread_count > 0 {
                format!(" ({} unread)", c.unread_count)
            } else {
                String::new()
            };
            format!("{marker} {}  {}{unread}  {}", c.key, c.title, c.last_preview)
        })
        .collect()
}

pub async fn run(handle: &ClientHandle, user: Option<String>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let restored = match &user {
        Some(_) => false,
        None => handle.restore().await?,
    };
    if !restored {
        let username = match user {
            Some(user) => user,
            None => {
                println!("username:");
                match lines.next_line().await? {
                    Some(line) => line,
                    None => return Ok(()),
                }
            }
        };
        handle.login(&username).await?;
    }

    let state = handle.state();
    if state.session.auth != AuthState::LoggedIn {
        let reason = state
            .session
            .last_error
            .unwrap_or_else(|| "login failed".to_string());
        bail!("not logged in: {reason}");
    }
    println!(
        "logged in as {} (/help for commands)",
        state.session.me.as_deref().unwrap_or_default()
    );

    let printer = tokio::spawn(print_transcript(handle.subscribe()));
    let result = input_loop(handle, &mut lines).await;
    printer.abort();
    result
}

async fn print_transcript(mut rx: watch::Receiver<State>) {
    let mut transcript = Transcript::default();
    loop {
        let state = rx.borrow_and_update().clone();
        for line in transcript.update(&state) {
            println!("{line}");
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn input_loop<R>(handle: &ClientHandle, lines: &mut tokio::io::Lines<R>) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut logged_out = handle.subscribe();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = logged_out.wait_for(|s| s.session.auth == AuthState::LoggedOut) => {
                println!("* session ended");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Help => println!("{HELP}"),
            Input::Invalid(message) => println!("! {message}"),
            Input::Open(kind, id) => handle.start_conversation(kind, &id).await?,
            Input::Select(key) => handle.select(Some(key)).await?,
            Input::Join(id) => handle.join_group(&id).await?,
            Input::Quit(id) => handle.quit_group(&id).await?,
            Input::Mentions(text) => match handle.state().selected {
                Some(key) => handle.set_draft_mentions(&key, &text).await?,
                None => println!("! no conversation selected"),
            },
            Input::List => {
                for entry in conversation_list(&handle.state()) {
                    println!("{entry}");
                }
            }
            Input::Users => match handle.list_users(Some(true)).await {
                Ok(users) => println!("online: {}", users.join(", ")),
                Err(e) => debug!(error = %e, "listing users failed"),
            },
            Input::Logout => {
                handle.logout().await?;
                println!("logged out");
                return Ok(());
            }
            Input::Exit => return Ok(()),
            Input::Send(text) => {
                let state = handle.state();
                let Some(key) = state.selected.clone() else {
                    println!("! no conversation selected (try /open or /select)");
                    continue;
                };
                let mentions = state.draft_mentions(&key).to_string();
                handle.set_draft_text(&key, &text).await?;
                handle.send(&key, &text, &mentions).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huayi_store::{Action, Direction, Message, Store};

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_input("/open group hogwarts"),
            Input::Open(ConversationKind::Group, "hogwarts".into())
        );
        assert_eq!(
            parse_input("  /open direct Ron "),
            Input::Open(ConversationKind::Direct, "Ron".into())
        );
        assert_eq!(
            parse_input("/select direct:Ron"),
            Input::Select(ConversationKey::direct("Ron"))
        );
        assert_eq!(parse_input("/join dada"), Input::Join("dada".into()));
        assert_eq!(
            parse_input("/mentions Ron, Hermione"),
            Input::Mentions("Ron, Hermione".into())
        );
        assert_eq!(parse_input("/mentions"), Input::Mentions(String::new()));
        assert_eq!(parse_input("/exit"), Input::Exit);
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input(" hello there "), Input::Send("hello there".into()));
    }

    #[test]
    fn rejects_bad_commands() {
        for line in ["/open", "/open team x", "/open group  ", "/join", "/select nope", "/dance"] {
            assert!(
                matches!(parse_input(line), Input::Invalid(_)),
                "expected {line:?} to be invalid"
            );
        }
    }

    #[test]
    fn transcript_prints_each_message_once() {
        let mut store = Store::new();
        store.dispatch(Action::AuthSucceeded { me: "Harry".into() });
        let mut transcript = Transcript::default();
        assert!(transcript.update(store.state()).is_empty());

        let deliver = |store: &mut Store, content: &str| {
            store.dispatch(Action::MessageDelivered {
                kind: ConversationKind::Direct,
                id: "Ron".into(),
                message: Message::new(Utc::now(), Direction::Inbound, "Ron", content),
            });
        };
        deliver(&mut store, "hi");
        assert_eq!(transcript.update(store.state()), vec!["[Ron] Ron: hi"]);
        assert!(transcript.update(store.state()).is_empty());

        deliver(&mut store, "you there?");
        store.dispatch(Action::ConnectionStateChanged(ConnectionState::Connected));
        store.dispatch(Action::ErrorSet(Some("send failed".into())));
        assert_eq!(
            transcript.update(store.state()),
            vec!["* connected", "! send failed", "[Ron] Ron: you there?"]
        );
    }

    #[test]
    fn conversation_list_marks_selection_and_unread() {
        let mut store = Store::new();
        store.dispatch(Action::AuthSucceeded { me: "Harry".into() });
        store.dispatch(Action::MessageDelivered {
            kind: ConversationKind::Group,
            id: "hogwarts".into(),
            message: Message::new(Utc::now(), Direction::Inbound, "Ron", "hi all"),
        });
        store.dispatch(Action::ConversationEnsured {
            kind: ConversationKind::Direct,
            id: "Ron".into(),
        });
        store.dispatch(Action::ConversationSelected(Some(ConversationKey::direct(
            "Ron",
        ))));

        assert_eq!(
            conversation_list(store.state()),
            vec![
                "  group:hogwarts  #hogwarts (1 unread)  hi all",
                "> direct:Ron  Ron  ",
            ]
        );
    }
}
