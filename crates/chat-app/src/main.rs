use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use trickle::chat::{
    ChatController, MessageEntry, MessageId, MessageStore, WAITING_PLACEHOLDER,
};
use trickle::settings::{AppSettings, SettingsStore};
use trickle::{AppResult, ChatApp};
use trickle_reactive::{Change, Subscription};

const HELP: &str =
    "commands: /list, /delete <id>, /set <key> <value>, /reload, /help, /quit";

/// A running chat plus the subscription echoing its replies.
struct Session {
    app: ChatApp,
    _echo: Subscription,
}

impl Session {
    fn start(settings: &AppSettings) -> AppResult<Self> {
        let app = ChatApp::from_settings(settings)?;
        let echo = echo_streams(app.controller.store(), Arc::default());
        Ok(Self { app, _echo: echo })
    }

    fn controller(&self) -> &ChatController {
        &self.app.controller
    }

    /// Swaps in a session built from `settings`, keeping the old one on failure.
    fn restart(&mut self, settings: &AppSettings) {
        match Self::start(settings) {
            Ok(next) => {
                *self = next;
                println!("settings applied ({} transport)", self.app.transport_name);
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to apply settings");
                println!("keeping the current session: {error}");
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::debug!(config_path = ?settings_store.config_path(), "settings loaded");

    let mut session = match Session::start(&settings) {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(error = %error, "failed to start chat session");
            std::process::exit(1);
        }
    };

    print_history(session.controller());
    println!("Welcome to trickle! You can start by saying \"Hello!\" ({HELP})");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read input");
                break;
            }
        };

        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(head, rest)| (head, rest.trim())) {
            ("", _) => continue,
            ("/quit" | "/exit", _) => break,
            ("/help", _) => println!("{HELP}"),
            ("/list", _) => print_history(session.controller()),
            ("/delete", id) if !id.is_empty() => {
                match session.controller().delete(&MessageId::from(id)) {
                    Some(_) => println!("deleted {id}"),
                    None => println!("no message with id {id}"),
                }
            }
            ("/delete", _) => println!("usage: /delete <id>"),
            ("/set", args) => match args.split_once(' ') {
                Some((key, value)) => match settings_store.set_field(key, value.trim()) {
                    Ok(settings) => session.restart(&settings),
                    Err(error) => println!("{error}"),
                },
                None => println!("usage: /set <key> <value>, e.g. /set transport simulated"),
            },
            ("/reload", _) => {
                let settings = settings_store.reload();
                session.restart(&settings);
            }
            _ => match session.controller().submit(line) {
                Ok(sender_id) => {
                    session.controller().wait_idle().await;
                    if let Some(error) = session
                        .controller()
                        .store()
                        .get(&sender_id)
                        .and_then(|entry| entry.error)
                    {
                        println!("{error}");
                    }
                }
                Err(error) => println!("{error}"),
            },
        }
    }
}

fn print_history(controller: &ChatController) {
    for entry in controller.messages().values() {
        println!("{}", format_entry(entry));
    }
}

fn format_entry(entry: &MessageEntry) -> String {
    let who = if entry.is_sender { "you" } else { "bot" };
    let mut line = format!("[{}] {who}: {}", entry.id, entry.display_text());
    if let Some(error) = entry.error.as_deref().filter(|_| !entry.text.current().is_empty()) {
        line.push_str(&format!("\n    ! {}", error.replace('\n', " ")));
    }
    line
}

/// Prints each new response as it streams in.
///
/// `attached` holds the ids of live entries being echoed; an id leaves the set
/// once its text closes.
fn echo_streams(store: &MessageStore, attached: Arc<Mutex<HashSet<MessageId>>>) -> Subscription {
    store.subscribe(move |entries| {
        for entry in entries.values() {
            let Some(live_text) = entry.text.live() else {
                continue;
            };
            if live_text.is_closed() || !attached.lock().insert(entry.id.clone()) {
                continue;
            }

            let attached = Arc::clone(&attached);
            let id = entry.id.clone();
            let printed = Mutex::new(0_usize);
            live_text
                .subscribe(move |change: Change<'_, String>| {
                    let text = change.value();
                    let mut printed = printed.lock();
                    if text != WAITING_PLACEHOLDER
                        && let Some(delta) = text.get(*printed..).filter(|delta| !delta.is_empty())
                    {
                        if *printed == 0 {
                            print!("bot: ");
                        }
                        print!("{delta}");
                        *printed = text.len();
                    }
                    if change.is_closed() {
                        println!();
                        attached.lock().remove(&id);
                    }
                    let _ = std::io::stdout().flush();
                })
                .detach();
        }
    })
}
