use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use murmur_client::config::DEFAULT_PRESENCE_INTERVAL_SECS;
use murmur_client::models::input::Credentials;
use murmur_client::models::{MessageType, Profile};
use murmur_client::utils::{format_time, presence_label};
use murmur_client::{
    AuthClient, AuthSession, ChatSession, ChatStore, ClientConfig, NoticeLevel,
    RemoteStore, SessionEvent, SqliteStore,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "murmur", version, about = "Terminal client for Murmur chats")]
struct Cli {
    /// Seconds between presence heartbeats
    #[arg(long, env = "MURMUR_PRESENCE_INTERVAL_SECS", default_value_t = DEFAULT_PRESENCE_INTERVAL_SECS)]
    presence_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat against a local SQLite database
    Local {
        #[arg(long, env = "MURMUR_DB_PATH", default_value = "murmur.db")]
        db: PathBuf,
        /// User id to act as
        #[arg(long)]
        user: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Sign in to the hosted backend
    Remote {
        #[arg(long, env = "MURMUR_BACKEND_URL")]
        backend_url: String,
        #[arg(long, env = "MURMUR_ANON_KEY", hide_env_values = true)]
        anon_key: String,
        #[arg(long, env = "MURMUR_REALTIME_URL")]
        realtime_url: Option<String>,
        #[arg(long, env = "MURMUR_EMAIL")]
        email: String,
        #[arg(long, env = "MURMUR_PASSWORD", hide_env_values = true)]
        password: String,
        /// Register the account before signing in
        #[arg(long)]
        sign_up: bool,
    },
}

const HELP: &str = "\
commands:
  /chats                     list chats
  /users                     list users
  /open <id>                 open a chat (user id or group id)
  /close                     close the open chat
  /image <path>              send an image
  /group <name> <id,id,...>  create a group
  /pin <id>  /block <id>  /remove <id>
  /delete <msg>  /unsend <msg>  /info <msg>
  /quit
anything else is sent to the open chat";

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> murmur_client::Result<()> {
    let presence = Duration::from_secs(cli.presence_secs.max(1));

    match cli.command {
        Command::Local { db, user, email } => {
            let store = Arc::new(SqliteStore::open(&db)?);
            if store.get_profile(&user).await?.is_none() {
                let email = email.clone().unwrap_or_else(|| format!("{}@localhost", user));
                store.upsert_profile(&Profile::new(user.clone(), email))?;
            }
            info!(path = %db.display(), user = %user, "Using local database");

            let auth = AuthSession {
                user_id: user,
                email,
                access_token: String::new(),
            };
            let session = ChatSession::start(store, &auth).await?;
            chat_loop(&session, presence).await
        }
        Command::Remote {
            backend_url,
            anon_key,
            realtime_url,
            email,
            password,
            sign_up,
        } => {
            let mut config = ClientConfig::new(backend_url, anon_key);
            config.realtime_url = realtime_url;
            config.presence_interval = presence;

            let auth_client = AuthClient::new(&config)?;
            let credentials = Credentials { email, password };
            if sign_up && auth_client.sign_up(&credentials).await?.is_none() {
                println!("Registered. Check your inbox to confirm the address, then sign in.");
                return Ok(());
            }
            let auth = auth_client.sign_in(&credentials).await?;

            let store = Arc::new(RemoteStore::connect(&config, &auth)?);
            let session = ChatSession::start(store.clone(), &auth).await?;
            let result = chat_loop(&session, config.presence_interval).await;

            store.shutdown();
            auth_client.sign_out(&auth).await?;
            result
        }
    }
}

async fn chat_loop(session: &ChatSession, presence: Duration) -> murmur_client::Result<()> {
    let presence_task = session.spawn_presence(presence);
    let sync_task = session.spawn_sync();
    let printer = spawn_printer(session.clone());

    println!("{}", HELP);
    print_chats(session).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        // Failures are already reported as notices
        let _ = handle_line(session, line).await;
    }

    session.sign_out().await;
    let _ = tokio::join!(presence_task, sync_task, printer);
    Ok(())
}

async fn handle_line(session: &ChatSession, line: &str) -> murmur_client::Result<()> {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/help" => println!("{}", HELP),
        "/chats" => print_chats(session).await,
        "/users" => {
            for user in session.snapshot().await.users {
                println!("  {:<36} {:<30} {}", user.id, user.display_name(), presence_label(user.last_seen));
            }
        }
        "/open" => session.select_chat(rest).await?,
        "/close" => session.close_chat().await,
        "/image" => match tokio::fs::read(rest).await {
            Ok(bytes) => {
                session.send_image(&bytes).await?;
            }
            Err(e) => println!("! Cannot read {}: {}", rest, e),
        },
        "/group" => {
            let (name, members) = rest.rsplit_once(' ').unwrap_or((rest, ""));
            let members: Vec<String> = members
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
            session.create_group(name, &members).await?;
        }
        "/pin" => {
            session.toggle_pin(rest).await?;
        }
        "/block" => {
            session.toggle_block(rest).await?;
        }
        "/remove" => session.remove_chat(rest).await?,
        "/delete" => session.delete_for_me(rest).await?,
        "/unsend" => session.delete_for_everyone(rest).await?,
        "/info" => {
            let info = session.message_info(rest).await?;
            let names = |entries: &[murmur_client::models::ReceiptEntry]| {
                entries
                    .iter()
                    .map(|e| e.email.clone().unwrap_or_else(|| e.user_id.clone()))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!("  read by:      {}", names(&info.read_by));
            println!("  delivered to: {}", names(&info.delivered_to));
        }
        _ if line.starts_with('/') => println!("unknown command, try /help"),
        _ => {
            session.send_message(line, MessageType::Text).await?;
        }
    }
    Ok(())
}

fn spawn_printer(session: ChatSession) -> tokio::task::JoinHandle<()> {
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Notice(notice) => match notice.level {
                    NoticeLevel::Success => println!("* {}", notice.text),
                    NoticeLevel::Error => println!("! {}", notice.text),
                },
                SessionEvent::MessagesChanged => print_messages(&session).await,
                SessionEvent::SignedOut => break,
                _ => {}
            }
        }
    })
}

async fn print_chats(session: &ChatSession) {
    let state = session.snapshot().await;
    if state.chat_list.is_empty() {
        println!("  no chats yet, /users lists people to /open");
        return;
    }
    for chat in &state.chat_list {
        let pin = if state.is_pinned(&chat.id) { "^" } else { " " };
        let unread = match state.unread_for(&chat.id) {
            0 => String::new(),
            n => format!("({})", n),
        };
        let name = chat.name.as_deref().unwrap_or(&chat.id);
        let when = format_time(chat.last_message.as_ref().map(|m| m.created_at));
        println!("{} {:<36} {:<24} {:>5} {} {}", pin, chat.id, name, when, unread, chat.preview());
    }
}

async fn print_messages(session: &ChatSession) {
    let state = session.snapshot().await;
    let Some(chat) = &state.selected else {
        return;
    };
    println!("--- {} ---", chat.name.as_deref().unwrap_or(&chat.id));
    for msg in state.messages.iter().rev().take(20).rev() {
        let sender = msg.sender_email.as_deref().unwrap_or(&msg.sender_id);
        let body = match (msg.is_deleted, msg.message_type) {
            (true, _) => msg.preview(),
            (false, MessageType::Image) => "[image]".to_string(),
            (false, MessageType::Text) => msg.content.clone(),
        };
        let status = if msg.sender_id == state.user_id {
            format!(" ({})", msg.status)
        } else {
            String::new()
        };
        println!("[{}] {} {}: {}{}", format_time(Some(msg.created_at)), msg.id, sender, body, status);
    }
}
