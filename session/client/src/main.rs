//! Chat Client - Terminal Surface for the Chat Session Core
//!
//! A line-oriented chat client. Plain lines are sent as messages; replies
//! stream back as they are generated. Slash commands manage conversations
//! and the account (`/help` lists them).
//!
//! # Usage
//!
//! ```bash
//! # Connect to a local backend, resuming the saved session cookie state
//! chat-client --backend-url http://localhost:8000
//!
//! # Chat without an account
//! chat-client --guest
//!
//! # Sign in on start
//! chat-client --username ada --password secret
//!
//! # Verbose logging (written to stderr)
//! RUST_LOG=debug chat-client
//! ```

mod input;
mod render;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use chat_session_core::transport::config::parse_transport_list;
use chat_session_core::transport::SocketIoConnector;
use chat_session_core::{
    load_config_from_path, ApiClient, AuthManager, ChatSession, ConfigOverrides, ConversationId,
    SessionCommand, SessionEnvironment,
};

use input::{parse_line, ClientCommand, Input, HELP};
use render::Renderer;

/// Chat Client - terminal chat against a streaming chat backend
#[derive(Parser, Debug)]
#[command(name = "chat-client")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend base URL
    #[arg(short = 'b', long, env = "CHAT_BACKEND_URL", value_name = "URL")]
    backend_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "CHAT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Transport order, e.g. "websocket,polling"
    #[arg(long, value_name = "LIST")]
    transports: Option<String>,

    /// Local store file
    #[arg(long, value_name = "FILE")]
    storage: Option<PathBuf>,

    /// Continue as guest instead of signing in
    #[arg(short = 'g', long)]
    guest: bool,

    /// Username to sign in with
    #[arg(short = 'u', long, env = "CHAT_USERNAME", requires = "password")]
    username: Option<String>,

    /// Password to sign in with
    #[arg(short = 'p', long, env = "CHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CHAT_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so they never interleave with the chat on stdout.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "chat_client={level},chat_session_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}

fn overrides_from_args(args: &Args) -> Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.backend_url {
        overrides = overrides.with_backend_url(url.clone());
    }
    if let Some(ref list) = args.transports {
        let transports = parse_transport_list(list).map_err(anyhow::Error::msg)?;
        overrides = overrides.with_transports(transports);
    }
    if let Some(ref path) = args.storage {
        overrides = overrides.with_storage_path(path.clone());
    }
    Ok(overrides)
}

/// Client-side state that is not part of the session
struct Composer {
    generate_images: bool,
    attachments: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = load_config_from_path(args.config.clone()).context("Failed to load config")?;
    overrides_from_args(&args)?
        .apply(&mut config)
        .context("Invalid command-line overrides")?;
    info!(
        backend_url = %config.backend_url(),
        source = %config.source(),
        "Configuration loaded"
    );

    let env = match config.resolved_storage_path() {
        Some(path) => SessionEnvironment::file_backed(&path)
            .with_context(|| format!("Failed to open local store {}", path.display()))?,
        None => {
            warn!("No data directory; local state will not persist");
            SessionEnvironment::in_memory()
        }
    };

    let api = Arc::new(ApiClient::new(config.backend_url())?);
    let connector = SocketIoConnector::new(config.transport.clone(), Some(api.cookie_jar()));
    let mut auth = AuthManager::new(Arc::clone(&api), Arc::clone(&env.store), config.backend_url());

    let (updates_tx, mut updates) = mpsc::channel(256);
    let (commands_tx, commands) = mpsc::channel(32);
    let session = ChatSession::new(
        Arc::clone(&api),
        connector,
        env,
        config.session.clone(),
        updates_tx,
    );
    let session_task = tokio::spawn(session.run(commands));

    let render_task = tokio::spawn(async move {
        let mut renderer = Renderer::new();
        while let Some(update) = updates.recv().await {
            if let Some(text) = renderer.render(&update) {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    });

    // Establish the starting mode
    let mut state = auth.initialize().await.clone();
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        match auth.login(username, password).await {
            Ok(s) => state = s.clone(),
            Err(e) => eprintln!("Login failed: {e}"),
        }
    }
    if args.guest && !state.authenticated {
        state = auth.activate_guest_mode().clone();
    }
    if state.authenticated {
        println!("Signed in as {}", state.user.as_ref().map_or("?", |u| u.username.as_str()));
        commands_tx.send(SessionCommand::SetAuthenticated(true)).await?;
    } else if state.guest_mode {
        println!("Chatting as guest");
        commands_tx.send(SessionCommand::SetGuestMode(true)).await?;
        commands_tx.send(SessionCommand::RestoreFromLocation).await?;
    } else {
        println!("Not signed in. Use /login <user> <password> or /guest.");
        commands_tx.send(SessionCommand::RestoreFromLocation).await?;
    }

    let mut composer = Composer {
        generate_images: false,
        attachments: Vec::new(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let command = match parse_line(&line) {
            Ok(Input::Empty) => continue,
            Ok(Input::Message(text)) => SessionCommand::SendMessage {
                text,
                attachments: std::mem::take(&mut composer.attachments),
                generate_images: composer.generate_images,
            },
            Ok(Input::Command(command)) => {
                match handle_client_command(command, &mut auth, &api, &mut composer).await {
                    Step::Send(commands) => {
                        for command in commands {
                            commands_tx.send(command).await?;
                        }
                        continue;
                    }
                    Step::Continue => continue,
                    Step::Quit => break,
                }
            }
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        commands_tx.send(command).await?;
    }

    let _ = commands_tx.send(SessionCommand::Shutdown).await;
    session_task.await??;
    render_task.abort();
    Ok(())
}

enum Step {
    Send(Vec<SessionCommand>),
    Continue,
    Quit,
}

async fn handle_client_command(
    command: ClientCommand,
    auth: &mut AuthManager<ApiClient>,
    api: &ApiClient,
    composer: &mut Composer,
) -> Step {
    let guest = auth.state().guest_mode && !auth.state().authenticated;
    match command {
        ClientCommand::NewChat => Step::Send(vec![SessionCommand::StartNewChat]),
        ClientCommand::Load(id) => Step::Send(vec![SessionCommand::LoadConversation {
            id: ConversationId::parse(&id, guest),
            guest,
        }]),
        ClientCommand::Delete(id) => Step::Send(vec![SessionCommand::DeleteConversation(
            ConversationId::parse(&id, guest),
        )]),
        ClientCommand::Rename { id, title } => Step::Send(vec![SessionCommand::RenameConversation {
            id: ConversationId::parse(&id, guest),
            title,
        }]),
        ClientCommand::List => Step::Send(vec![SessionCommand::RefreshConversations]),
        ClientCommand::Stop => Step::Send(vec![SessionCommand::StopGeneration]),
        ClientCommand::ToggleImages => {
            composer.generate_images = !composer.generate_images;
            println!(
                "Image generation {}",
                if composer.generate_images { "on" } else { "off" }
            );
            Step::Continue
        }
        ClientCommand::Attach(path) => {
            match api.upload_file(&path).await {
                Ok(upload) => {
                    println!("Attached {}", upload.url);
                    composer.attachments.push(upload.url);
                }
                Err(e) => eprintln!("Upload failed: {e}"),
            }
            Step::Continue
        }
        ClientCommand::Login { username, password } => match auth.login(&username, &password).await {
            Ok(state) => {
                let name = state.user.as_ref().map_or("?", |u| u.username.as_str());
                println!("Signed in as {name}");
                Step::Send(vec![
                    SessionCommand::SetGuestMode(false),
                    SessionCommand::SetAuthenticated(true),
                ])
            }
            Err(e) => {
                eprintln!("Login failed: {e}");
                Step::Continue
            }
        },
        ClientCommand::Guest => {
            if auth.state().authenticated {
                eprintln!("Already signed in; /logout first");
                return Step::Continue;
            }
            auth.activate_guest_mode();
            println!("Chatting as guest");
            Step::Send(vec![SessionCommand::SetGuestMode(true)])
        }
        ClientCommand::Logout => {
            auth.logout().await;
            println!("Signed out");
            Step::Send(vec![
                SessionCommand::StartNewChat,
                SessionCommand::SetGuestMode(false),
                SessionCommand::SetAuthenticated(false),
            ])
        }
        ClientCommand::Help => {
            println!("{HELP}");
            Step::Continue
        }
        ClientCommand::Quit => Step::Quit,
    }
}
