//! FitSocial CLI - log in, read the feed, like posts and chat from a terminal.
//!
//! All session handling lives in `fitsocial-core`; this binary only parses
//! arguments, prompts for secrets and prints results.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fitsocial_core::models::NewChatMessage;
use fitsocial_core::{Config, NewAccount, ProfileChanges, SessionEvent, SessionManager};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the login password.
const PASSWORD_ENV: &str = "FITSOCIAL_PASSWORD";

/// Log file prefix inside the data directory
const LOG_FILE_PREFIX: &str = "fitsocial.log";

/// Exit status after the session was torn down mid-command.
const EXIT_SESSION_INVALIDATED: i32 = 2;

#[derive(Parser)]
#[command(name = "fitsocial", version, about = "FitSocial from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and remember the session
    Login {
        #[arg(long, env = "FITSOCIAL_EMAIL")]
        email: Option<String>,
    },
    /// Log out here and on the server
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Create an account
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        /// Image to upload as the avatar
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
    /// Change username or avatar
    Profile {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
    /// List the feed
    Posts,
    /// List comments on a post
    Comments { post_id: String },
    /// Like a post
    Like { post_id: String },
    /// Remove your like from a post
    Unlike { post_id: String },
    /// Send a chat message
    Chat {
        #[arg(required = true)]
        message: Vec<String>,
    },
}

/// Daily log file in `dir`, or `None` if it cannot be created.
fn file_appender(dir: &Path) -> Option<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(dir)
        .map_err(|e| eprintln!("Warning: file logging disabled ({})", e))
        .ok()
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir.and_then(file_appender) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    };

    let log_dir = config.data_dir().ok().filter(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Warning: cannot create {} ({}), logging to stderr only", dir.display(), e);
            false
        }
    });
    let guard = init_tracing(log_dir.as_deref());
    info!(api = %config.api_base_url, "FitSocial CLI starting");

    let session = SessionManager::from_config(&config)?;
    let mut events = session.subscribe();

    let result = run(cli.command, &session, &mut config).await;

    let mut invalidated = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Invalidated { reason, at } = event {
            warn!(%reason, %at, "Session invalidated during command");
            invalidated = true;
        }
    }

    if invalidated {
        eprintln!("You have been logged out. Run `fitsocial login` to sign in again.");
        // process::exit skips destructors; flush the log file first.
        drop(guard);
        std::process::exit(EXIT_SESSION_INVALIDATED);
    }

    result
}

async fn run(command: Command, session: &SessionManager, config: &mut Config) -> Result<()> {
    match command {
        Command::Login { email } => login(session, config, email).await,
        Command::Logout => {
            session.logout().await;
            println!("Logged out.");
            Ok(())
        }
        Command::Whoami => {
            match session.current_user() {
                Some(user) => {
                    println!("{} <{}>", user.username, user.email);
                    if let Some(avatar) = user.avatar_url {
                        println!("avatar: {}", avatar);
                    }
                }
                None => println!("Not logged in."),
            }
            Ok(())
        }
        Command::Register {
            username,
            email,
            avatar,
        } => {
            let avatar = match avatar {
                Some(path) => Some(upload(session, &path).await?),
                None => None,
            };
            let password = read_password()?;
            let account = NewAccount {
                username,
                email,
                password,
                avatar,
            };
            let user = session.register(&account).await?;
            println!("Registered {}. Log in with `fitsocial login --email {}`.", user.username, user.email);
            Ok(())
        }
        Command::Profile { username, avatar } => {
            require_login(session)?;
            let avatar_url = match avatar {
                Some(path) => Some(upload(session, &path).await?),
                None => None,
            };
            let user = session
                .save_profile(ProfileChanges {
                    username,
                    avatar_url,
                })
                .await?;
            println!("Profile: {} <{}>", user.username, user.email);
            Ok(())
        }
        Command::Posts => {
            require_login(session)?;
            let posts = session.gateway().list_posts().await?;
            if posts.is_empty() {
                println!("No posts yet.");
            }
            for post in posts {
                let date = post
                    .posted_at()
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("[{}] {} {}", post.id, date, post.title);
                println!("    {}", post.content);
            }
            Ok(())
        }
        Command::Comments { post_id } => {
            require_login(session)?;
            for comment in session.gateway().comments_for_post(&post_id).await? {
                println!("{}: {}", comment.owner, comment.comment);
            }
            Ok(())
        }
        Command::Like { post_id } => {
            require_login(session)?;
            session.gateway().like_post(&post_id).await?;
            println!("Liked {}.", post_id);
            Ok(())
        }
        Command::Unlike { post_id } => {
            require_login(session)?;
            session.gateway().unlike_post(&post_id).await?;
            println!("Removed like from {}.", post_id);
            Ok(())
        }
        Command::Chat { message } => {
            let user = session
                .current_user()
                .ok_or_else(|| anyhow::anyhow!("Not logged in. Run `fitsocial login` first."))?;
            let sent = session
                .gateway()
                .send_chat_message(&NewChatMessage {
                    content: message.join(" "),
                    username: user.username,
                })
                .await?;
            println!("{}: {}", sent.username, sent.content);
            Ok(())
        }
    }
}

async fn login(session: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = read_password()?;

    let user = session.login(&email, &password).await?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {}.", user.username);
    Ok(())
}

fn require_login(session: &SessionManager) -> Result<()> {
    if session.is_authenticated() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Not logged in. Run `fitsocial login` first."))
    }
}

async fn upload(session: &SessionManager, path: &Path) -> Result<String> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid file name: {}", path.display()))?;
    let avatar = session
        .upload_avatar(file_name, content_type_for(path), data)
        .await?;
    Ok(avatar)
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
