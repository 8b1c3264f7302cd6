use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use mdpad_collab::buffer::TextBuffer;
use mdpad_collab::preferences::{FilePreferences, PreferencesStore};
use mdpad_collab::server::{ServerConfig, SyncServer};
use mdpad_collab::session::{DocumentSession, SessionCallbacks};
use mdpad_collab::share::{self, DEFAULT_EXPIRE_SECS};
use mdpad_core::HUE_RANGE;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "mdpad")]
#[command(about = "Collaborative plain-text pads from the terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a document server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3030")]
        bind: String,

        /// Events a slow connection may fall behind before it is dropped
        #[arg(long, default_value = "256")]
        capacity: usize,
    },

    /// Join a document: stdin lines are appended, the shared text is echoed
    Join {
        /// Server origin (http, https, ws or wss)
        #[arg(short, long, default_value = "http://127.0.0.1:3030")]
        server: String,

        /// Document id
        #[arg(short, long)]
        document: String,

        /// Display name (saved to preferences)
        #[arg(long)]
        name: Option<String>,

        /// Cursor hue, 0-359 (saved to preferences)
        #[arg(long)]
        hue: Option<u16>,

        /// Preferences file instead of the platform default
        #[arg(long)]
        preferences: Option<PathBuf>,
    },

    /// Print a fresh document id
    NewId {
        /// Seconds until the document may be discarded
        #[arg(long, default_value_t = DEFAULT_EXPIRE_SECS)]
        expire: u64,

        /// Also print the socket address on this server origin
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Serve { bind, capacity } => serve_command(bind, capacity).await,
        Commands::Join {
            server,
            document,
            name,
            hue,
            preferences,
        } => join_command(server, document, name, hue, preferences).await,
        Commands::NewId { expire, server } => new_id_command(expire, server),
    }
}

async fn serve_command(bind: String, capacity: usize) -> Result<()> {
    let server = SyncServer::new(ServerConfig {
        bind_addr: bind,
        broadcast_capacity: capacity,
        ..ServerConfig::default()
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} rooms open",
                stats.total_connections, stats.active_rooms
            );
        }
    }
    Ok(())
}

async fn join_command(
    server: String,
    document: String,
    name: Option<String>,
    hue: Option<u16>,
    preferences: Option<PathBuf>,
) -> Result<()> {
    let store = match preferences {
        Some(path) => FilePreferences::new(path),
        None => FilePreferences::default_location()?,
    };
    let mut prefs = store.load_or_init()?;
    if name.is_some() || hue.is_some() {
        if let Some(name) = name {
            prefs.name = name;
        }
        if let Some(hue) = hue {
            ensure!(hue < HUE_RANGE, "hue must be below {HUE_RANGE}");
            prefs.hue = hue;
        }
        store.save(&prefs)?;
    }

    let uri = share::socket_uri(&server, &document)?;
    info!("Joining {uri} as {} (hue {})", prefs.name, prefs.hue);

    let callbacks = SessionCallbacks::new()
        .on_connected(|| println!("* connected"))
        .on_disconnected(|| println!("* disconnected, retrying"))
        .on_desynchronized(|| eprintln!("* out of sync with the server; rejoin to recover"))
        .on_change_language(|language| println!("* language: {language}"))
        .on_change_users(|users| {
            let names: Vec<&str> = users.values().map(|user| user.name.as_str()).collect();
            if names.is_empty() {
                println!("* nobody else here");
            } else {
                println!("* here: {}", names.join(", "));
            }
        });

    let session = DocumentSession::new(uri, TextBuffer::new(""), callbacks);
    session.set_info(prefs.profile());
    session.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut shown = String::new();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(language) = line.strip_prefix("/lang ") {
                        if !session.set_language(language.trim()) {
                            warn!("Language not changed (offline, still syncing or unchanged)");
                        }
                        continue;
                    }
                    session.edit(|buffer| buffer.append(&format!("{line}\n")))?;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let text = session.text();
                if text != shown {
                    println!("--- r{} ---\n{text}", session.revision());
                    shown = text;
                }
            }
        }
    }

    session.dispose();
    Ok(())
}

fn new_id_command(expire: u64, server: Option<String>) -> Result<()> {
    let id = share::generate_document_id(expire);
    println!("{id}");
    if let Some(origin) = server {
        println!("{}", share::socket_uri(&origin, &id)?);
    }
    Ok(())
}
