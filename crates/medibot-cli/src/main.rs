mod chat;
mod config;
mod engine;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use engine::{Engine, EngineError, Login, SessionOrigin};
use medibot_core::OnnxEmbedder;
use medibot_store::{export_user, import_dir, UserStore};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "medibot",
    version,
    about = "MediBot: face-identified medical intake assistant"
)]
struct Cli {
    /// SQLite database path (overrides MEDIBOT_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Match distance threshold (overrides MEDIBOT_MATCH_THRESHOLD and MEDIBOT_MATCH_TOLERANCE)
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the face in a photo against registered users
    Identify {
        /// Photo containing one face
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Register a new user from a photo
    Register {
        /// Display name for the new user
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Add another face sample to an existing user
    Enroll {
        /// User id (e.g. P001)
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Log in (or register) from a photo and chat
    Chat {
        #[arg(short, long)]
        image: PathBuf,
        /// Name to register under if the face is not recognized
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List registered users
    Users,
    /// List saved conversations of a user, newest first
    History {
        #[arg(short, long)]
        user: String,
    },
    /// Print one saved conversation
    Show {
        #[arg(short, long)]
        user: String,
        /// Conversation index as listed by `history`
        #[arg(long)]
        index: usize,
    },
    /// Write a user's record to <out>/<user>.json
    Export {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Import every *.json user document in a directory
    Import {
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Show configuration and store status as JSON
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(threshold) = cli.threshold {
        if !threshold.is_finite() || threshold <= 0.0 {
            bail!("--threshold must be a positive number");
        }
        config.match_threshold = threshold;
        config.match_tolerance = threshold;
    }
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Identify { image } => {
            let mut engine = build_engine(&config)?;
            let bytes = read_image(&image)?;
            let result = match engine.identify(&bytes) {
                Err(EngineError::NoFaceDetected) => {
                    println!("No face detected in {}.", image.display());
                    return Ok(());
                }
                other => other?,
            };
            match (&result.user_id, result.distance) {
                (Some(user_id), Some(distance)) => {
                    let record = engine.store().load(user_id)?;
                    println!(
                        "Recognized {} ({user_id}), distance {distance:.4}",
                        record.name
                    );
                }
                (_, Some(distance)) => {
                    println!("No match (closest distance {distance:.4})");
                }
                _ => println!("No match (no registered users)"),
            }
        }
        Commands::Register { name, image } => {
            let mut engine = build_engine(&config)?;
            let record = engine.register(&name, &read_image(&image)?)?;
            println!("Registered {} as {}", record.name, record.id);
        }
        Commands::Enroll { user, image } => {
            let mut engine = build_engine(&config)?;
            let count = engine.enroll(&user, &read_image(&image)?)?;
            println!("Added face sample to {user} ({count} total)");
        }
        Commands::Chat { image, name } => {
            let mut engine = build_engine(&config)?;
            let bytes = read_image(&image)?;
            let mut session = match engine.begin(&bytes)? {
                Login::Returning(session) => session,
                Login::Unrecognized(face) => {
                    let name = match name {
                        Some(name) => name,
                        None => prompt("Face not recognized. Enter your name to register: ")?,
                    };
                    engine.register_unknown(face, &name)?
                }
            };
            if session.origin == SessionOrigin::Registered {
                println!("Registered {} as {}", session.user_name, session.user_id);
            }
            if let Some((width, height)) = session.profile_image {
                println!("Profile photo: {width}x{height}");
            }
            let stdin = io::stdin();
            chat::run(&mut engine, &mut session, stdin.lock(), &mut io::stdout())?;
        }
        Commands::Users => {
            let store = open_store(&config)?;
            let users = store.list_users()?;
            if users.is_empty() {
                println!("No users registered");
            }
            for user in users {
                println!(
                    "{}  {:<20}  registered {}  ({} samples, {} conversations)",
                    user.id,
                    user.name,
                    user.created_at.format("%Y-%m-%d %H:%M"),
                    user.embeddings,
                    user.conversations
                );
            }
        }
        Commands::History { user } => {
            let store = open_store(&config)?;
            let conversations = store.conversations(&user)?;
            if conversations.is_empty() {
                println!("No saved conversations for {user}");
            }
            for (index, conversation) in conversations.iter().enumerate().rev() {
                println!(
                    "[{index}] {}  ({} messages)",
                    conversation.label(),
                    conversation.messages.len()
                );
            }
        }
        Commands::Show { user, index } => {
            let store = open_store(&config)?;
            let bot_name = config.responder()?.bot_name().to_string();
            for message in store.restore_conversation(&user, index)? {
                match message.speaker {
                    medibot_core::Speaker::User => println!("You: {}", message.text),
                    medibot_core::Speaker::Bot => println!("{bot_name}: {}", message.text),
                }
            }
        }
        Commands::Export { user, out } => {
            let store = open_store(&config)?;
            let path = export_user(&store, &user, &out)?;
            println!("Exported {user} to {}", path.display());
        }
        Commands::Import { dir } => {
            let mut store = open_store(&config)?;
            let report = import_dir(&mut store, &dir)
                .with_context(|| format!("importing {}", dir.display()))?;
            println!("Imported {} user(s)", report.imported.len());
            for (file, reason) in &report.skipped {
                println!("  skipped {file}: {reason}");
            }
        }
        Commands::Status => {
            let users = open_store(&config)
                .and_then(|store| Ok(store.user_count()?))
                .map_err(|e| tracing::warn!(error = %e, "store unavailable"))
                .ok();
            let detector = config.detector_model_path();
            let recognizer = config.recognizer_model_path();
            let status = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "db_path": config.db_path.display().to_string(),
                "users": users,
                "detector_model": detector.display().to_string(),
                "detector_present": detector.exists(),
                "recognizer_model": recognizer.display().to_string(),
                "recognizer_present": recognizer.exists(),
                "match_threshold": config.match_threshold,
                "match_tolerance": config.match_tolerance,
                "templates": config
                    .templates_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "builtin".to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<UserStore> {
    UserStore::open(&config.db_path)
        .with_context(|| format!("opening user store {}", config.db_path.display()))
}

fn build_engine(config: &Config) -> Result<Engine<OnnxEmbedder>> {
    let provider = OnnxEmbedder::load(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
    )
    .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;
    let responder = config.responder().context("loading response templates")?;
    let store = open_store(config)?;
    Ok(Engine::new(provider, config.matcher(), store, responder))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

fn prompt(question: &str) -> Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{question}")?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim();
    if answer.is_empty() {
        bail!("a name is required to register");
    }
    Ok(answer.to_string())
}
