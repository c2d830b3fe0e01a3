//! # Combine CLI (`combine`)
//!
//! ## Usage
//!
//! ```bash
//! combine --config ./config/combine.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `combine init` | Create the database, queue schema and token secret |
//! | `combine serve` | Connect to IRC and answer commands |
//! | `combine worker` | Run queued training jobs |
//! | `combine token issue <user>` | Issue an upload token |
//! | `combine token verify <token>` | Check a token |
//! | `combine queue submit --token <t>` | Enqueue training for a token's user |
//! | `combine queue list` | Show recent training jobs |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use combine::config::{self, Config};
use combine::queue::TrainQueue;
use combine::worker::Worker;
use combine::{logging, migrate, queue_cmd, serve, token, token_cmd};

/// Combine: chat-driven map recommendations backed by per-user models.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/combine.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "combine",
    about = "Combine: chat-driven map recommendations with a background training queue",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/combine.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database, the queue table and the token secret.
    ///
    /// Idempotent: an existing secret is never overwritten.
    Init,

    /// Connect to the chat server and serve commands until interrupted.
    Serve {
        /// Accept only messages the bot sends itself and echo replies to
        /// stdout. Each line typed on stdin is sent to the bot (`!r` when
        /// empty).
        #[arg(long)]
        self_test: bool,
    },

    /// Run queued training jobs.
    Worker {
        /// Run at most one job and exit.
        #[arg(long)]
        once: bool,
    },

    /// Issue or check upload tokens.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Submit or inspect training jobs.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print a new token for a user.
    Issue {
        user: String,
    },
    /// Verify a token and print its claims.
    Verify {
        token: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Verify an upload token and enqueue training for its user.
    Submit {
        /// Token obtained with `!gen-token`.
        #[arg(long)]
        token: String,

        /// Only train on replays newer than this many days.
        #[arg(long, allow_negative_numbers = true)]
        age_days: Option<i64>,
    },
    /// Show the most recent jobs.
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Serve { self_test } => {
            serve::run_service(&cfg, self_test).await?;
        }
        Commands::Worker { once } => {
            let queue = TrainQueue::open(&cfg).await?;
            let worker = Worker::from_config(queue.clone(), &cfg);
            if once {
                match worker.run_once().await? {
                    Some((job, status)) => println!("job {} ({}): {}", job.id, job.user, status),
                    None => println!("No waiting jobs."),
                }
            } else {
                tokio::select! {
                    _ = worker.run_forever() => {}
                    _ = tokio::signal::ctrl_c() => info!("interrupted, worker stopping"),
                }
            }
            queue.close().await;
        }
        Commands::Token { action } => match action {
            TokenAction::Issue { user } => token_cmd::run_token_issue(&cfg, &user)?,
            TokenAction::Verify { token } => token_cmd::run_token_verify(&cfg, &token)?,
        },
        Commands::Queue { action } => match action {
            QueueAction::Submit { token, age_days } => {
                queue_cmd::run_queue_submit(&cfg, &token, age_days).await?;
            }
            QueueAction::List { limit } => {
                queue_cmd::run_queue_list(&cfg, limit).await?;
            }
        },
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    migrate::run_migrations(cfg).await?;
    std::fs::create_dir_all(&cfg.models.dir)?;
    std::fs::create_dir_all(&cfg.train.replay_dir)?;
    let created = token::ensure_secret(&cfg.token.secret_path)?;

    println!("Database initialized successfully.");
    if created {
        println!("Token secret written to {}", cfg.token.secret_path.display());
    }
    Ok(())
}
