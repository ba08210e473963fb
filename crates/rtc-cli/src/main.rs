mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rtc",
    about = "Retry/timeout/callback orchestrations: run the server and drive instances",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from rtc.yaml, .rtc/ or .git/)
    #[arg(long, global = true, env = "RTC_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Server base URL for client commands (default: server.public_base_url)
    #[arg(long, global = true, env = "RTC_SERVER")]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration HTTP server
    Serve {
        /// Port to listen on (default: server.port from rtc.yaml)
        #[arg(long)]
        port: Option<u16>,

        /// Keep state in memory instead of the redb store
        #[arg(long)]
        ephemeral: bool,

        /// Also serve the simulated job service at /api/job
        #[arg(long)]
        simulator: bool,
    },

    /// Start a new orchestration instance
    Start,

    /// Show an instance's attempts and progress
    Status { id: String },

    /// Deliver a callback to a waiting instance
    Callback {
        id: String,
        /// true or false
        outcome: String,
        /// Attempt the callback answers; without it only an attempt whose
        /// dispatch was already accepted takes the callback
        #[arg(long)]
        attempt: Option<String>,
    },

    /// Clear an instance's attempt ledger
    Reset { id: String },

    /// Delete an instance
    Delete { id: String },

    /// Create, show and validate rtc.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Evaluate the retry policy offline
    Policy {
        /// Attempts made so far
        attempt_count: usize,
        /// Whether the most recent attempt succeeded (true/false)
        #[arg(action = clap::ArgAction::Set)]
        last_succeeded: bool,
        /// Attempt ceiling
        max_attempts: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let server = cli.server.as_deref();

    let result = match cli.command {
        Commands::Serve {
            port,
            ephemeral,
            simulator,
        } => cmd::serve::run(&root, port, ephemeral, simulator),
        Commands::Start => cmd::client::start(&root, server, cli.json),
        Commands::Status { id } => cmd::client::status(&root, server, &id, cli.json),
        Commands::Callback {
            id,
            outcome,
            attempt,
        } => cmd::client::callback(&root, server, &id, &outcome, attempt.as_deref(), cli.json),
        Commands::Reset { id } => cmd::client::reset(&root, server, &id, cli.json),
        Commands::Delete { id } => cmd::client::delete(&root, server, &id, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Policy {
            attempt_count,
            last_succeeded,
            max_attempts,
        } => cmd::policy::run(attempt_count, last_succeeded, max_attempts, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
