mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "statebridge",
    about = "Cross-process state bridge: serve a shared counter store or replay the thunk scenario",
    version,
    propagate_version = true
)]
struct Cli {
    /// Bridge config file (YAML; default: built-in defaults)
    #[arg(long, global = true, env = "STATEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the bridge over HTTP/SSE with an in-memory counter store
    Serve {
        /// Port to listen on (0 picks a free port)
        #[arg(long, short = 'p', default_value_t = 3141)]
        port: u16,

        /// Starting value of the counter
        #[arg(long, default_value_t = 0)]
        initial_counter: i64,
    },

    /// Replay double→double→halve with a lock-bypassing increment in between
    Demo {
        /// Pause between the thunk's steps, in milliseconds
        #[arg(long, default_value_t = 50)]
        step_delay_ms: u64,
    },

    /// Show or validate the effective bridge config
    Config {
        #[command(subcommand)]
        subcommand: Option<ConfigSubcommand>,
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
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Serve {
            port,
            initial_counter,
        } => cmd::config::load(config_path)
            .and_then(|config| cmd::serve::run(config, port, initial_counter)),
        Commands::Demo { step_delay_ms } => cmd::config::load(config_path).and_then(|config| {
            cmd::demo::run(config, Duration::from_millis(step_delay_ms), cli.json)
        }),
        Commands::Config { subcommand } => cmd::config::run(config_path, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
