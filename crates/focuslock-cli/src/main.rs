use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "focuslock-cli", version, about = "Focuslock CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// App restrictions
    Restrict {
        #[command(subcommand)]
        action: commands::restrict::RestrictAction,
    },
    /// Focus countdown
    Focus {
        #[command(subcommand)]
        action: commands::focus::FocusAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Run the enforcement engine, driven by line commands on stdin
    Daemon {
        /// Do not print tick events
        #[arg(long)]
        quiet_ticks: bool,
    },
}

fn main() {
    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Restrict { action } => commands::restrict::run(action),
        Commands::Focus { action } => commands::focus::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Daemon { quiet_ticks } => commands::daemon::run(quiet_ticks),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
