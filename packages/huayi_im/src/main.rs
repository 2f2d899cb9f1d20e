use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use huayi_im::HuayiConfig;

mod cli;

#[derive(Parser)]
#[command(name = "huayi")]
#[command(about = "Terminal client for the Huayi instant-messaging server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.huayi)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore the saved session (or log in) and start chatting
    Chat(ChatArgs),

    /// Log out and forget the saved session
    Logout,

    /// Show or change configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Parser)]
struct ChatArgs {
    /// Log in as this user instead of restoring the saved session
    #[arg(short, long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Persist the server base URL to config.toml
    SetServer {
        /// e.g. https://im.example.com
        base_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = HuayiConfig::new(cli.data_dir)?;

    match cli.command {
        Commands::Chat(args) => cli::chat_command(&config, args.user).await,
        Commands::Logout => cli::logout_command(&config).await,
        Commands::Config(ConfigCommand::Show) => cli::config_show_command(&config),
        Commands::Config(ConfigCommand::SetServer { base_url }) => {
            cli::config_set_server_command(&config, &base_url)
        }
    }
}

/// Logs go to stderr so they never interleave with the chat transcript.
fn init_logging(debug: bool) {
    let default_directive = if debug {
        "huayi_im=debug,huayi=debug,warn"
    } else {
        "huayi_im=info,huayi=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
