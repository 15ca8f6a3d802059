use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use embercache_server::{run_server, Config};

#[derive(Parser)]
#[command(name = "embercache")]
#[command(about = "Distributed in-memory cache node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cache node
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "embercache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            let cfg = match Config::from_file(&config) {
                Ok(cfg) => cfg,
                Err(error) => {
                    tracing::error!("failed to load config {}: {}", config, error);
                    std::process::exit(1);
                }
            };

            if let Err(error) = run_server(cfg).await {
                tracing::error!("server error: {}", error);
                std::process::exit(1);
            }
        }
    }
}
