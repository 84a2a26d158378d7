use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use conveyor::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(
    name = "conveyor",
    about = "Automation-task service: queued six-stage pipelines with live progress",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and worker pool
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 3000)]
        port: u16,

        /// SQLite database path
        #[arg(long, default_value = "conveyor.db")]
        db: PathBuf,

        /// Number of queue workers
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// Enable permissive CORS for local frontend development
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("conveyor=info,tower_http=warn")
                }),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            port,
            db,
            workers,
            dev,
        } => {
            start_server(ServerConfig {
                port,
                db_path: db,
                workers,
                dev_mode: dev,
            })
            .await
        }
    }
}
