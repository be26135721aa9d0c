mod client;
mod commands;
mod config;
mod server;

use clap::{Parser, Subcommand};
use client::ApiClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "livedraw")]
#[command(about = "Minute-aligned live digit draw server and admin client")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Base URL of a running server
    #[arg(
        long,
        global = true,
        env = "LIVEDRAW_SERVER",
        default_value = "http://127.0.0.1:3000"
    )]
    server: String,

    /// Admin token
    #[arg(long, global = true, env = "ADMIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the draw engine and its HTTP/WebSocket server
    Serve(commands::ServeArgs),

    /// Show the current round of a running server
    Status {
        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },

    /// Admin commands against a running server
    #[command(subcommand)]
    Admin(commands::AdminCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "livedraw_cli={},livedraw_core={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = ApiClient::new(&cli.server, cli.token.clone());

    let result = match cli.command {
        Commands::Serve(args) => commands::handle_serve_command(args, cli.token).await,
        Commands::Status { json } => commands::handle_status_command(&client, json).await,
        Commands::Admin(cmd) => commands::handle_admin_command(cmd, &client).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
