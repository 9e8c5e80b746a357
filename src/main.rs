mod app;
mod cli;
mod config;
mod console;
mod history;

use app::MessengerApp;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing("info");

    info!("Loading configuration...");
    let config = AppConfig::load()?;

    info!("Configuration loaded");
    info!("  Display name: {}", config.node.display_name);
    info!("  Listen port:  {}", config.node.listen_port);
    info!("  Discovery:    {}", config.network.enable_discovery);

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => {
            let app = MessengerApp::new(config)?;
            app.run().await?;
        }
        Some(Commands::Info) => {
            show_info(config)?;
        }
    }

    Ok(())
}

fn show_info(config: AppConfig) -> anyhow::Result<()> {
    let app = MessengerApp::new(config.clone())?;
    let public_key = app.node().public_key_der()?;

    println!("\nNode Information");
    println!("-------------------------------------");
    println!("  Node ID:      {}", app.node().local_id());
    println!("  Display name: {}", config.node.display_name);
    println!("  Listen port:  {}", config.node.listen_port);
    println!("  Public key:   {}...", &hex::encode(&public_key)[..32]);
    println!("\nNetwork");
    println!("-------------------------------------");
    println!("  Discovery:    {}", config.network.enable_discovery);
    println!("  UDP port:     {}", config.network.discovery_port);
    println!("  Bootstrap:    {:?}", config.network.bootstrap_peers);
    println!("\nHistory");
    println!("-------------------------------------");
    println!("  File:         {}", config.history.file);

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
