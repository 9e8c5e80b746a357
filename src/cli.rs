use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "secure-messenger")]
#[command(version, about = "Peer-to-peer encrypted messenger node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the interactive messenger node (default mode)
    Run,

    /// Show node identity and configuration
    Info,
}
