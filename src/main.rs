//! Tapgate server binary.
//!
//! See the `tapgate` library for the protocol core; this entry point only
//! parses arguments, resolves the state directory, and runs the server.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::path::PathBuf;

use tapgate::config::{resolve_state_dir, ServerConfig};
use tapgate::server;
use tapgate::webpush::VapidKeys;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "tapgate", version, about = "Approval relay for coding-agent tool calls")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Address to bind the HTTP listener.
        #[arg(long, default_value = "127.0.0.1:8710")]
        bind: SocketAddr,
        /// State directory (defaults to the platform config dir or
        /// TAPGATE_STATE_DIR).
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// VAPID contact URI reported to push services.
        #[arg(long, default_value = "mailto:ops@tapgate.dev")]
        subject: String,
    },
    /// Print the VAPID public key, generating a keypair if none exists.
    Vapid {
        /// State directory (defaults to the platform config dir or
        /// TAPGATE_STATE_DIR).
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            state_dir,
            subject,
        } => {
            let state_dir = resolve_state_dir(state_dir)?;
            server::run(ServerConfig {
                bind,
                state_dir,
                subject,
            })
            .await
        }
        Command::Vapid { state_dir } => {
            let state_dir = resolve_state_dir(state_dir)?;
            let keys = VapidKeys::load_or_generate(&state_dir.join("vapid.json"))?;
            println!("{}", keys.public_key_base64url());
            Ok(())
        }
    }
}
