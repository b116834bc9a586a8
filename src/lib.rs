//! Serverless peer-to-peer calls: session descriptions are exchanged by
//! copy/paste, after which the peers share chat and file channels and keep
//! the connection alive with ICE restarts.

pub mod chat;
pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod monitor;
pub mod peer;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

pub use config::SessionConfig;
pub use error::{Error, Result, TransferError};
pub use monitor::ConnectionMonitor;
pub use reconnect::{ReconnectOutcome, ReconnectionController};
pub use session::{CallHandle, CallStatus};
pub use signaling::SignalingSession;

use commands::call_api;
use peer::events::EventSink;
use peer::transport::Transport;
use peer::WebRtcTransport;

#[derive(Parser, Debug)]
#[command(name = "pastecall", version, about = "Peer-to-peer calls over copy/paste signaling")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,

    /// TOML session configuration.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Talk to an in-process peer instead of the network.
    #[arg(long, global = true)]
    pub loopback: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Create a call and print the offer.
    Host,
    /// Join a call from a pasted offer.
    Join,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    logger::init(&config.log);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(start(cli, config))
}

async fn start(cli: Cli, config: SessionConfig) -> Result<()> {
    let sink = EventSink::new();
    let printer = tokio::spawn(call_api::print_events(
        sink.subscribe(),
        config.download_dir.clone(),
    ));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let result = if cli.loopback {
        let local_hosts = cli.mode == Mode::Host;
        match call_api::loopback_pair(&config, sink, local_hosts).await {
            Ok((call, peer)) => {
                let outcome = call_api::interact(call, &mut lines).await;
                peer.close().await;
                outcome
            }
            Err(e) => Err(e),
        }
    } else {
        let transport: Arc<dyn Transport> = WebRtcTransport::new(&config).await?;
        let call = match cli.mode {
            Mode::Host => call_api::host(Arc::clone(&transport), &config, sink, &mut lines).await,
            Mode::Join => call_api::join(Arc::clone(&transport), &config, sink, &mut lines).await,
        };
        match call {
            Ok(call) => call_api::interact(call, &mut lines).await,
            Err(e) => {
                // The call never started, so nothing else will release the transport.
                if let Err(close_err) = transport.close().await {
                    tracing::warn!("transport close failed: {close_err}");
                }
                Err(e)
            }
        }
    };

    printer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_accepted_after_the_mode() {
        let cli = Cli::try_parse_from(["pastecall", "join", "--loopback", "--config", "a.toml"])
            .unwrap();
        assert_eq!(cli.mode, Mode::Join);
        assert!(cli.loopback);
        assert_eq!(cli.config, Some(PathBuf::from("a.toml")));
    }

    #[test]
    fn mode_is_required() {
        assert!(Cli::try_parse_from(["pastecall"]).is_err());
    }
}
