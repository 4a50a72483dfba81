//! tilecast-host: entry point.
//!
//! ```text
//! tilecast-host --gen-config                        Print the default config
//! tilecast-host play --screen S --source SRC        Stream in-band
//! tilecast-host play --screen S --source SRC --out-of-band
//! tilecast-host --config <path> play ...            Load a custom config TOML
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tilecast_core::error::PlaybackOutcome;
use tilecast_core::scheduler::SessionPhase;
use tilecast_core::session::{DeliveryMode, PlaybackRequest, SessionManager};
use tilecast_core::wire::{ACKNOWLEDGEMENT_CHANNEL, HANDSHAKE_CHANNEL};
use tilecast_host::config::HostConfig;
use tilecast_host::engine::HostEngine;
use tilecast_host::hub::TcpReceiverHub;
use tilecast_host::logging;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tilecast-host", about = "Stream video onto a wall of tiled receivers")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tilecast-host.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a source on a screen until it ends or Ctrl-C.
    Play {
        /// Screen name the session is registered under.
        #[arg(long)]
        screen: String,

        /// `synthetic:WxH@FPS[:FRAMES]` or `file:PATH`.
        #[arg(long)]
        source: String,

        /// Negotiate with receivers and let the producer stream directly.
        #[arg(long)]
        out_of_band: bool,

        /// Wait for this many receivers before starting.
        #[arg(long, default_value_t = 0)]
        receivers: usize,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let log = logging::init()?;
    let config = HostConfig::load(&cli.config);
    log.apply(&config.logging.level);

    info!("tilecast-host v{}", env!("CARGO_PKG_VERSION"));

    let Some(Command::Play {
        screen,
        source,
        out_of_band,
        receivers,
    }) = cli.command
    else {
        warn!("nothing to do; see --help");
        return Ok(());
    };

    let hub = Arc::new(
        TcpReceiverHub::bind_with_depth(config.network.listen_addr.as_str(), config.network.send_queue_depth).await?,
    );
    let engine = Arc::new(HostEngine::new());
    let mut manager = SessionManager::new(engine, hub.clone(), config.to_session_config());

    let coordinator = manager.handshake_coordinator();
    hub.register_handler(ACKNOWLEDGEMENT_CHANNEL, coordinator.clone());
    hub.register_handler(HANDSHAKE_CHANNEL, coordinator);

    if receivers > 0 {
        info!("waiting for {receivers} receivers on {}", hub.local_addr());
        tokio::select! {
            _ = hub.wait_for_receivers(receivers, Duration::MAX) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }

    let mode = if out_of_band {
        DeliveryMode::OutOfBand
    } else {
        DeliveryMode::InBand
    };
    let result = manager
        .start_playback(PlaybackRequest::new(screen.as_str(), source.as_str(), mode))
        .await;
    let outcome = PlaybackOutcome::from_result(&result);
    match result {
        Ok(mode) => info!(session = %screen, ?mode, "{outcome}"),
        Err(e) => {
            error!(session = %screen, error = %e, "playback failed");
            println!("{outcome}");
            return Ok(());
        }
    }
    println!("{outcome}");

    // Run until the stream ends or the operator stops it.
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
            _ = poll.tick() => {
                if let Ok(status) = manager.status(&screen) {
                    if let SessionPhase::Ended(exit) = status.phase {
                        info!(session = %screen, %exit, "session ended");
                        break;
                    }
                }
            }
        }
    }

    // Joins the render thread.
    tokio::task::block_in_place(|| manager.kill(&screen))?;
    Ok(())
}
