//! # badgelink
//!
//! Command-line host for the badge link.
//!
//! ## Usage
//!
//! ```bash
//! # Look for badges nearby
//! badgelink scan
//!
//! # Connect once by id; later runs reconnect to it automatically
//! badgelink connect AA:BB:CC:DD:EE:FF
//!
//! # Push content
//! badgelink text "Hello" --color "#00FF00"
//! badgelink image cat.png --caption "a cat"
//!
//! # See what the badge would draw, without a badge
//! badgelink preview cat.png --out cat-1bit.png
//!
//! # Try everything against the in-memory badge
//! badgelink --simulate text "Hi"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::{LevelFilter, info, warn};

use badge_link::config::LinkConfig;
use badge_link::core::bitmap::{self, PipelineOptions};
use badge_link::core::bluetooth::{
    AutoConnectOutcome, BadgeManager, ReceivedFrame, SimulatedBadge, SimulatedTransport,
    StatusIndicator, Transport,
};
use badge_link::logging;
use badge_link::state::AppState;

const SIMULATED_BADGE_ID: &str = "SIM-BADGE-0001";

/// badgelink - push text and images to an e-ink badge over Bluetooth LE
#[derive(Parser, Debug)]
#[command(name = "badgelink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Link configuration file
    #[arg(long, global = true, value_name = "FILE", default_value = "link_config.json")]
    config: PathBuf,

    /// Where the last connected badge is remembered
    #[arg(long, global = true, value_name = "FILE", default_value = "badge_store.json")]
    store: PathBuf,

    /// Talk to an in-memory badge instead of the radio
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for nearby peripherals
    Scan,

    /// Connect and stay connected, printing link status until Ctrl-C
    Connect {
        /// Device to connect to (defaults to the preferred or remembered badge)
        id: Option<String>,
    },

    /// Drop the system connection to the remembered badge
    Disconnect {
        /// Also forget the remembered badge
        #[arg(long)]
        forget: bool,
    },

    /// Show a line of text
    Text {
        text: String,

        /// Colour as #RRGGBB
        #[arg(long, default_value = "#FFFFFF")]
        color: String,

        /// Device to use instead of the preferred or remembered badge
        #[arg(long)]
        device: Option<String>,
    },

    /// Show an image with an optional caption
    Image {
        /// PNG, JPEG or any other format the image crate decodes
        path: PathBuf,

        #[arg(long, default_value = "")]
        caption: String,

        /// Device to use instead of the preferred or remembered badge
        #[arg(long)]
        device: Option<String>,
    },

    /// Render an image the way the badge will show it and save it as PNG
    Preview {
        path: PathBuf,

        #[arg(long, value_name = "FILE", default_value = "preview.png")]
        out: PathBuf,

        /// Output side in pixels (defaults to the configured image size)
        #[arg(long)]
        size: Option<u32>,

        /// Skip the contrast stretch
        #[arg(long)]
        no_stretch: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    if let Commands::Preview {
        path,
        out,
        size,
        no_stretch,
    } = &cli.command
    {
        return preview(&cli.config, path, out, *size, !*no_stretch).await;
    }
    if cli.simulate {
        info!("Using the simulated badge {}", SIMULATED_BADGE_ID);
        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new(
            SIMULATED_BADGE_ID,
            "Simulated Badge",
        )));
        let state = AppState::with_transport(transport.clone(), &cli.config, &cli.store).await?;
        transport.set_max_write_len(state.manager().config().max_write_len);
        let command = with_default_device(cli.command, SIMULATED_BADGE_ID);
        let result = run(&state, command).await;
        for frame in transport.frames() {
            println!("Badge received {}", describe_frame(&frame));
        }
        result
    } else {
        let state = AppState::new(&cli.config, &cli.store).await?;
        run(&state, cli.command).await
    }
}

/// The simulated badge has no history, so point device-less commands at it.
fn with_default_device(command: Commands, id: &str) -> Commands {
    match command {
        Commands::Connect { id: None } => Commands::Connect {
            id: Some(id.to_string()),
        },
        Commands::Text {
            text,
            color,
            device: None,
        } => Commands::Text {
            text,
            color,
            device: Some(id.to_string()),
        },
        Commands::Image {
            path,
            caption,
            device: None,
        } => Commands::Image {
            path,
            caption,
            device: Some(id.to_string()),
        },
        other => other,
    }
}

async fn run<T: Transport>(state: &AppState<T>, command: Commands) -> Result<()> {
    let manager = state.manager();

    match command {
        Commands::Scan => {
            let mut found = manager.device_events();
            let printer = tokio::spawn(async move {
                while let Some(device) = found.next().await {
                    println!(
                        "  {}  {:<24} {}",
                        device.id,
                        device.name.as_deref().unwrap_or("(unnamed)"),
                        device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_default()
                    );
                }
            });
            println!("Scanning for {} s...", manager.config().discovery_scan().as_secs());
            let devices = manager
                .discover()
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            printer.abort();
            println!("{} device(s) found.", devices.len());
        }

        Commands::Connect { id } => {
            connect(&manager, id).await?;
            manager.start();
            let mut status = manager.subscribe();
            println!("Press Ctrl-C to disconnect.");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let indicator = status.borrow_and_update().indicator();
                        println!("{}", describe_indicator(indicator));
                    }
                }
            }
            manager.disconnect().await.map_err(|e| anyhow!(e.user_message()))?;
            manager.shutdown();
        }

        Commands::Disconnect { forget } => {
            match manager.supervisor().resolve_target().await {
                Some(id) => {
                    state
                        .transport
                        .cancel_connection(&id)
                        .await
                        .map_err(|e| anyhow!("disconnecting {}: {}", id, e))?;
                    println!("Disconnected {}.", id);
                }
                None => println!("No badge remembered."),
            }
            if forget {
                manager
                    .supervisor()
                    .forget_target()
                    .await
                    .map_err(|e| anyhow!("forgetting badge: {}", e))?;
                println!("Forgot the remembered badge.");
            }
        }

        Commands::Text {
            text,
            color,
            device,
        } => {
            connect(&manager, device).await?;
            let result = manager.send_text(&text, &color).await;
            finish(&manager, result.map(|r| r.bytes)).await?;
        }

        Commands::Image {
            path,
            caption,
            device,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            connect(&manager, device).await?;
            let result = manager.send_image(&bytes, &caption).await;
            finish(&manager, result.map(|r| r.bytes)).await?;
        }

        Commands::Preview { .. } => bail!("preview does not talk to a badge"),
    }
    Ok(())
}

async fn connect<T: Transport>(manager: &BadgeManager<T>, device: Option<String>) -> Result<()> {
    if let Some(id) = device {
        let handle = manager
            .connect_to_device(&id)
            .await
            .map_err(|e| anyhow!(e.user_message()))?;
        println!("Connected to {}", handle.display_name());
        return Ok(());
    }

    match manager.auto_connect().await {
        AutoConnectOutcome::Connected(handle) => {
            println!("Connected to {}", handle.display_name());
            Ok(())
        }
        AutoConnectOutcome::AlreadyActive => Ok(()),
        AutoConnectOutcome::NoTarget => {
            bail!("No badge known yet. Run `badgelink scan`, then `badgelink connect <ID>`.")
        }
        AutoConnectOutcome::Exhausted => bail!("Could not reach the badge. Please scan manually."),
        AutoConnectOutcome::Interrupted => bail!("Connection attempt was interrupted."),
        AutoConnectOutcome::Rejected(e) => bail!(e.user_message()),
    }
}

async fn finish<T: Transport>(
    manager: &BadgeManager<T>,
    result: Result<usize, badge_link::LinkError>,
) -> Result<()> {
    if let Err(e) = manager.disconnect().await {
        warn!("Disconnect after send failed: {}", e);
    }
    let bytes = result.map_err(|e| anyhow!(e.user_message()))?;
    println!("Sent {} bytes.", bytes);
    Ok(())
}

async fn preview(
    config_path: &Path,
    path: &Path,
    out: &Path,
    size: Option<u32>,
    contrast_stretch: bool,
) -> Result<()> {
    let size = match size {
        Some(size) => size,
        None => LinkConfig::load_config(config_path).await?.image_size,
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let raster = bitmap::decode_for_badge(&bytes, size)?;
    let frame = bitmap::render_with(&raster, size, size, PipelineOptions { contrast_stretch })?;
    frame
        .to_gray_image()
        .save(out)
        .with_context(|| format!("writing {}", out.display()))?;
    println!(
        "Wrote {}x{} preview ({} bytes packed) to {}",
        frame.width(),
        frame.height(),
        frame.len(),
        out.display()
    );
    Ok(())
}

fn describe_indicator(indicator: StatusIndicator) -> String {
    match indicator {
        StatusIndicator::Disconnected => "Disconnected".to_string(),
        StatusIndicator::Connecting { retry: 0 } => "Connecting...".to_string(),
        StatusIndicator::Connecting { retry } => format!("Connecting (retry {})...", retry),
        StatusIndicator::Connected { rssi: Some(rssi) } => format!("Connected, {} dBm", rssi),
        StatusIndicator::Connected { rssi: None } => "Connected".to_string(),
    }
}

fn describe_frame(frame: &ReceivedFrame) -> String {
    match frame {
        ReceivedFrame::Text { text, color } => format!("text {:?} in {}", text, color),
        ReceivedFrame::Image {
            width,
            height,
            prompt,
            bitmap,
        } => format!(
            "{}x{} image, {} bytes{}",
            width,
            height,
            bitmap.len(),
            prompt
                .as_ref()
                .map(|p| format!(", caption {:?}", p))
                .unwrap_or_default()
        ),
    }
}
