//! Wii Remote CLI
//!
//! Connects to a Wii Remote over Bluetooth HID and prints the events the
//! session produces.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use wiimote_session::config::{Config, CONFIG_FILE};
use wiimote_session::hid::{HidLink, HidLinkConfig};
use wiimote_session::link::BdAddr;
use wiimote_session::motion::{tilt, AccelSample, RollTracker};
use wiimote_session::{
    Buttons, Calibration, ChannelListener, ConnectionState, Session, SessionEvent,
};

/// Wii Remote session tool
#[derive(Parser)]
#[command(name = "wiimote-session")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file or directory
    #[arg(short, long, env = "WIIMOTE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List visible Wii Remotes
    List,

    /// Print controller events until Ctrl+C
    Monitor {
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Track roll while button A is held
    Roll,

    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Device address (AA:BB:CC:DD:EE:FF)
        #[arg(short, long)]
        address: Option<BdAddr>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("wiimote_session={}", log_level).parse()?),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(Config::default_dir);

    match cli.command {
        Commands::List => list_controllers(),
        Commands::Monitor { json } => monitor(config_path, json).await,
        Commands::Roll => roll(config_path).await,
        Commands::Init { output, address } => init_config(output, address),
        Commands::Validate { file } => validate_config(file),
    }
}

fn list_controllers() -> Result<()> {
    println!("{}", "Searching for Wii Remotes...".dimmed());

    let link = HidLink::new(HidLinkConfig::default()).context("Failed to initialize HID API")?;
    let remotes = link.enumerate()?;

    if remotes.is_empty() {
        println!("{} No Wii Remotes found", "✗".bright_red());
        println!();
        println!("Make sure your controller is paired with the system");
        println!(
            "(press {} + {} or the red sync button to make it discoverable)",
            "1".bright_cyan(),
            "2".bright_cyan()
        );
        return Ok(());
    }

    println!(
        "\n{} Found {} controller(s):\n",
        "✓".bright_green(),
        remotes.len()
    );

    for (i, remote) in remotes.iter().enumerate() {
        let address = remote
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown address".to_string());
        println!(
            "  {}. {} ({:#06x}) - {}",
            i + 1,
            remote.product.bright_white(),
            remote.product_id,
            address.dimmed()
        );
    }

    println!();
    Ok(())
}

/// Connect on a blocking thread; the calibration query waits on the device
async fn open_session(
    config: &Config,
) -> Result<(Session<HidLink>, UnboundedReceiver<SessionEvent>)> {
    let link = Arc::new(
        HidLink::new(config.link_config()).context("Failed to initialize HID API")?,
    );
    let session = Session::new(link, config.session_config());
    let (listener, rx) = ChannelListener::channel();

    println!(
        "{} Searching for Wii Remote ({})...",
        "→".bright_blue(),
        config.address
    );

    let session = tokio::task::spawn_blocking(move || {
        session.connect(Arc::new(listener)).map(|_| session)
    })
    .await?
    .context("Failed to connect to Wii Remote")?;

    Ok((session, rx))
}

fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    Ok(running)
}

/// Pump events into `handle` until Ctrl+C or the session goes away
async fn run_events<F>(
    running: &AtomicBool,
    session: Session<HidLink>,
    mut rx: UnboundedReceiver<SessionEvent>,
    mut handle: F,
) -> Result<()>
where
    F: FnMut(&SessionEvent, Option<Calibration>),
{
    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(event)) => handle(&event, session.calibration()),
            Ok(None) => break,
            Err(_) => {}
        }
    }

    // Calibration is gone once the session is disconnected
    let calibration = session.calibration();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = session.disconnect() {
            warn!("{}", e);
        }
    })
    .await?;

    drain_events(&mut rx, calibration, handle);
    Ok(())
}

/// Hand over whatever is still queued, `Ended` included
fn drain_events<F>(
    rx: &mut UnboundedReceiver<SessionEvent>,
    calibration: Option<Calibration>,
    mut handle: F,
) where
    F: FnMut(&SessionEvent, Option<Calibration>),
{
    while let Ok(event) = rx.try_recv() {
        handle(&event, calibration);
    }
}

async fn monitor(config_path: PathBuf, json: bool) -> Result<()> {
    let config = Config::load_dir(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let running = shutdown_flag()?;

    let (session, rx) = open_session(&config).await?;
    println!("{}", "Press Ctrl+C to stop".dimmed());
    println!();

    run_events(&running, session, rx, |event, calibration| {
        if json {
            print_event_json(event);
        } else {
            print_event_pretty(event, calibration);
        }
    })
    .await?;

    println!("\n{} Monitoring stopped", "✓".bright_green());
    Ok(())
}

async fn roll(config_path: PathBuf) -> Result<()> {
    let mut config = Config::load_dir(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config.accelerometer = true;
    let running = shutdown_flag()?;

    let (session, rx) = open_session(&config).await?;
    println!(
        "{} Hold {} and roll the controller",
        "✓".bright_green(),
        "A".bright_cyan()
    );
    println!("{}", "Press Ctrl+C to stop".dimmed());

    let mut tracker = RollTracker::new();
    run_events(&running, session, rx, |event, _| match *event {
        SessionEvent::ButtonA { pressed } => tracker.set_engaged(pressed),
        SessionEvent::Accelerometer { x, y, z } => {
            if let Some(roll) = tracker.update(AccelSample::new(x, y, z)) {
                println!(" Roll = {}", roll);
            }
        }
        SessionEvent::Connection { state } => print_connection(state),
        _ => {}
    })
    .await?;

    Ok(())
}

fn print_event_json(event: &SessionEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

fn print_connection(state: ConnectionState) {
    match state {
        ConnectionState::Connected => println!("{} Connection succeeded", "✓".bright_green()),
        ConnectionState::Aborted => println!("{} Connection aborted", "✗".bright_red()),
        ConnectionState::Ended => println!("{} Connection ended", "✓".bright_green()),
    }
}

fn format_press(pressed: bool) -> colored::ColoredString {
    if pressed {
        "down".bright_green()
    } else {
        "up".dimmed()
    }
}

fn print_event_pretty(event: &SessionEvent, calibration: Option<Calibration>) {
    match *event {
        SessionEvent::Connection { state } => print_connection(state),
        SessionEvent::ButtonA { pressed } => {
            println!("  {} {}", "A".bright_cyan(), format_press(pressed));
        }
        SessionEvent::ButtonB { pressed } => {
            println!("  {} {}", "B".bright_cyan(), format_press(pressed));
        }
        SessionEvent::Buttons { previous, current } => {
            if previous != current {
                println!(
                    "  {} {} → {} [{}]",
                    "buttons".dimmed(),
                    previous,
                    current,
                    pressed_list(current)
                );
            }
        }
        SessionEvent::Accelerometer { x, y, z } => {
            let sample = AccelSample::new(x, y, z);
            match calibration.and_then(|c| sample.to_g(&c)) {
                Some(g) => {
                    let (roll, pitch) = tilt(&g);
                    println!(
                        "  {} ({:+4}, {:+4}, {:+4})  Roll: {:+6.1}°  Pitch: {:+6.1}°",
                        "accel".dimmed(),
                        x,
                        y,
                        z,
                        roll.to_degrees(),
                        pitch.to_degrees()
                    );
                }
                None => println!("  {} ({:+4}, {:+4}, {:+4})", "accel".dimmed(), x, y, z),
            }
        }
    }
}

fn pressed_list(buttons: Buttons) -> String {
    buttons.pressed_names().join(" ")
}

fn init_config(output: Option<PathBuf>, address: Option<BdAddr>) -> Result<()> {
    let output = output.unwrap_or_else(|| Config::default_dir().join(CONFIG_FILE));

    let mut config = Config::default();
    if let Some(address) = address {
        config.address = address;
    }

    config
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "{} Wrote configuration to {}",
        "✓".bright_green(),
        output.display().to_string().bright_yellow()
    );
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    match Config::load(&file) {
        Ok(config) => {
            println!("{} Configuration is valid", "✓".bright_green());
            println!("  Name:          {}", config.name);
            println!("  Address:       {}", config.address);
            println!("  Accelerometer: {}", config.accelerometer);
            println!("  Read timeout:  {} ms", config.read_timeout_ms);
            println!("  Calibration:   {} ms", config.calibration_timeout_ms);
            Ok(())
        }
        Err(e) => {
            println!("{} Invalid configuration: {:#}", "✗".bright_red(), e);
            Err(e)
        }
    }
}
