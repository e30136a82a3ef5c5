// src/main.rs
//
// tilt-gateway: stdio bridge for the TiltBot serial gateway.
//
// `monitor` connects to the device, streams decoded events to stdout (human
// text or JSON lines) and forwards stdin lines to the device as commands —
// the same control surface a network transport would consume. `ports` and
// `send` cover discovery and one-shot commands.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use tiltlink::link::{list_ports, EventBus, GatewayEvent, LinkConfig, SerialLink, DISCONNECT_NOTICE};
use tiltlink::settings::GatewaySettings;
use tiltlink::{logging, settings, tlog};

#[derive(Parser)]
#[command(
    name = "tilt-gateway",
    version,
    about = "Serial transport gateway for the TiltBot balance controller"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available serial ports
    Ports {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect and bridge: decoded events to stdout, stdin lines to the device
    Monitor {
        /// Serial port path; falls back to `default_port` from settings
        #[arg(short, long)]
        port: Option<String>,
        /// Baud rate; falls back to `default_baud` from settings
        #[arg(short, long)]
        baud: Option<u32>,
        /// Emit events as JSON objects, one per line
        #[arg(long)]
        json: bool,
    },
    /// Send one command, print the device's console response, and exit
    Send {
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
        /// Milliseconds to wait for console output after the write
        #[arg(long, default_value_t = 500)]
        linger_ms: u64,
        /// Command text; newline framing is added automatically
        command: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = settings::load();

    if let Some(ref dir) = settings.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            tlog!("[main] {}", e);
        }
    }

    let result = match cli.command {
        Command::Ports { json } => run_ports(json),
        Command::Monitor { port, baud, json } => run_monitor(&settings, port, baud, json).await,
        Command::Send { port, baud, linger_ms, command } => {
            run_send(&settings, port, baud, linger_ms, &command).await
        }
    };

    logging::stop_file_logging();

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Resolve the connection target from flags and settings.
fn resolve_target(
    settings: &GatewaySettings,
    port: Option<String>,
    baud: Option<u32>,
) -> Result<LinkConfig, String> {
    let port = port
        .or_else(|| settings.default_port.clone())
        .ok_or("no --port given and no default_port in settings")?;
    Ok(LinkConfig::new(port, baud.unwrap_or(settings.default_baud)))
}

fn run_ports(json: bool) -> Result<(), String> {
    let ports = list_ports().map_err(|e| e.to_string())?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for p in ports {
        let label = p.product.or(p.manufacturer).unwrap_or_default();
        println!("{:<24} {:<10} {}", p.port_name, p.port_type, label);
    }
    Ok(())
}

fn build_link(settings: &GatewaySettings, bus: Arc<EventBus>) -> SerialLink {
    SerialLink::new(bus)
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
        .with_rate_window(Duration::from_millis(settings.rate_window_ms))
}

async fn run_monitor(
    settings: &GatewaySettings,
    port: Option<String>,
    baud: Option<u32>,
    json: bool,
) -> Result<(), String> {
    let config = resolve_target(settings, port, baud)?;

    let bus = Arc::new(EventBus::new());
    let link = build_link(settings, bus.clone());
    let mut sub = bus.subscribe();
    link.connect(config).await.map_err(|e| e.to_string())?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Some(event) => print_event(&event, json),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        if let Err(e) = link.send(&line) {
                            tlog!("[monitor] send failed: {}", e);
                        }
                    }
                }
                // EOF or a broken stdin; keep streaming events.
                _ => stdin_open = false,
            },
            _ = &mut ctrl_c => {
                tlog!("[monitor] interrupt; closing link");
                break;
            }
        }
    }

    link.disconnect().await;
    Ok(())
}

async fn run_send(
    settings: &GatewaySettings,
    port: Option<String>,
    baud: Option<u32>,
    linger_ms: u64,
    command: &str,
) -> Result<(), String> {
    let config = resolve_target(settings, port, baud)?;

    let bus = Arc::new(EventBus::new());
    let link = build_link(settings, bus.clone());
    let mut sub = bus.subscribe();
    link.connect(config).await.map_err(|e| e.to_string())?;

    let result = link.send(command).map_err(|e| e.to_string());

    if result.is_ok() {
        // Linger so the device's console response makes it back to us.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(linger_ms);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            if let GatewayEvent::Console { text } = event {
                if text != DISCONNECT_NOTICE {
                    println!("{}", text);
                }
            }
        }
    }

    link.disconnect().await;
    result
}

fn print_event(event: &GatewayEvent, json: bool) {
    if json {
        for msg in event.to_wire() {
            if let Ok(text) = serde_json::to_string(&msg) {
                println!("{}", text);
            }
        }
        return;
    }

    match event {
        GatewayEvent::Telemetry(f) => println!(
            "[{:>8} ms] setpoint {:+7.2}  measured {:+7.2}  error {:+7.2}  pitch {:+7.2}  roll {:+7.2}",
            f.timestamp_ms, f.setpoint, f.measured, f.error, f.pitch_angle, f.roll_angle
        ),
        GatewayEvent::Console { text } => println!("> {}", text),
        GatewayEvent::LinkRate { packets_per_second } => {
            println!("-- {:.1} packets/s", packets_per_second)
        }
    }
}
