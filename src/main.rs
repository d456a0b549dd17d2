use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info};

use mobell_proxy::{logging, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "mobell-proxy")]
#[command(about = "MxPEG proxy between a Mobotix doorbell camera and MoBell clients", long_about = None)]
struct Args {
    /// Listen address and port
    #[arg(long = "listen.addr", env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Mobotix camera address (ip:port)
    #[arg(long = "mobotix.addr", env = "MOBOTIX_ADDR")]
    mobotix_addr: Option<String>,

    /// Mobotix camera user
    #[arg(long = "mobotix.user", env = "MOBOTIX_USER", default_value = "")]
    mobotix_user: String,

    /// Mobotix camera password
    #[arg(long = "mobotix.pass", env = "MOBOTIX_PASS", default_value = "")]
    mobotix_pass: String,

    /// Interface name for mac address detection
    #[arg(long, env = "IFACE")]
    iface: Option<String>,

    /// Delay between pings in seconds
    #[arg(long, env = "KEEPALIVE", default_value_t = 90)]
    keepalive: u64,

    /// Log file (stderr when not set)
    #[arg(long = "log.file", env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "debug")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(&args.log_level, args.log_file.as_deref())
        .context("error initializing logging")?;

    info!("starting mobell proxy");

    let mobotix_addr = args
        .mobotix_addr
        .ok_or_else(|| anyhow!("mobotix.addr is not provided"))?;

    let mac = detect_mac(args.iface.as_deref())?;

    let mut server = Server::new(ServerConfig {
        listen_addr: args.listen_addr,
        mobotix_addr,
        mobotix_user: args.mobotix_user,
        mobotix_pass: args.mobotix_pass,
        mac,
        keep_alive: Duration::from_secs(args.keepalive),
    });

    if let Err(e) = server.start().await {
        error!(error = %e, "error starting mobell proxy");
    }

    wait_for_shutdown().await?;

    info!("stopping mobell proxy");
    server.stop().await;
    info!("stopped mobell proxy");

    Ok(())
}

/// MAC of the named interface, or of the first interface with a hardware
/// address; canonical lowercase colon-separated form.
fn detect_mac(iface: Option<&str>) -> Result<String> {
    let mac = match iface {
        Some(name) => mac_address::mac_address_by_name(name)?,
        None => mac_address::get_mac_address()?,
    };

    let mac = mac.ok_or_else(|| anyhow!("can't detect mac address"))?;

    Ok(mac
        .bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = hup.recv() => {}
    }

    Ok(())
}
