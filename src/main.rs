//! Command-line entry point for the chamber proxy.
//!
//! Loads settings, starts the proxy actor against the configured device (or
//! an in-process simulated chamber with `--mock`), performs a status smoke
//! check, and optionally drives the proxy from stdin. Transport bindings
//! (REST and friends) live outside this crate and talk to the same
//! `ProxyHandle` API.

use anyhow::{Context, Result};
use chamber_guard::codec::Operation;
use chamber_guard::config::Settings;
use chamber_guard::link::{mock, TcpDeviceLink};
use chamber_guard::proxy::{spawn_proxy, ProxyHandle};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(
    name = "chamber_guard",
    version,
    about = "Safety-enforcing proxy for a fragile thermal chamber"
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured device host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured device port.
    #[arg(long)]
    port: Option<u16>,

    /// Serve an in-process simulated chamber and connect to it.
    #[arg(long)]
    mock: bool,

    /// Read operations from stdin after the startup status check.
    #[arg(long)]
    interactive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings =
        Settings::new(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = cli.host {
        settings.device.host = host;
    }
    if let Some(port) = cli.port {
        settings.device.port = port;
    }

    if cli.mock {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock chamber listener")?;
        let addr = listener.local_addr()?;
        settings.device.host = addr.ip().to_string();
        settings.device.port = addr.port();
        let chamber = Arc::new(Mutex::new(mock::SimulatedChamber::new()));
        tokio::spawn(mock::serve(listener, chamber));
        info!("Simulated chamber listening on {}", addr);
    }

    info!("Connecting to chamber at {}", settings.device.addr());
    let link = TcpDeviceLink::new(
        settings.device.addr(),
        settings.device.connect_timeout,
        settings.device.round_trip_timeout,
        settings.device.retry_policy(),
    );
    let (proxy, task) = spawn_proxy(
        Box::new(link),
        settings.thresholds.clone(),
        settings.proxy.command_channel_capacity,
    );

    // Startup smoke check; connection failure shows up in the outcome
    // rather than crashing the process.
    let status = proxy.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if cli.interactive {
        run_repl(&proxy).await?;
    }

    proxy.shutdown().await?;
    task.await.context("proxy actor panicked")?;
    Ok(())
}

async fn run_repl(proxy: &ProxyHandle) -> Result<()> {
    println!(
        "commands: status | open | close | temp <celsius> | start | stop | \
         estop | calibrate | reset | read-temp | maintenance | quit"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "quit" || trimmed == "exit" {
            break;
        }
        match parse_command(trimmed) {
            Some(op) => {
                let outcome = proxy.execute(op).await?;
                println!("{}", serde_json::to_string(&outcome)?);
            }
            None => println!("unrecognized command: {}", trimmed),
        }
    }
    Ok(())
}

fn parse_command(line: &str) -> Option<Operation> {
    let mut parts = line.split_whitespace();
    let op = match parts.next()? {
        "status" => Operation::GetStatus,
        "open" => Operation::OpenDoor,
        "close" => Operation::CloseDoor,
        "temp" => Operation::SetTemperature(parts.next()?.parse().ok()?),
        "start" => Operation::StartCycle,
        "stop" => Operation::StopCycle,
        "estop" => Operation::EmergencyStop,
        "calibrate" => Operation::Calibrate,
        "reset" => Operation::Reset,
        "read-temp" => Operation::GetTemperature,
        "maintenance" => Operation::MaintenanceMode,
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_commands() {
        assert_eq!(parse_command("status"), Some(Operation::GetStatus));
        assert_eq!(parse_command("open"), Some(Operation::OpenDoor));
        assert_eq!(parse_command("estop"), Some(Operation::EmergencyStop));
        assert_eq!(parse_command("maintenance"), Some(Operation::MaintenanceMode));
    }

    #[test]
    fn test_parse_temp_argument() {
        assert_eq!(
            parse_command("temp 42.5"),
            Some(Operation::SetTemperature(42.5))
        );
        assert_eq!(parse_command("temp"), None);
        assert_eq!(parse_command("temp warm"), None);
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse_command("frobnicate"), None);
    }
}
