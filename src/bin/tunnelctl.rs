//! Tunnel Control CLI (tunnelctl)
//!
//! Drives the process-wide tunnel adapter from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Show the tunnel status
//! tunnelctl status
//!
//! # Bring the tunnel up and wait up to 30 seconds for it to connect
//! tunnelctl --config ~/.config/tunnelctl/config.toml start --server vpn.example.net --wait 30
//!
//! # Pass options through to the platform
//! tunnelctl start --option username=alice --option mtu=1380
//!
//! # Follow status changes until Ctrl+C
//! tunnelctl watch
//! ```

use chrono::Local;
use clap::{Parser, Subcommand};
use libtunnelctl::error::{TunnelctlError, TunnelctlResult};
use libtunnelctl::{Notification, TunnelAdapter, TunnelOptions, TunnelStatus, TunnelctlConfig};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Tunnel Control CLI
#[derive(Parser, Debug)]
#[command(name = "tunnelctl")]
#[command(author = "tunnelctl contributors")]
#[command(version)]
#[command(about = "Tunnel Control - start, stop and watch a platform-managed VPN tunnel", long_about = None)]
struct Args {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/tunnelctl/config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the current tunnel status
    Status,

    /// Bring the tunnel up
    Start {
        /// Display name for the tunnel
        #[arg(long)]
        name: Option<String>,

        /// Server address
        #[arg(long)]
        server: Option<String>,

        /// Option passed to the platform, as KEY=VALUE (repeatable)
        #[arg(short = 'o', long = "option", value_parser = parse_option)]
        options: Vec<(String, Value)>,

        /// Seconds to wait for the tunnel to connect (0 = don't wait)
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Tear the tunnel down
    Stop {
        /// Seconds to wait for the tunnel to disconnect (0 = don't wait)
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Print every status change until interrupted
    Watch,

    /// Print the effective configuration
    Config,
}

/// Parse KEY=VALUE; VALUE is read as JSON when it parses, else as a string
fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> TunnelctlResult<()> {
    let args = Args::parse();

    init_logging(&args);

    let config_path = args
        .config
        .clone()
        .or_else(|| TunnelctlConfig::default_path().filter(|p| p.exists()));
    let config = TunnelctlConfig::load_or_default(config_path.as_deref())?;
    debug!("Using configuration from {:?}", config_path);

    if let Commands::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let adapter = TunnelAdapter::install(config.build_platform()?, &config)?;
    info!("Using '{}' platform", adapter.platform_name());

    match args.command {
        Commands::Status => {
            println!("{}", adapter.status());
        }
        Commands::Start { name, server, options, wait } => {
            if let Some(name) = name {
                adapter.set_display_name(name);
            }
            if let Some(server) = server {
                adapter.set_server_address(server);
            }
            let options: Option<TunnelOptions> = if options.is_empty() {
                None
            } else {
                Some(options.into_iter().collect())
            };

            let mut rx = adapter.subscribe();
            let request = adapter.start_tunnel(options);
            if wait == 0 {
                let _ = request.await;
                println!("{}", adapter.status());
                return Ok(());
            }

            let status = wait_for_connected(&adapter, &mut rx, Duration::from_secs(wait)).await?;
            println!("{}", status);
        }
        Commands::Stop { wait } => {
            let mut rx = adapter.subscribe();
            let _ = adapter.stop_tunnel().await;

            // Stop on an idle tunnel produces no events
            let status = adapter.status();
            if wait > 0 && (status.is_active() || status == TunnelStatus::Disconnecting) {
                wait_for_disconnected(&adapter, &mut rx, Duration::from_secs(wait)).await?;
            }
            println!("{}", adapter.status());
        }
        Commands::Watch => {
            watch(&adapter).await?;
        }
        Commands::Config => unreachable!("handled before the adapter is installed"),
    }

    Ok(())
}

/// Wait for `connected`, failing if the tunnel falls back down or time runs out
async fn wait_for_connected(
    adapter: &Arc<TunnelAdapter>,
    rx: &mut broadcast::Receiver<Notification>,
    limit: Duration,
) -> TunnelctlResult<TunnelStatus> {
    let outcome = tokio::time::timeout(limit, async {
        let mut attempted = false;
        loop {
            let status = adapter.status();
            match status {
                TunnelStatus::Connected => return Ok(status),
                TunnelStatus::Connecting | TunnelStatus::Reasserting => attempted = true,
                TunnelStatus::Disconnected | TunnelStatus::Invalid if attempted => {
                    return Err(TunnelctlError::InvalidState(format!(
                        "tunnel fell back to {} before connecting",
                        status
                    )));
                }
                _ => {}
            }
            if !next_notification(rx).await {
                return Err(TunnelctlError::InvalidState("status relay stopped".to_string()));
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(TunnelctlError::InvalidState(format!(
            "tunnel did not connect within {}s (status: {})",
            limit.as_secs(),
            adapter.status()
        )))
    })
}

/// Wait for `disconnected` or `invalid`
async fn wait_for_disconnected(
    adapter: &Arc<TunnelAdapter>,
    rx: &mut broadcast::Receiver<Notification>,
    limit: Duration,
) -> TunnelctlResult<()> {
    let outcome = tokio::time::timeout(limit, async {
        while !matches!(adapter.status(), TunnelStatus::Disconnected | TunnelStatus::Invalid) {
            if !next_notification(rx).await {
                break;
            }
        }
    })
    .await;

    outcome.map_err(|_| {
        TunnelctlError::InvalidState(format!(
            "tunnel did not disconnect within {}s (status: {})",
            limit.as_secs(),
            adapter.status()
        ))
    })
}

/// Wait for the next notification. Returns false once the channel is closed.
async fn next_notification(rx: &mut broadcast::Receiver<Notification>) -> bool {
    match rx.recv().await {
        Ok(_) => true,
        Err(RecvError::Lagged(skipped)) => {
            debug!("Missed {} notifications", skipped);
            true
        }
        Err(RecvError::Closed) => false,
    }
}

/// Print status changes until Ctrl+C
async fn watch(adapter: &Arc<TunnelAdapter>) -> TunnelctlResult<()> {
    let mut rx = adapter.subscribe();
    println!("{} {}", Local::now().format("%H:%M:%S"), adapter.status());

    loop {
        tokio::select! {
            received = next_notification(&mut rx) => {
                if !received {
                    warn!("Status relay stopped");
                    break;
                }
                println!("{} {}", Local::now().format("%H:%M:%S"), adapter.status());
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| TunnelctlError::PlatformError(format!("Failed to listen for Ctrl+C: {}", e)))?;
                info!("Received Ctrl+C, stopping watch");
                break;
            }
        }
    }

    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("tunnelctl={},libtunnelctl={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option() {
        assert_eq!(parse_option("mtu=1380").unwrap(), ("mtu".to_string(), Value::from(1380)));
        assert_eq!(
            parse_option("user=alice").unwrap(),
            ("user".to_string(), Value::String("alice".to_string()))
        );
        assert_eq!(
            parse_option("expr=a=b").unwrap(),
            ("expr".to_string(), Value::String("a=b".to_string()))
        );
        assert!(parse_option("novalue").is_err());
        assert!(parse_option("=x").is_err());
    }
}
