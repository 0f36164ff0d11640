//! netspeed - LAN throughput measurement over TCP and UDP

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netspeed::client::{Client, ClientConfig, DEFAULT_FILE_SIZE};
use netspeed::config::Config;
use netspeed::net::UNSPECIFIED_V4;
use netspeed::output::{output_json, output_plain, save_json};
use netspeed::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_PORT, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, RunReport,
};
use netspeed::serve::{DEFAULT_BROADCAST_INTERVAL, Server, ServerConfig};
use netspeed::udp::DEFAULT_IDLE_TIMEOUT;

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("netspeed={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();

    if let Some(file_path) = log_file {
        // Expand tilde to home directory
        let expanded_path = match file_path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(file_path)),
            None => PathBuf::from(file_path),
        };

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_appender = tracing_appender::rolling::daily(
            expanded_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("netspeed.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "netspeed")]
#[command(author, version, about = "LAN throughput measurement over TCP and UDP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Bytes requested by every transfer (e.g., 500, 64K, 1M)
    #[arg(short, long, value_parser = parse_size, env = "NETSPEED_SIZE")]
    size: Option<u64>,

    /// Number of parallel TCP transfers
    #[arg(long, env = "NETSPEED_TCP")]
    tcp: Option<u32>,

    /// Number of parallel UDP transfers
    #[arg(long, env = "NETSPEED_UDP")]
    udp: Option<u32>,

    /// Port to listen on for server offers
    #[arg(long, env = "NETSPEED_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    /// Stop after this many runs (default: run until interrupted)
    #[arg(long)]
    runs: Option<u32>,

    /// UDP inactivity timeout that ends a transfer
    #[arg(long, value_parser = parse_duration)]
    udp_timeout: Option<Duration>,

    /// Data bytes per UDP segment (must match the server)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// Write each run's JSON report to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log file path (e.g., "~/.config/netspeed/netspeed.log")
    #[arg(long, env = "NETSPEED_LOG_FILE", global = true)]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "NETSPEED_LOG_LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start server mode
    Serve {
        /// TCP listening port
        #[arg(long, env = "NETSPEED_TCP_PORT")]
        tcp_port: Option<u16>,

        /// UDP request port
        #[arg(long, env = "NETSPEED_UDP_PORT")]
        udp_port: Option<u16>,

        /// Port offers are broadcast to
        #[arg(long, env = "NETSPEED_DISCOVERY_PORT")]
        discovery_port: Option<u16>,

        /// Offer destination address
        #[arg(long, env = "NETSPEED_BROADCAST")]
        broadcast: Option<IpAddr>,

        /// Delay between offers
        #[arg(long, value_parser = parse_duration)]
        interval: Option<Duration>,

        /// Data bytes per UDP segment
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Local address to bind
        #[arg(long)]
        bind: Option<IpAddr>,
    },

    /// List servers broadcasting offers on the LAN
    Discover {
        /// How long to listen
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        timeout: Duration,

        /// Port to listen on for server offers
        #[arg(long, env = "NETSPEED_DISCOVERY_PORT")]
        discovery_port: Option<u16>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1024 * 1024 * 1024u64)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1024 * 1024u64)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    num.parse::<u64>()
        .map_err(|e| e.to_string())?
        .checked_mul(suffix)
        .ok_or_else(|| format!("size {} is too large", s))
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "netspeed", &mut std::io::stdout());
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completions early (before logging init)
    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    // Load config file (falls back to defaults if not found)
    let file_config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Ignoring config file {}: {}",
                Config::config_path().display(),
                e
            );
            Config::default()
        }
    };

    // Mode-specific log settings from the config file apply below the CLI
    let (mode_log_file, mode_log_level) = match &cli.command {
        Some(Commands::Serve { .. }) => {
            (&file_config.server.log_file, &file_config.server.log_level)
        }
        _ => (&file_config.client.log_file, &file_config.client.log_level),
    };
    let log_file = cli.log_file.as_ref().or(mode_log_file.as_ref());
    let log_level = cli.log_level.as_ref().or(mode_log_level.as_ref());
    init_logging(log_file.map(|s| s.as_str()), log_level.map(|s| s.as_str()))?;

    match cli.command {
        Some(Commands::Serve {
            tcp_port,
            udp_port,
            discovery_port,
            broadcast,
            interval,
            chunk_size,
            bind,
        }) => {
            let defaults = &file_config.server;

            // Use CLI values, falling back to config file, then defaults
            let broadcast_address = match broadcast {
                Some(addr) => addr,
                None => match defaults.broadcast_address {
                    Some(ref addr) => addr
                        .parse()
                        .with_context(|| format!("invalid broadcast_address {:?}", addr))?,
                    None => ServerConfig::default().broadcast_address,
                },
            };

            let config = ServerConfig {
                bind_ip: bind.unwrap_or(UNSPECIFIED_V4),
                tcp_port: tcp_port.or(defaults.tcp_port).unwrap_or(DEFAULT_TCP_PORT),
                udp_port: udp_port.or(defaults.udp_port).unwrap_or(DEFAULT_UDP_PORT),
                discovery_port: discovery_port
                    .or(defaults.discovery_port)
                    .unwrap_or(DEFAULT_DISCOVERY_PORT),
                broadcast_address,
                broadcast_interval: interval
                    .or(defaults.broadcast_interval_ms.map(Duration::from_millis))
                    .unwrap_or(DEFAULT_BROADCAST_INTERVAL),
                chunk_size: chunk_size.or(defaults.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE),
            };

            let server = Server::new(config);
            cancel_on_ctrl_c(server.cancellation_token().clone());
            server.run().await?;
        }

        Some(Commands::Discover {
            timeout,
            discovery_port,
        }) => {
            let port = discovery_port
                .or(file_config.client.discovery_port)
                .unwrap_or(DEFAULT_DISCOVERY_PORT);

            println!("Searching for netspeed servers...\n");

            let addr = SocketAddr::new(UNSPECIFIED_V4, port);
            let servers = netspeed::discover::discover(addr, timeout).await?;

            if servers.is_empty() {
                println!("No netspeed servers found.");
            } else {
                println!("Found {} server(s):", servers.len());
                for server in servers {
                    println!("  {}", server);
                }
            }
        }

        None => {
            let defaults = &file_config.client;

            let file_size = match cli.size {
                Some(size) => size,
                None => match defaults.file_size {
                    Some(ref size) => parse_size(size)
                        .map_err(|e| anyhow::anyhow!("invalid file_size {:?}: {}", size, e))?,
                    None => DEFAULT_FILE_SIZE,
                },
            };

            let chunk_size = cli
                .chunk_size
                .or(defaults.chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE);
            if chunk_size == 0 {
                anyhow::bail!("chunk size must be positive");
            }

            let discovery_port = cli
                .discovery_port
                .or(defaults.discovery_port)
                .unwrap_or(DEFAULT_DISCOVERY_PORT);

            let config = ClientConfig {
                file_size,
                tcp_connections: cli.tcp.or(defaults.tcp_connections).unwrap_or(1),
                udp_connections: cli.udp.or(defaults.udp_connections).unwrap_or(1),
                discovery_addr: SocketAddr::new(UNSPECIFIED_V4, discovery_port),
                chunk_size,
                udp_idle_timeout: cli
                    .udp_timeout
                    .or(defaults.udp_timeout_ms.map(Duration::from_millis))
                    .unwrap_or(DEFAULT_IDLE_TIMEOUT),
                runs: cli.runs,
                ..Default::default()
            };

            let json_output = cli.json || defaults.json_output.unwrap_or(false);
            run_client(config, json_output, cli.output).await?;
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig, json: bool, output: Option<PathBuf>) -> Result<()> {
    let client = Client::new(config);
    cancel_on_ctrl_c(client.cancellation_token().clone());

    let (tx, mut rx) = mpsc::channel::<RunReport>(16);

    // Print reports in a separate task
    let print_handle = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            let output_str = if json {
                output_json(&report)
            } else {
                output_plain(&report)
            };
            print!("{}", output_str);
            if json {
                println!();
            }
            let _ = io::stdout().flush();

            if let Some(ref path) = output {
                match save_json(&report, path) {
                    Ok(()) => info!("Results saved to {}", path.display()),
                    Err(e) => warn!("Failed to save results to {}: {}", path.display(), e),
                }
            }
        }
    });

    info!("Client started, listening for offers");
    let runs = client.run(Some(tx)).await?;

    // Wait for print task to finish
    let _ = print_handle.await;

    info!("Finished after {} run(s)", runs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("500").unwrap(), 500);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999999999999G").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["netspeed", "--size", "2K", "--tcp", "3", "--udp", "0"])
            .unwrap();
        assert_eq!(cli.size, Some(2048));
        assert_eq!(cli.tcp, Some(3));
        assert_eq!(cli.udp, Some(0));
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["netspeed", "serve", "--broadcast", "192.168.1.255"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Serve {
                broadcast: Some(_),
                ..
            })
        ));
    }
}
