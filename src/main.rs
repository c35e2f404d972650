//! Chaski-Confluent command-line entry points.
//!
//! Thin glue over the node runtime: each subcommand builds a `NodeConfig`,
//! starts the node and waits for ctrl-c. Address-valued environment
//! variables (`CHASKI_CERTIFICATE_AUTHORITY`, `CHASKI_STREAMER_ROOT`,
//! `CHASKI_REMOTE_PROXY`) supply defaults when flags are omitted.

use chaski::ca::{CaConfig, CertificateAuthority};
use chaski::net::{Node, NodeConfig};
use chaski::types::{Address, NodeClass};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "chaski", version, about = "Chaski-Confluent messaging fabric")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the certificate authority node
    Ca {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// CA state directory
        #[arg(long, default_value = "./chaski-ca")]
        path: PathBuf,
    },

    /// Run a streamer root node
    Root {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Topics to subscribe to (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        subscribe: Vec<String>,

        /// Seed peer to connect to (prefix with '*' to pair immediately)
        #[arg(long)]
        connect: Option<String>,
    },

    /// Run a remote-proxy node
    Remote {
        /// Listen port
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Proxy service name
        #[arg(short = 'n', long, default_value = "chaski-remote")]
        name: String,

        /// Module paths to expose
        modules: Vec<String>,
    },

    /// Send `terminate` to every node on a local port range, e.g. 65430-65440
    Terminate {
        /// Port range as <start>-<end>
        range: String,
    },
}

/// Read an address-valued environment variable, e.g.
/// `CHASKI_CERTIFICATE_AUTHORITY=ChaskiCA@127.0.0.1:65432`.
fn env_address(var: &str) -> Option<Address> {
    std::env::var(var).ok()?.parse().ok()
}

fn resolve_port(flag: Option<u16>, var: &str, fallback: u16) -> u16 {
    flag.or_else(|| env_address(var).map(|a| a.port))
        .unwrap_or(fallback)
}

async fn wait_for_shutdown(node: &Node) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    node.stop();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Cmd::Ca { port, path } => {
            let port = resolve_port(port, "CHASKI_CERTIFICATE_AUTHORITY", 65432);
            let ca = CertificateAuthority::open(CaConfig::new(path))?;
            let config = NodeConfig {
                class: NodeClass::Ca,
                port,
                ..Default::default()
            };
            let node = Node::start_with(config, Some(ca), None).await?;
            info!("chaski v{} certificate authority at {}", VERSION, node.address());
            wait_for_shutdown(&node).await;
        }

        Cmd::Root {
            port,
            subscribe,
            connect,
        } => {
            let port = resolve_port(port, "CHASKI_STREAMER_ROOT", 65433);
            let config = NodeConfig {
                class: NodeClass::Streamer,
                port,
                subscriptions: subscribe,
                ..Default::default()
            };
            let node = Node::start(config).await?;
            info!("chaski v{} streamer root at {}", VERSION, node.address());
            if let Some(target) = connect {
                node.connect(&target).await?;
            }
            wait_for_shutdown(&node).await;
        }

        Cmd::Remote {
            port,
            name,
            modules,
        } => {
            let port = resolve_port(port, "CHASKI_REMOTE_PROXY", 65432);
            let config = NodeConfig {
                class: NodeClass::Remote,
                port,
                allowed_modules: modules,
                ..Default::default()
            };
            let node = Node::start(config).await?;
            info!(
                "chaski v{} remote proxy '{}' at {}",
                VERSION,
                name,
                node.address()
            );
            wait_for_shutdown(&node).await;
        }

        Cmd::Terminate { range } => {
            let (start, end) = range
                .split_once('-')
                .and_then(|(a, b)| Some((a.parse::<u16>().ok()?, b.parse::<u16>().ok()?)))
                .ok_or("range must be <start>-<end>")?;

            let node = Node::start(NodeConfig::default()).await?;
            for port in start..=end {
                let target = format!("ChaskiNode@127.0.0.1:{port}");
                match node.terminate_peer(&target).await {
                    Ok(()) => info!("terminated {}", target),
                    Err(e) => info!("skipping {}: {}", target, e),
                }
            }
            node.stop();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chaski=info".parse().expect("valid directive")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
