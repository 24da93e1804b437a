//! Task board backup node executable.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use taskboard::{
    parsed_config, pf_error, pf_warn, Node, NodeConfig, TaskboardError,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Listening port for replication and client channels.
    port: u16,

    /// Node ID of myself.
    node_id: i32,

    /// Primary node IP.
    primary_ip: IpAddr,

    /// Primary node port.
    primary_port: u16,

    /// Optional TOML string overriding node tunables.
    /// Example: --config='catchup_retries = 3'
    #[arg(short, long)]
    config: Option<String>,
}

// Backup node executable main entrance.
fn backup_main() -> Result<(), TaskboardError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let primary_addr = SocketAddr::new(args.primary_ip, args.primary_port);
    let config = parsed_config!(args.config.as_deref() => NodeConfig;
                                heartbeat_interval_ms, catchup_retries)?;

    let listen_addr: SocketAddr =
        SocketAddr::new("0.0.0.0".parse()?, args.port);

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name(format!("tokio-worker-node{}", args.node_id))
        .build()?;

    // enter tokio runtime, sync state from the primary, and run the
    // accept loop awaiting the replication session
    runtime.block_on(async move {
        let node =
            Node::new_backup(args.node_id, primary_addr, config).await?;
        let listener = Node::bind(listen_addr).await?;

        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                pf_warn!("shutting down backup...");
                let _ = tx_term.send(true);
            }
        });

        node.run(listener, rx_term).await
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = backup_main() {
        pf_error!("backup_main exited: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
