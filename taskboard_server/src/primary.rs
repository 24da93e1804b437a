//! Task board primary node executable.

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
    /// Listening port for client and peer channels.
    port: u16,

    /// Node ID of myself.
    node_id: i32,

    /// Backup peer IP; omit together with the peer port to disable
    /// replication.
    peer_ip: Option<IpAddr>,

    /// Backup peer port.
    peer_port: Option<u16>,

    /// Optional TOML string overriding node tunables.
    /// Example: --config='heartbeat_interval_ms = 1000'
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitizes command line arguments into the replication target.
    fn peer(&self) -> Result<Option<SocketAddr>, TaskboardError> {
        match (self.peer_ip, self.peer_port) {
            (Some(ip), Some(port)) => Ok(Some(SocketAddr::new(ip, port))),
            (None, None) => Ok(None),
            _ => Err(TaskboardError(
                "peer IP and peer port must be given together".into(),
            )),
        }
    }
}

// Primary node executable main entrance.
fn primary_main() -> Result<(), TaskboardError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let peer = args.peer()?;
    let config = parsed_config!(args.config.as_deref() => NodeConfig;
                                heartbeat_interval_ms, catchup_retries)?;

    let listen_addr: SocketAddr =
        SocketAddr::new("0.0.0.0".parse()?, args.port);

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name(format!("tokio-worker-node{}", args.node_id))
        .build()?;

    // enter tokio runtime, set the node up, and run the accept loop
    runtime.block_on(async move {
        let node = Node::new_primary(args.node_id, peer, config).await?;
        let listener = Node::bind(listen_addr).await?;

        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                pf_warn!("shutting down primary...");
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

    if let Err(e) = primary_main() {
        pf_error!("primary_main exited: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_args_both_or_neither() -> Result<(), TaskboardError> {
        let args = CliArgs {
            port: 12345,
            node_id: 0,
            peer_ip: Some("127.0.0.1".parse()?),
            peer_port: Some(12346),
            config: None,
        };
        assert!(args.peer()?.is_some());

        let args = CliArgs {
            port: 12345,
            node_id: 0,
            peer_ip: None,
            peer_port: None,
            config: None,
        };
        assert!(args.peer()?.is_none());

        let args = CliArgs {
            port: 12345,
            node_id: 0,
            peer_ip: Some("127.0.0.1".parse()?),
            peer_port: None,
            config: None,
        };
        assert!(args.peer().is_err());
        Ok(())
    }

    #[test]
    fn config_string_overrides() -> Result<(), TaskboardError> {
        let config = parsed_config!(
            Some("heartbeat_interval_ms = 750") => NodeConfig;
            heartbeat_interval_ms, catchup_retries)?;
        assert_eq!(config.heartbeat_interval_ms, 750);
        assert_eq!(config.catchup_retries, NodeConfig::default().catchup_retries);
        Ok(())
    }
}
