//! Primary-to-backup replication session: the init handshake, the FIFO
//! op stream with per-entry acks, heartbeat probing, and the state
//! transfer flows used by catchup and rejoin.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::server::node::Node;
use crate::server::oplog::{LogEntry, OperationLog};
use crate::utils::{tcp_connect_with_retry, TaskboardError};
use crate::wire::{self, OpType};

/// Handle to the replication hub task running on the primary. The hub
/// owns the single outbound session; feeding it through a channel
/// serializes mutations against heartbeats.
pub(crate) struct ReplicationHub {
    /// Sender side of the entry channel.
    tx_entry: mpsc::UnboundedSender<(LogEntry, oneshot::Sender<bool>)>,

    /// Join handle of the forwarder task.
    _forwarder_handle: JoinHandle<()>,
}

impl ReplicationHub {
    /// Creates the hub and spawns the forwarder task, which also runs
    /// the heartbeat timer and the reconnection attempts.
    pub(crate) fn new_and_setup(
        node: Arc<Node>,
        peer_addr: SocketAddr,
        heartbeat_interval: Duration,
    ) -> Self {
        let (tx_entry, rx_entry) = mpsc::unbounded_channel();
        let mut forwarder = ReplicationForwarderTask {
            // weak, as the node owns this hub in turn
            node: Arc::downgrade(&node),
            peer_addr,
            heartbeat_interval,
            rx_entry,
            conn: None,
        };
        let forwarder_handle =
            tokio::spawn(async move { forwarder.run().await });

        ReplicationHub {
            tx_entry,
            _forwarder_handle: forwarder_handle,
        }
    }

    /// Queues one committed entry for forwarding. Queue order is wire
    /// order, so callers enqueue under the commit lock; the returned
    /// receiver resolves to the backup's ack (false when unreachable).
    pub(crate) fn enqueue(
        &self,
        entry: LogEntry,
    ) -> Result<oneshot::Receiver<bool>, TaskboardError> {
        let (tx_ack, rx_ack) = oneshot::channel();
        self.tx_entry
            .send((entry, tx_ack))
            .map_err(TaskboardError::msg)?;
        Ok(rx_ack)
    }
}

/// The forwarder task behind a `ReplicationHub`.
struct ReplicationForwarderTask {
    node: Weak<Node>,
    peer_addr: SocketAddr,
    heartbeat_interval: Duration,

    rx_entry: mpsc::UnboundedReceiver<(LogEntry, oneshot::Sender<bool>)>,

    /// Established session, `None` while the backup is unreachable.
    conn: Option<TcpStream>,
}

impl ReplicationForwarderTask {
    /// Forwarder task loop. The first timer tick fires immediately, so
    /// the initial session setup happens right at primary startup.
    async fn run(&mut self) {
        pf_debug!("replication forwarder task spawned");

        let mut ticker = time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                entry = self.rx_entry.recv() => {
                    let Some((entry, tx_ack)) = entry else {
                        break; // node dropped the hub
                    };
                    let acked = self.push_entry(&entry).await;
                    if tx_ack.send(acked).is_err() {
                        pf_warn!(
                            "ack receiver for entry {} dropped",
                            entry.entry_id
                        );
                    }
                },

                _ = ticker.tick() => {
                    if self.conn.is_some() {
                        self.ping().await;
                    } else {
                        self.reconnect().await;
                    }
                },
            }
        }

        pf_debug!("replication forwarder task exited");
    }

    /// Pushes one entry over the session, returning whether the backup
    /// acknowledged it. Any failure drops the session.
    async fn push_entry(&mut self, entry: &LogEntry) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        match Self::send_entry(conn, entry).await {
            Ok(true) => true,
            Ok(false) => {
                pf_warn!("backup nacked entry {}", entry.entry_id);
                self.conn = None;
                false
            }
            Err(e) => {
                pf_warn!(
                    "replicating entry {} failed: {}",
                    entry.entry_id,
                    e
                );
                self.conn = None;
                false
            }
        }
    }

    /// One steady-state replication exchange: op-code, entry, ack.
    async fn send_entry(
        conn: &mut TcpStream,
        entry: &LogEntry,
    ) -> Result<bool, TaskboardError> {
        wire::write_op_type(conn, entry.op_type).await?;
        wire::write_log_entry(conn, entry).await?;
        wire::read_success(conn).await
    }

    /// Probes the backup with a heartbeat ping between mutations.
    async fn ping(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let probe = async {
            wire::write_op_type(conn, OpType::HeartbeatPing).await?;
            wire::read_success(conn).await
        };
        match probe.await {
            Ok(true) => pf_trace!("heartbeat acked"),
            Ok(false) => {
                pf_warn!("heartbeat nacked; dropping replication session");
                self.conn = None;
            }
            Err(e) => {
                pf_warn!(
                    "heartbeat failed ({}); backup flagged disconnected",
                    e
                );
                self.conn = None;
            }
        }
    }

    /// Attempts to re-establish the session. A refused init handshake
    /// means the peer promoted itself; the primary then runs the rejoin
    /// handshake and adopts the peer's state before trying again.
    async fn reconnect(&mut self) {
        match Self::open_session(self.peer_addr).await {
            Ok(Some(conn)) => {
                pf_info!(
                    "replication session to backup '{}' established",
                    self.peer_addr
                );
                self.conn = Some(conn);
            }
            Ok(None) => {
                pf_warn!(
                    "backup '{}' refused replication init; \
                     assuming it is promoted",
                    self.peer_addr
                );
                let Some(node) = self.node.upgrade() else {
                    return;
                };
                match node.rejoin_from_peer(self.peer_addr).await {
                    Ok(true) => pf_info!(
                        "adopted promoted peer state; re-initializing \
                         replication"
                    ),
                    Ok(false) => pf_warn!(
                        "peer '{}' did not serve the rejoin handshake",
                        self.peer_addr
                    ),
                    Err(e) => pf_warn!("rejoin attempt failed: {}", e),
                }
            }
            Err(e) => {
                pf_debug!("backup '{}' unreachable: {}", self.peer_addr, e);
            }
        }
    }

    /// Connects and performs the REPLICATION_INIT handshake. `Ok(None)`
    /// means the backup refused the handshake.
    async fn open_session(
        peer_addr: SocketAddr,
    ) -> Result<Option<TcpStream>, TaskboardError> {
        let mut conn = tcp_connect_with_retry(peer_addr, 0).await?;
        wire::write_op_type(&mut conn, OpType::ReplicationInit).await?;
        if wire::read_success(&mut conn).await? {
            Ok(Some(conn))
        } else {
            Ok(None)
        }
    }
}

/// Runs the backup-side replication loop after an accepted init
/// handshake. Any I/O or protocol failure on this session latches the
/// node into the promoted role, unless a newer session or a demotion
/// already superseded this one (`epoch` guard).
pub(crate) async fn run_backup_session(
    node: Arc<Node>,
    mut conn: TcpStream,
    epoch: u64,
) -> Result<(), TaskboardError> {
    let peer = conn.peer_addr()?;
    pf_info!("replication session with primary '{}' started", peer);

    loop {
        let op_type = match wire::read_op_type(&mut conn).await {
            Ok(Some(op)) => op,
            Ok(None) => {
                pf_warn!("primary '{}' disconnected", peer);
                node.promote(epoch)?;
                break;
            }
            Err(e) => {
                pf_warn!("replication session with '{}' broke: {}", peer, e);
                node.promote(epoch)?;
                break;
            }
        };

        match op_type {
            OpType::HeartbeatPing => {
                if let Err(e) = wire::write_success(&mut conn, true).await {
                    pf_warn!("heartbeat ack to '{}' failed: {}", peer, e);
                    node.promote(epoch)?;
                    break;
                }
                pf_trace!("heartbeat ping acked");
            }
            OpType::MasterRejoin => {
                // a restarting primary probing a backup that never
                // promoted; refuse without failing over
                pf_warn!("rejoin probe while not promoted; refusing");
                let _ = wire::write_success(&mut conn, false).await;
                break;
            }
            op if op.is_data() => {
                if let Err(e) = apply_replicated(&node, &mut conn).await {
                    pf_warn!(
                        "applying replicated {:?} failed: {}",
                        op,
                        e
                    );
                    node.promote(epoch)?;
                    break;
                }
            }
            other => {
                pf_warn!(
                    "unexpected op {:?} on replication session",
                    other
                );
                node.promote(epoch)?;
                break;
            }
        }
    }

    Ok(())
}

/// One steady-state exchange on the backup side: read the entry, append
/// it, replay exactly it, ack.
async fn apply_replicated(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let entry = wire::read_log_entry(conn).await?;
    node.oplog.append(entry.clone())?;
    OperationLog::apply(&node.store, &entry)?;
    wire::write_success(conn, true).await?;
    pf_debug!(
        "replicated entry {} ({:?}) applied",
        entry.entry_id,
        entry.op_type
    );
    Ok(())
}

/// Serves the rejoin handshake to a returning primary while promoted:
/// state transfer out, then demotion upon DEMOTE_ACK.
pub(crate) async fn serve_master_rejoin(
    node: Arc<Node>,
    mut conn: TcpStream,
) -> Result<(), TaskboardError> {
    pf_info!("primary is rejoining; serving state transfer");

    let state = node.export_state()?;
    pf_info!(
        "state transfer sending {} tasks, {} log entries, id counter {}",
        state.tasks.len(),
        state.log.len(),
        state.id_counter
    );
    wire::write_state_transfer(&mut conn, &state).await?;

    match wire::read_op_type(&mut conn).await? {
        Some(OpType::DemoteAck) => {
            node.demote()?;
            Ok(())
        }
        other => {
            logged_err!(
                "expected DEMOTE_ACK but got {:?}; staying promoted",
                other
            )
        }
    }
}

// Peer-client flows shared by node startup and the reconnect path.
impl Node {
    /// Attempts the rejoin handshake against a possibly-promoted peer.
    /// Returns true when the peer was promoted and its state has been
    /// adopted; false when the peer is unreachable or never promoted.
    pub(crate) async fn rejoin_from_peer(
        &self,
        peer_addr: SocketAddr,
    ) -> Result<bool, TaskboardError> {
        let mut conn = match tcp_connect_with_retry(peer_addr, 0).await {
            Ok(conn) => conn,
            Err(_) => return Ok(false), // normal on first start
        };

        wire::write_op_type(&mut conn, OpType::MasterRejoin).await?;

        // a never-promoted peer answers with a refusal flag and closes,
        // which surfaces here as a failed blob read
        let state = match wire::read_state_transfer(&mut conn).await {
            Ok(state) => state,
            Err(_) => {
                pf_info!(
                    "peer '{}' is not promoted; keeping local state",
                    peer_addr
                );
                return Ok(false);
            }
        };

        pf_info!(
            "adopting promoted peer state: {} tasks, {} log entries, \
             id counter {}",
            state.tasks.len(),
            state.log.len(),
            state.id_counter
        );
        self.install_state(state)?;

        wire::write_op_type(&mut conn, OpType::DemoteAck).await?;
        pf_info!("sent demote ack; peer returning to backup role");
        Ok(true)
    }

    /// Requests a full state snapshot from the primary (backup startup).
    /// Returns true when a snapshot was installed.
    pub(crate) async fn catchup_from_peer(
        &self,
        peer_addr: SocketAddr,
        retries: u8,
    ) -> Result<bool, TaskboardError> {
        let mut conn = match tcp_connect_with_retry(peer_addr, retries).await
        {
            Ok(conn) => conn,
            Err(_) => return Ok(false), // normal on first start
        };

        wire::write_op_type(&mut conn, OpType::StateTransferRequest).await?;
        let state = match wire::read_state_transfer(&mut conn).await {
            Ok(state) => state,
            Err(e) => {
                pf_warn!("state sync from '{}' failed: {}", peer_addr, e);
                return Ok(false);
            }
        };

        pf_info!(
            "state sync received {} tasks, {} log entries, id counter {}",
            state.tasks.len(),
            state.log.len(),
            state.id_counter
        );
        self.install_state(state)?;
        Ok(true)
    }
}
