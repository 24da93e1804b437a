//! Node role controller: owns the listener, the role state machine, and
//! acceptor dispatch over the first op-code of each accepted channel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use serde::Deserialize;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::server::clock::{ClientClocks, ProcessId};
use crate::server::oplog::{LogEntry, OperationLog};
use crate::server::replication::{self, ReplicationHub};
use crate::server::session;
use crate::server::store::TaskStore;
use crate::utils::{tcp_bind_with_retry, TaskboardError};
use crate::wire::{self, OpType, StateTransfer};

/// Node role in the primary/backup pair.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    /// Passively applying the primary's replicated mutations.
    Backup,

    /// Former backup serving clients after primary failure.
    Promoted,

    /// Serving clients and originating replication.
    Primary,

    /// Primary at startup, reconciling with a possibly-promoted peer.
    Rejoining,
}

impl Role {
    /// True when this role serves client mutations.
    pub(crate) fn serves_clients(self) -> bool {
        matches!(self, Role::Primary | Role::Promoted)
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Heartbeat send interval in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Connection retries for the startup state sync against the peer.
    pub catchup_retries: u8,
}

#[allow(clippy::derivable_impls)]
impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            heartbeat_interval_ms: 5000,
            catchup_retries: 1,
        }
    }
}

/// Role plus the replication-session epoch. The epoch invalidates stale
/// backup sessions: only the latest accepted session may trigger a
/// promotion, and a demotion bumps it so abandoned loops cannot re-latch.
#[derive(Debug)]
struct RoleState {
    role: Role,
    repl_epoch: u64,
}

/// A task board node: the five core components behind one owner, shared
/// across session workers through an `Arc`.
pub struct Node {
    /// My node ID.
    id: ProcessId,

    /// Static configuration parameters.
    config: NodeConfig,

    /// In-memory task store.
    pub(crate) store: TaskStore,

    /// Append-only operation log.
    pub(crate) oplog: OperationLog,

    /// Per-client causal clocks.
    pub(crate) clocks: ClientClocks,

    /// Role state machine; all transitions and role-sensitive dispatch
    /// reads go through this lock.
    role: Mutex<RoleState>,

    /// Serializes entry ID assignment with replication enqueueing, so
    /// wire order always matches log order.
    commit_lock: Mutex<()>,

    /// Replication hub, present on a primary configured with a peer.
    repl: OnceLock<ReplicationHub>,
}

impl Node {
    fn new(id: ProcessId, config: NodeConfig, role: Role) -> Arc<Self> {
        Arc::new(Node {
            id,
            config,
            store: TaskStore::new(),
            oplog: OperationLog::new(),
            clocks: ClientClocks::new(),
            role: Mutex::new(RoleState {
                role,
                repl_epoch: 0,
            }),
            commit_lock: Mutex::new(()),
            repl: OnceLock::new(),
        })
    }

    /// Creates a primary node. With a peer configured, the rejoin
    /// handshake runs first (adopting the peer's state if it promoted),
    /// then the replication hub spins up. Without a peer, replication is
    /// disabled.
    pub async fn new_primary(
        id: ProcessId,
        peer: Option<SocketAddr>,
        config: NodeConfig,
    ) -> Result<Arc<Self>, TaskboardError> {
        let node = Self::new(id, config, Role::Rejoining);
        pf_info!("starting primary node {}", id);

        if let Some(peer_addr) = peer {
            if node.rejoin_from_peer(peer_addr).await? {
                pf_info!("recovered state from promoted backup");
            }
            let hub = ReplicationHub::new_and_setup(
                node.clone(),
                peer_addr,
                Duration::from_millis(node.config.heartbeat_interval_ms),
            );
            node.repl
                .set(hub)
                .map_err(|_| TaskboardError::msg("replication hub set twice"))?;
            pf_info!("replication target is '{}'", peer_addr);
        } else {
            pf_info!("running without replication (no backup configured)");
        }

        node.role.lock()?.role = Role::Primary;
        Ok(node)
    }

    /// Creates a backup node, syncing a state snapshot from the primary
    /// when it is reachable and starting empty otherwise.
    pub async fn new_backup(
        id: ProcessId,
        primary_addr: SocketAddr,
        config: NodeConfig,
    ) -> Result<Arc<Self>, TaskboardError> {
        let node = Self::new(id, config, Role::Backup);
        pf_info!("starting backup node {}; primary is '{}'", id, primary_addr);

        let retries = node.config.catchup_retries;
        if node.catchup_from_peer(primary_addr, retries).await? {
            pf_info!("recovered state from primary");
        } else {
            pf_info!("starting fresh (primary not reachable)");
        }
        Ok(node)
    }

    /// My node ID.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> Result<Role, TaskboardError> {
        Ok(self.role.lock()?.role)
    }

    /// Latches the promoted role. Only the currently accepted replication
    /// session (matching `epoch`) may promote; stale sessions are
    /// ignored. Returns whether the latch flipped.
    pub(crate) fn promote(&self, epoch: u64) -> Result<bool, TaskboardError> {
        let mut state = self.role.lock()?;
        if state.role != Role::Backup || state.repl_epoch != epoch {
            return Ok(false);
        }
        state.role = Role::Promoted;
        drop(state);

        pf_warn!("PROMOTING TO MASTER");
        if let (Ok(tasks), Ok(entries)) =
            (self.store.task_count(), self.oplog.len())
        {
            pf_info!(
                "promoted with {} tasks and {} log entries; now serving \
                 client operations",
                tasks,
                entries
            );
        }
        Ok(true)
    }

    /// Reverts a promoted node to the backup role after a completed
    /// rejoin handshake. Per-client clocks are discarded; the epoch bump
    /// invalidates any session loop left over from before the promotion.
    pub(crate) fn demote(&self) -> Result<(), TaskboardError> {
        let mut state = self.role.lock()?;
        if state.role != Role::Promoted {
            return logged_err!(
                "demote requested in role {:?}",
                state.role
            );
        }
        state.role = Role::Backup;
        state.repl_epoch += 1;
        drop(state);

        self.clocks.clear()?;
        pf_info!("demoted; resuming backup role");
        Ok(())
    }

    /// Registers a newly accepted replication session, superseding any
    /// previous one. Returns the session's epoch.
    fn begin_replication(&self) -> Result<u64, TaskboardError> {
        let mut state = self.role.lock()?;
        state.repl_epoch += 1;
        Ok(state.repl_epoch)
    }

    /// Snapshot of the full node state for transfer to a peer.
    pub(crate) fn export_state(&self) -> Result<StateTransfer, TaskboardError> {
        Ok(StateTransfer {
            id_counter: self.store.id_counter()?,
            tasks: self.store.list_all()?,
            log: self.oplog.snapshot()?,
        })
    }

    /// Replaces local state with a transferred snapshot, adopting the
    /// sender's task ID and entry ID spaces.
    pub(crate) fn install_state(
        &self,
        state: StateTransfer,
    ) -> Result<(), TaskboardError> {
        self.store.clear_all()?;
        for task in state.tasks {
            self.store.add_direct(task)?;
        }
        self.store.set_id_counter(state.id_counter)?;
        self.oplog.replace(state.log)?;
        Ok(())
    }

    /// Appends a freshly committed mutation to the log and forwards it
    /// to the backup when replication is active. The response to the
    /// client is held back until the backup acked (or was found
    /// unreachable, which does not fail the commit).
    pub(crate) async fn commit_and_replicate(
        &self,
        entry: LogEntry,
    ) -> Result<(), TaskboardError> {
        let (entry, rx_ack) = {
            let _commit = self.commit_lock.lock()?;
            let entry = self.oplog.append_next(entry)?;
            let rx_ack = match self.repl.get() {
                Some(hub) => Some(hub.enqueue(entry.clone())?),
                None => None,
            };
            (entry, rx_ack)
        };

        if let Some(rx_ack) = rx_ack {
            if !rx_ack.await? {
                pf_debug!(
                    "entry {} committed without backup ack",
                    entry.entry_id
                );
            }
        }
        Ok(())
    }

    /// Binds the listening socket. Kept separate from `run` so binaries
    /// can exit with a failure code before entering the serve loop.
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<TcpListener, TaskboardError> {
        tcp_bind_with_retry(addr, 2).await
    }

    /// Accept loop. Every accepted channel gets its own worker task;
    /// runs until the termination signal flips or the sender is dropped.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), TaskboardError> {
        pf_info!(
            "node {} accepting connections on '{}'",
            self.id,
            listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, addr)) => {
                            let node = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    dispatch_conn(node, conn, addr).await
                                {
                                    pf_warn!(
                                        "connection '{}' ended with \
                                         error: {}",
                                        addr,
                                        e
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!("node {} caught termination signal", self.id);
                    break;
                },
            }
        }

        Ok(())
    }
}

/// Classifies an accepted channel by its first op-code and hands it to
/// the right session type. The role snapshot is taken once, here; board
/// reads and state transfer requests are served in every role.
async fn dispatch_conn(
    node: Arc<Node>,
    mut conn: TcpStream,
    addr: SocketAddr,
) -> Result<(), TaskboardError> {
    let Some(first_op) = wire::read_op_type(&mut conn).await? else {
        return Ok(()); // connection closed before any request
    };
    let role = node.role()?;

    match first_op {
        OpType::ReplicationInit => {
            if role == Role::Backup {
                let epoch = node.begin_replication()?;
                wire::write_success(&mut conn, true).await?;
                replication::run_backup_session(node, conn, epoch).await
            } else {
                pf_warn!(
                    "replication init from '{}' refused in role {:?}",
                    addr,
                    role
                );
                wire::write_success(&mut conn, false).await?;
                Ok(())
            }
        }
        OpType::MasterRejoin => {
            if role == Role::Promoted {
                replication::serve_master_rejoin(node, conn).await
            } else {
                pf_warn!(
                    "rejoin handshake from '{}' refused in role {:?}",
                    addr,
                    role
                );
                wire::write_success(&mut conn, false).await?;
                Ok(())
            }
        }
        op if op.is_data() || op == OpType::StateTransferRequest => {
            session::run_client_session(node, conn, op).await
        }
        op => {
            pf_warn!(
                "op {:?} from '{}' is not a valid session opener",
                op,
                addr
            );
            wire::write_success(&mut conn, false).await?;
            Ok(())
        }
    }
}
