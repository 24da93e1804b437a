//! Client session handling: one task per accepted client channel, each
//! carrying a sequence of request/response turns until the client closes.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::server::node::Node;
use crate::server::oplog::LogEntry;
use crate::server::store::{Column, OperationResponse};
use crate::utils::TaskboardError;
use crate::wire::{self, OpType};

/// Runs one client session. `first_op` was consumed by acceptor dispatch
/// and is handled before the read loop takes over.
pub(crate) async fn run_client_session(
    node: Arc<Node>,
    mut conn: TcpStream,
    first_op: OpType,
) -> Result<(), TaskboardError> {
    let peer = conn.peer_addr()?;
    pf_debug!("client session for '{}' started", peer);

    let mut pending = Some(first_op);
    loop {
        let op_type = match pending.take() {
            Some(op) => op,
            None => match wire::read_op_type(&mut conn).await? {
                Some(op) => op,
                None => break, // client closed cleanly
            },
        };

        match op_type {
            // board reads are served in every role, so a passive backup
            // still answers readers
            OpType::GetBoard => {
                handle_get_board(&node, &mut conn).await?;
            }
            OpType::StateTransferRequest
            | OpType::CreateTask
            | OpType::UpdateTask
            | OpType::MoveTask
            | OpType::DeleteTask => {
                if !node.role()?.serves_clients() {
                    pf_warn!(
                        "{:?} from '{}' refused while passive",
                        op_type,
                        peer
                    );
                    wire::write_success(&mut conn, false).await?;
                    break;
                }
                match op_type {
                    OpType::StateTransferRequest => {
                        serve_state_transfer(&node, &mut conn).await?
                    }
                    OpType::CreateTask => {
                        handle_create(&node, &mut conn).await?
                    }
                    OpType::UpdateTask => {
                        handle_update(&node, &mut conn).await?
                    }
                    OpType::MoveTask => handle_move(&node, &mut conn).await?,
                    _ => handle_delete(&node, &mut conn).await?,
                }
            }
            other => {
                // control op-codes have no business on a client channel
                pf_warn!(
                    "unexpected op {:?} on client channel '{}'",
                    other,
                    peer
                );
                wire::write_success(&mut conn, false).await?;
                break;
            }
        }
    }

    pf_debug!("client session for '{}' closed", peer);
    Ok(())
}

/// Serves a full state snapshot to a catching-up backup.
async fn serve_state_transfer(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let state = node.export_state()?;
    pf_info!(
        "state transfer serving {} tasks, {} log entries, id counter {}",
        state.tasks.len(),
        state.log.len(),
        state.id_counter
    );
    wire::write_state_transfer(conn, &state).await
}

async fn handle_create(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let task = wire::read_task(conn).await?;
    let vc = node.clocks.advance(task.client_id)?;

    let new_id = node.store.create(
        &task.title,
        &task.description,
        &task.board_id,
        &task.created_by,
        task.column,
        task.client_id,
    )?;

    let entry = LogEntry::draft(
        OpType::CreateTask,
        new_id,
        &task.title,
        &task.description,
        &task.created_by,
        task.column,
        task.client_id,
        vc,
    );
    node.commit_and_replicate(entry).await?;

    pf_info!("created task {} for client {}", new_id, task.client_id);
    wire::write_response(conn, &OperationResponse::applied(new_id, false))
        .await
}

async fn handle_update(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let task = wire::read_task(conn).await?;
    let vc = node.clocks.advance(task.client_id)?;

    let resp =
        node.store
            .update(task.task_id, &task.title, &task.description, &vc)?;
    if resp.success && !resp.rejected {
        let entry = LogEntry::draft(
            OpType::UpdateTask,
            task.task_id,
            &task.title,
            &task.description,
            "",
            Column::Todo,
            task.client_id,
            vc,
        );
        node.commit_and_replicate(entry).await?;
        if resp.conflict {
            pf_info!(
                "updated task {} with conflict resolution",
                task.task_id
            );
        } else {
            pf_info!("updated task {}", task.task_id);
        }
    }

    wire::write_response(conn, &resp).await
}

async fn handle_move(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let task = wire::read_task(conn).await?;
    let vc = node.clocks.advance(task.client_id)?;

    let resp = node.store.move_to(task.task_id, task.column, &vc)?;
    if resp.success && !resp.rejected {
        let entry = LogEntry::draft(
            OpType::MoveTask,
            task.task_id,
            "",
            "",
            "",
            task.column,
            task.client_id,
            vc,
        );
        node.commit_and_replicate(entry).await?;
        pf_info!(
            "moved task {} to column {:?}",
            task.task_id,
            task.column
        );
    }

    wire::write_response(conn, &resp).await
}

async fn handle_delete(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let task = wire::read_task(conn).await?;
    let vc = node.clocks.advance(task.client_id)?;

    let deleted = node.store.delete(task.task_id)?;
    if deleted {
        let entry = LogEntry::draft(
            OpType::DeleteTask,
            task.task_id,
            "",
            "",
            "",
            Column::Todo,
            task.client_id,
            vc,
        );
        node.commit_and_replicate(entry).await?;
        pf_info!("deleted task {}", task.task_id);
    }

    // deletes answer with a bare success flag, an old wire quirk kept
    // for compatibility
    wire::write_success(conn, deleted).await
}

async fn handle_get_board(
    node: &Node,
    conn: &mut TcpStream,
) -> Result<(), TaskboardError> {
    let _envelope = wire::read_task(conn).await?;
    let tasks = node.store.list_all()?;
    pf_debug!("board request returning {} tasks", tasks.len());
    wire::write_task_list(conn, &tasks).await
}
