//! Framed reads and writes over live connections. Every helper either
//! transfers the exact requested byte count or fails the channel; short
//! reads and writes never escape this module.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::server::{LogEntry, OperationResponse, Task};
use crate::utils::TaskboardError;
use crate::wire::{
    marshal_log_entry, marshal_task, unmarshal_log_entry, unmarshal_task,
    OpType, StateTransfer, MAX_FRAME_BYTES,
};

/// Hard cap on list element counts in framed payloads.
const MAX_LIST_LEN: i32 = 1 << 20;

/// Reads the free-standing op-code opening a protocol turn. Returns
/// `Ok(None)` on a clean close at the turn boundary; a close in the
/// middle of the op-code is an error.
pub(crate) async fn read_op_type<C>(
    conn: &mut C,
) -> Result<Option<OpType>, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = conn.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TaskboardError::msg(
                "connection closed mid op-code",
            ));
        }
        filled += n;
    }
    Ok(Some(OpType::from_wire(i32::from_be_bytes(buf))?))
}

/// Writes a free-standing op-code.
pub(crate) async fn write_op_type<C>(
    conn: &mut C,
    op: OpType,
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    conn.write_all(&op.to_wire().to_be_bytes()).await?;
    Ok(())
}

async fn read_i32<C>(conn: &mut C) -> Result<i32, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await?;
    Ok(i32::from_be_bytes(buf))
}

async fn write_i32<C>(conn: &mut C, v: i32) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    conn.write_all(&v.to_be_bytes()).await?;
    Ok(())
}

/// Reads a bare success flag (i32, zero = false).
pub(crate) async fn read_success<C>(
    conn: &mut C,
) -> Result<bool, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    Ok(read_i32(conn).await? != 0)
}

/// Writes a bare success flag.
pub(crate) async fn write_success<C>(
    conn: &mut C,
    success: bool,
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_i32(conn, i32::from(success)).await?;
    conn.flush().await?;
    Ok(())
}

/// Reads one size-prefixed frame into an owned buffer.
async fn read_frame<C>(conn: &mut C) -> Result<Vec<u8>, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let size = read_i32(conn).await?;
    if size < 0 || size as usize > MAX_FRAME_BYTES {
        return Err(TaskboardError(format!("invalid frame size {}", size)));
    }
    let mut buf = vec![0u8; size as usize];
    conn.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one size-prefixed frame.
async fn write_frame<C>(
    conn: &mut C,
    bytes: &[u8],
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_i32(conn, i32::try_from(bytes.len())?).await?;
    conn.write_all(bytes).await?;
    Ok(())
}

/// Reads a size-prefixed task.
pub(crate) async fn read_task<C>(conn: &mut C) -> Result<Task, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    unmarshal_task(&read_frame(conn).await?)
}

/// Writes a size-prefixed task.
pub(crate) async fn write_task<C>(
    conn: &mut C,
    task: &Task,
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_frame(conn, &marshal_task(task)?).await?;
    conn.flush().await?;
    Ok(())
}

/// Reads a size-prefixed log entry.
pub(crate) async fn read_log_entry<C>(
    conn: &mut C,
) -> Result<LogEntry, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    unmarshal_log_entry(&read_frame(conn).await?)
}

/// Writes a size-prefixed log entry.
pub(crate) async fn write_log_entry<C>(
    conn: &mut C,
    entry: &LogEntry,
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_frame(conn, &marshal_log_entry(entry)?).await?;
    conn.flush().await?;
    Ok(())
}

/// Reads a task list: count, then each task size-prefixed.
pub(crate) async fn read_task_list<C>(
    conn: &mut C,
) -> Result<Vec<Task>, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let count = read_i32(conn).await?;
    if count < 0 || count > MAX_LIST_LEN {
        return Err(TaskboardError(format!("invalid list count {}", count)));
    }
    let mut tasks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tasks.push(read_task(conn).await?);
    }
    Ok(tasks)
}

/// Writes a task list.
pub(crate) async fn write_task_list<C>(
    conn: &mut C,
    tasks: &[Task],
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_i32(conn, i32::try_from(tasks.len())?).await?;
    for task in tasks {
        write_frame(conn, &marshal_task(task)?).await?;
    }
    conn.flush().await?;
    Ok(())
}

async fn read_entry_list<C>(
    conn: &mut C,
) -> Result<Vec<LogEntry>, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let count = read_i32(conn).await?;
    if count < 0 || count > MAX_LIST_LEN {
        return Err(TaskboardError(format!("invalid list count {}", count)));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(read_log_entry(conn).await?);
    }
    Ok(entries)
}

async fn write_entry_list<C>(
    conn: &mut C,
    entries: &[LogEntry],
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_i32(conn, i32::try_from(entries.len())?).await?;
    for entry in entries {
        write_frame(conn, &marshal_log_entry(entry)?).await?;
    }
    Ok(())
}

/// Reads an operation response: four consecutive i32 (success, conflict,
/// rejected, updated_task_id), no outer framing.
pub(crate) async fn read_response<C>(
    conn: &mut C,
) -> Result<OperationResponse, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let mut buf = [0u8; 16];
    conn.read_exact(&mut buf).await?;
    let word = |i: usize| {
        i32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
    };
    Ok(OperationResponse {
        success: word(0) != 0,
        conflict: word(4) != 0,
        rejected: word(8) != 0,
        updated_task_id: word(12),
    })
}

/// Writes an operation response.
pub(crate) async fn write_response<C>(
    conn: &mut C,
    resp: &OperationResponse,
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&i32::from(resp.success).to_be_bytes());
    buf[4..8].copy_from_slice(&i32::from(resp.conflict).to_be_bytes());
    buf[8..12].copy_from_slice(&i32::from(resp.rejected).to_be_bytes());
    buf[12..16].copy_from_slice(&resp.updated_task_id.to_be_bytes());
    conn.write_all(&buf).await?;
    conn.flush().await?;
    Ok(())
}

/// Reads a state transfer blob: id_counter, task list, log entry list.
pub(crate) async fn read_state_transfer<C>(
    conn: &mut C,
) -> Result<StateTransfer, TaskboardError>
where
    C: AsyncRead + Unpin,
{
    let id_counter = read_i32(conn).await?;
    let tasks = read_task_list(conn).await?;
    let log = read_entry_list(conn).await?;
    Ok(StateTransfer {
        id_counter,
        tasks,
        log,
    })
}

/// Writes a state transfer blob.
pub(crate) async fn write_state_transfer<C>(
    conn: &mut C,
    state: &StateTransfer,
) -> Result<(), TaskboardError>
where
    C: AsyncWrite + Unpin,
{
    write_i32(conn, state.id_counter).await?;
    write_i32(conn, i32::try_from(state.tasks.len())?).await?;
    for task in &state.tasks {
        write_frame(conn, &marshal_task(task)?).await?;
    }
    write_entry_list(conn, &state.log).await?;
    conn.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Column, VectorClock};

    #[tokio::test]
    async fn op_type_round_trip_and_clean_eof() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_op_type(&mut a, OpType::GetBoard).await?;
        assert_eq!(read_op_type(&mut b).await?, Some(OpType::GetBoard));

        drop(a); // clean close at turn boundary
        assert_eq!(read_op_type(&mut b).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn partial_op_code_is_an_error() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0, 0]).await?;
        drop(a);
        assert!(read_op_type(&mut b).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn success_flag_round_trip() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_success(&mut a, true).await?;
        write_success(&mut a, false).await?;
        assert!(read_success(&mut b).await?);
        assert!(!read_success(&mut b).await?);
        Ok(())
    }

    #[tokio::test]
    async fn response_round_trip() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(64);
        let resp = OperationResponse {
            success: true,
            conflict: true,
            rejected: false,
            updated_task_id: 31,
        };
        write_response(&mut a, &resp).await?;
        assert_eq!(read_response(&mut b).await?, resp);
        Ok(())
    }

    #[tokio::test]
    async fn task_list_round_trip() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let tasks = vec![
            Task::new("one", "d1", "board-1", "alice", Column::Todo, 1),
            Task::new("two", "d2", "board-1", "bob", Column::Done, 2),
        ];
        write_task_list(&mut a, &tasks).await?;
        assert_eq!(read_task_list(&mut b).await?, tasks);

        write_task_list(&mut a, &[]).await?;
        assert!(read_task_list(&mut b).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn state_transfer_round_trip() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let state = StateTransfer {
            id_counter: 2,
            tasks: vec![Task::new(
                "one", "d", "board-1", "alice", Column::Todo, 1,
            )],
            log: vec![LogEntry {
                entry_id: 0,
                op_type: OpType::CreateTask,
                task_id: 0,
                title: "one".into(),
                description: "d".into(),
                created_by: "alice".into(),
                column: Column::Todo,
                client_id: 1,
                timestamp: VectorClock::new(1),
            }],
        };
        write_state_transfer(&mut a, &state).await?;
        assert_eq!(read_state_transfer(&mut b).await?, state);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(64);
        // announce a 64-byte frame but deliver only 3 bytes
        a.write_all(&64i32.to_be_bytes()).await?;
        a.write_all(&[1, 2, 3]).await?;
        drop(a);
        assert!(read_task(&mut b).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn negative_frame_size_is_an_error() -> Result<(), TaskboardError> {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(-1i32).to_be_bytes()).await?;
        assert!(read_task(&mut b).await.is_err());
        Ok(())
    }
}
