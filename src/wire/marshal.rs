//! Byte-level marshalling of the data model types. All integers are
//! big-endian; strings are (len:i32, UTF-8 bytes); vector clocks are
//! (count:i32, count x (pid:i32, value:i32)).

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::server::{Column, LogEntry, ProcessId, Task, VectorClock};
use crate::utils::TaskboardError;
use crate::wire::OpType;

/// Hard cap on any single framed payload, strings and lists included.
pub(crate) const MAX_FRAME_BYTES: usize = 16 << 20;

fn get_i32(buf: &mut &[u8]) -> Result<i32, TaskboardError> {
    if buf.remaining() < 4 {
        return Err(TaskboardError::msg("truncated payload reading i32"));
    }
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, TaskboardError> {
    if buf.remaining() < 8 {
        return Err(TaskboardError::msg("truncated payload reading i64"));
    }
    Ok(buf.get_i64())
}

fn get_string(buf: &mut &[u8]) -> Result<String, TaskboardError> {
    let len = get_i32(buf)?;
    if len < 0 || len as usize > MAX_FRAME_BYTES {
        return Err(TaskboardError(format!(
            "invalid string length {} in payload",
            len
        )));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(TaskboardError::msg("truncated payload reading string"));
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), TaskboardError> {
    buf.put_i32(i32::try_from(s.len())?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_clock(
    buf: &mut &[u8],
    owner: ProcessId,
) -> Result<VectorClock, TaskboardError> {
    let count = get_i32(buf)?;
    if count < 0 || count as usize > MAX_FRAME_BYTES / 8 {
        return Err(TaskboardError(format!(
            "invalid clock entry count {} in payload",
            count
        )));
    }
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let pid = get_i32(buf)?;
        let value = get_i32(buf)?;
        entries.insert(pid, value);
    }
    Ok(VectorClock::from_entries(owner, entries))
}

fn put_clock(buf: &mut BytesMut, clock: &VectorClock) -> Result<(), TaskboardError> {
    buf.put_i32(i32::try_from(clock.entries().len())?);
    for (&pid, &value) in clock.entries() {
        buf.put_i32(pid);
        buf.put_i32(value);
    }
    Ok(())
}

/// Encodes a task: task_id, title, description, board_id, created_by,
/// column, client_id, created_at, updated_at, clock.
pub(crate) fn marshal_task(task: &Task) -> Result<Vec<u8>, TaskboardError> {
    let mut buf = BytesMut::new();
    buf.put_i32(task.task_id);
    put_string(&mut buf, &task.title)?;
    put_string(&mut buf, &task.description)?;
    put_string(&mut buf, &task.board_id)?;
    put_string(&mut buf, &task.created_by)?;
    buf.put_i32(task.column.to_wire());
    buf.put_i32(task.client_id);
    buf.put_i64(task.created_at);
    buf.put_i64(task.updated_at);
    put_clock(&mut buf, &task.clock)?;
    Ok(buf.to_vec())
}

/// Decodes a task. The clock's owner is not a wire field; it is restored
/// as the task's originating client.
pub(crate) fn unmarshal_task(mut buf: &[u8]) -> Result<Task, TaskboardError> {
    let buf = &mut buf;
    let task_id = get_i32(buf)?;
    let title = get_string(buf)?;
    let description = get_string(buf)?;
    let board_id = get_string(buf)?;
    let created_by = get_string(buf)?;
    let column = Column::from_wire(get_i32(buf)?)?;
    let client_id = get_i32(buf)?;
    let created_at = get_i64(buf)?;
    let updated_at = get_i64(buf)?;
    let clock = get_clock(buf, client_id)?;
    Ok(Task {
        task_id,
        title,
        description,
        board_id,
        created_by,
        column,
        client_id,
        created_at,
        updated_at,
        clock,
    })
}

/// Encodes a log entry: entry_id, op_type, task_id, title, description,
/// created_by, column, client_id, timestamp. Unlike tasks, the clock
/// rides at the end.
pub(crate) fn marshal_log_entry(
    entry: &LogEntry,
) -> Result<Vec<u8>, TaskboardError> {
    let mut buf = BytesMut::new();
    buf.put_i32(entry.entry_id);
    buf.put_i32(entry.op_type.to_wire());
    buf.put_i32(entry.task_id);
    put_string(&mut buf, &entry.title)?;
    put_string(&mut buf, &entry.description)?;
    put_string(&mut buf, &entry.created_by)?;
    buf.put_i32(entry.column.to_wire());
    buf.put_i32(entry.client_id);
    put_clock(&mut buf, &entry.timestamp)?;
    Ok(buf.to_vec())
}

/// Decodes a log entry. The timestamp clock's owner is restored as the
/// entry's originating client.
pub(crate) fn unmarshal_log_entry(
    mut buf: &[u8],
) -> Result<LogEntry, TaskboardError> {
    let buf = &mut buf;
    let entry_id = get_i32(buf)?;
    let op_type = OpType::from_wire(get_i32(buf)?)?;
    let task_id = get_i32(buf)?;
    let title = get_string(buf)?;
    let description = get_string(buf)?;
    let created_by = get_string(buf)?;
    let column = Column::from_wire(get_i32(buf)?)?;
    let client_id = get_i32(buf)?;
    let timestamp = get_clock(buf, client_id)?;
    Ok(LogEntry {
        entry_id,
        op_type,
        task_id,
        title,
        description,
        created_by,
        column,
        client_id,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ClockOrdering;

    fn sample_task() -> Task {
        let mut clock = VectorClock::new(42);
        clock.increment();
        clock.merge(&VectorClock::new(7));
        Task {
            task_id: 3,
            title: "write report".into(),
            description: "quarterly numbers".into(),
            board_id: "board-1".into(),
            created_by: "alice".into(),
            column: Column::InProgress,
            client_id: 42,
            created_at: 1_700_000_000_123,
            updated_at: 1_700_000_000_456,
            clock,
        }
    }

    #[test]
    fn task_round_trip() -> Result<(), TaskboardError> {
        let task = sample_task();
        let decoded = unmarshal_task(&marshal_task(&task)?)?;
        assert_eq!(decoded, task);
        Ok(())
    }

    #[test]
    fn task_round_trip_empty_strings() -> Result<(), TaskboardError> {
        let task = Task::new("", "", "", "", Column::Todo, 0);
        let decoded = unmarshal_task(&marshal_task(&task)?)?;
        assert_eq!(decoded, task);
        Ok(())
    }

    #[test]
    fn task_round_trip_unicode() -> Result<(), TaskboardError> {
        let task = Task::new(
            "renovée ğ",
            "日本語の説明",
            "планка",
            "bob✓",
            Column::Done,
            5,
        );
        let decoded = unmarshal_task(&marshal_task(&task)?)?;
        assert_eq!(decoded.title, "renovée ğ");
        assert_eq!(decoded.description, "日本語の説明");
        assert_eq!(decoded.board_id, "планка");
        assert_eq!(decoded.created_by, "bob✓");
        Ok(())
    }

    #[test]
    fn task_round_trip_extreme_ids() -> Result<(), TaskboardError> {
        let mut task = Task::new("t", "d", "b", "c", Column::Todo, i32::MAX);
        task.task_id = i32::MAX;
        task.clock = VectorClock::new(i32::MAX);
        let decoded = unmarshal_task(&marshal_task(&task)?)?;
        assert_eq!(decoded.task_id, i32::MAX);
        assert_eq!(decoded.client_id, i32::MAX);
        assert_eq!(decoded, task);
        Ok(())
    }

    #[test]
    fn log_entry_round_trip() -> Result<(), TaskboardError> {
        let mut timestamp = VectorClock::new(9);
        timestamp.increment();
        timestamp.increment();
        let entry = LogEntry {
            entry_id: 17,
            op_type: OpType::MoveTask,
            task_id: 4,
            title: String::new(),
            description: String::new(),
            created_by: String::new(),
            column: Column::Done,
            client_id: 9,
            timestamp,
        };
        let decoded = unmarshal_log_entry(&marshal_log_entry(&entry)?)?;
        assert_eq!(decoded, entry);
        Ok(())
    }

    #[test]
    fn clock_entries_survive_round_trip() -> Result<(), TaskboardError> {
        let mut task = sample_task();
        task.clock = VectorClock::from_entries(
            42,
            [(1, 5), (42, 2), (100, 7)].into_iter().collect(),
        );
        let decoded = unmarshal_task(&marshal_task(&task)?)?;
        assert_eq!(decoded.clock.get(1), 5);
        assert_eq!(decoded.clock.get(42), 2);
        assert_eq!(decoded.clock.get(100), 7);
        assert_eq!(decoded.clock.compare(&task.clock), ClockOrdering::Equal);
        Ok(())
    }

    #[test]
    fn truncated_task_is_rejected() -> Result<(), TaskboardError> {
        let bytes = marshal_task(&sample_task())?;
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(unmarshal_task(&bytes[..cut]).is_err());
        }
        Ok(())
    }

    #[test]
    fn out_of_range_column_is_rejected() -> Result<(), TaskboardError> {
        let task = sample_task();
        let mut bytes = marshal_task(&task)?;
        // column rides right after the four strings
        let column_off = 4
            + (4 + task.title.len())
            + (4 + task.description.len())
            + (4 + task.board_id.len())
            + (4 + task.created_by.len());
        bytes[column_off..column_off + 4]
            .copy_from_slice(&99i32.to_be_bytes());
        assert!(unmarshal_task(&bytes).is_err());
        Ok(())
    }

    #[test]
    fn negative_string_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_be_bytes()); // task_id
        bytes.extend_from_slice(&(-5i32).to_be_bytes()); // title length
        assert!(unmarshal_task(&bytes).is_err());
    }

    #[test]
    fn oversized_string_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_be_bytes()); // task_id
        bytes.extend_from_slice(&(i32::MAX).to_be_bytes()); // title length
        assert!(unmarshal_task(&bytes).is_err());
    }
}
