//! Append-only operation log of committed mutations, with the replay
//! routine used by replication and state reconstruction.

use std::sync::Mutex;

use crate::server::clock::VectorClock;
use crate::server::store::{ClientId, Column, TaskId, TaskStore};
use crate::utils::TaskboardError;
use crate::wire::OpType;

/// Log entry ID type. Dense and monotonic from zero on the log that
/// originated the entry.
pub type EntryId = i32;

/// The wire format of log entries carries no board ID, so replicated
/// creates land on the default board.
const DEFAULT_BOARD: &str = "board-1";

/// One committed mutation. Immutable once appended.
#[derive(Debug, PartialEq, Clone)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub op_type: OpType,
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    pub created_by: String,
    pub column: Column,
    pub client_id: ClientId,
    /// Vector clock snapshot at commit time.
    pub timestamp: VectorClock,
}

impl LogEntry {
    /// Builds an entry awaiting ID assignment by `append_next`. Fields
    /// not meaningful for the op-code are left empty, as on the wire.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn draft(
        op_type: OpType,
        task_id: TaskId,
        title: &str,
        description: &str,
        created_by: &str,
        column: Column,
        client_id: ClientId,
        timestamp: VectorClock,
    ) -> Self {
        LogEntry {
            entry_id: -1,
            op_type,
            task_id,
            title: title.into(),
            description: description.into(),
            created_by: created_by.into(),
            column,
            client_id,
            timestamp,
        }
    }
}

/// The append-only operation log.
#[derive(Debug, Default)]
pub struct OperationLog {
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    next_entry_id: EntryId,
}

impl OperationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        OperationLog {
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// Appends an entry carrying its own ID (replication path), advancing
    /// the next-ID counter past it.
    pub fn append(&self, entry: LogEntry) -> Result<(), TaskboardError> {
        let mut inner = self.inner.lock()?;
        inner.next_entry_id = entry.entry_id + 1;
        inner.entries.push(entry);
        Ok(())
    }

    /// Assigns the next entry ID and appends in one step (local commit
    /// path). Returns the entry as appended.
    pub(crate) fn append_next(
        &self,
        mut entry: LogEntry,
    ) -> Result<LogEntry, TaskboardError> {
        let mut inner = self.inner.lock()?;
        entry.entry_id = inner.next_entry_id;
        inner.next_entry_id += 1;
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    /// Copy of the full log.
    pub fn snapshot(&self) -> Result<Vec<LogEntry>, TaskboardError> {
        Ok(self.inner.lock()?.entries.clone())
    }

    /// Entries with IDs strictly greater than `entry_id`.
    pub fn suffix_after(
        &self,
        entry_id: EntryId,
    ) -> Result<Vec<LogEntry>, TaskboardError> {
        Ok(self
            .inner
            .lock()?
            .entries
            .iter()
            .filter(|e| e.entry_id > entry_id)
            .cloned()
            .collect())
    }

    /// Replaces the whole log with a transferred one, adopting the
    /// sender's ID space: the next ID continues from the received tail.
    pub fn replace(
        &self,
        new_log: Vec<LogEntry>,
    ) -> Result<(), TaskboardError> {
        let mut inner = self.inner.lock()?;
        inner.next_entry_id =
            new_log.last().map(|e| e.entry_id + 1).unwrap_or(0);
        inner.entries = new_log;
        Ok(())
    }

    /// Drops all entries and resets the ID counter.
    pub fn clear(&self) -> Result<(), TaskboardError> {
        let mut inner = self.inner.lock()?;
        inner.entries.clear();
        inner.next_entry_id = 0;
        Ok(())
    }

    /// Next entry ID to be assigned.
    pub fn next_entry_id(&self) -> Result<EntryId, TaskboardError> {
        Ok(self.inner.lock()?.next_entry_id)
    }

    /// Overwrites the next entry ID. State transfer support.
    pub fn set_next_entry_id(&self, n: EntryId) -> Result<(), TaskboardError> {
        self.inner.lock()?.next_entry_id = n;
        Ok(())
    }

    /// Number of entries held.
    pub fn len(&self) -> Result<usize, TaskboardError> {
        Ok(self.inner.lock()?.entries.len())
    }

    /// True when no entry has been appended.
    pub fn is_empty(&self) -> Result<bool, TaskboardError> {
        Ok(self.inner.lock()?.entries.is_empty())
    }

    /// Applies a sequence of entries to a task store. This is state
    /// reconstruction, not conflict arbitration: outcomes are not
    /// reported back.
    pub fn replay(
        store: &TaskStore,
        entries: &[LogEntry],
    ) -> Result<(), TaskboardError> {
        for entry in entries {
            Self::apply(store, entry)?;
        }
        Ok(())
    }

    /// Applies one entry to a task store.
    pub(crate) fn apply(
        store: &TaskStore,
        entry: &LogEntry,
    ) -> Result<(), TaskboardError> {
        match entry.op_type {
            OpType::CreateTask => {
                let task_id = store.create(
                    &entry.title,
                    &entry.description,
                    DEFAULT_BOARD,
                    &entry.created_by,
                    entry.column,
                    entry.client_id,
                )?;
                if task_id != entry.task_id {
                    pf_warn!(
                        "replayed create allocated task {} but entry names {}",
                        task_id,
                        entry.task_id
                    );
                }
            }
            OpType::UpdateTask => {
                store.update(
                    entry.task_id,
                    &entry.title,
                    &entry.description,
                    &entry.timestamp,
                )?;
            }
            OpType::MoveTask => {
                store.move_to(entry.task_id, entry.column, &entry.timestamp)?;
            }
            OpType::DeleteTask => {
                store.delete(entry.task_id)?;
            }
            // board reads and control op-codes never mutate state
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::clock::ClientClocks;

    fn draft_create(title: &str, client: ClientId, vc: VectorClock) -> LogEntry {
        LogEntry::draft(
            OpType::CreateTask,
            -1,
            title,
            "desc",
            "alice",
            Column::Todo,
            client,
            vc,
        )
    }

    #[test]
    fn append_tracks_next_id() -> Result<(), TaskboardError> {
        let log = OperationLog::new();
        assert_eq!(log.next_entry_id()?, 0);

        let mut entry = draft_create("t", 1, VectorClock::new(1));
        entry.entry_id = 7;
        log.append(entry)?;
        assert_eq!(log.next_entry_id()?, 8);
        assert_eq!(log.len()?, 1);
        Ok(())
    }

    #[test]
    fn append_next_assigns_dense_ids() -> Result<(), TaskboardError> {
        let log = OperationLog::new();
        for expect in 0..3 {
            let entry =
                log.append_next(draft_create("t", 1, VectorClock::new(1)))?;
            assert_eq!(entry.entry_id, expect);
        }
        assert_eq!(log.next_entry_id()?, 3);
        Ok(())
    }

    #[test]
    fn suffix_after_returns_strict_suffix() -> Result<(), TaskboardError> {
        let log = OperationLog::new();
        for _ in 0..5 {
            log.append_next(draft_create("t", 1, VectorClock::new(1)))?;
        }
        let suffix = log.suffix_after(2)?;
        let ids: Vec<EntryId> = suffix.iter().map(|e| e.entry_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(log.suffix_after(4)?.is_empty());
        Ok(())
    }

    #[test]
    fn replace_adopts_id_space() -> Result<(), TaskboardError> {
        let source = OperationLog::new();
        for _ in 0..4 {
            source.append_next(draft_create("t", 1, VectorClock::new(1)))?;
        }

        let target = OperationLog::new();
        target.append_next(draft_create("own", 2, VectorClock::new(2)))?;
        target.replace(source.snapshot()?)?;

        assert_eq!(target.len()?, 4);
        assert_eq!(target.next_entry_id()?, 4);

        target.replace(vec![])?;
        assert_eq!(target.next_entry_id()?, 0);
        Ok(())
    }

    #[test]
    fn replay_rebuilds_store_state() -> Result<(), TaskboardError> {
        let store = TaskStore::new();
        let log = OperationLog::new();
        let clocks = ClientClocks::new();

        // create two tasks, update one, move one, delete the other
        for title in ["alpha", "beta"] {
            let vc = clocks.advance(1)?;
            let id =
                store.create(title, "d", "board-1", "alice", Column::Todo, 1)?;
            let mut entry = draft_create(title, 1, vc);
            entry.task_id = id;
            entry.description = "d".into();
            log.append_next(entry)?;
        }
        let vc = clocks.advance(1)?;
        store.update(0, "alpha", "rewritten", &vc)?;
        log.append_next(LogEntry::draft(
            OpType::UpdateTask,
            0,
            "alpha",
            "rewritten",
            "",
            Column::Todo,
            1,
            vc,
        ))?;
        let vc = clocks.advance(1)?;
        store.move_to(0, Column::Done, &vc)?;
        log.append_next(LogEntry::draft(
            OpType::MoveTask,
            0,
            "",
            "",
            "",
            Column::Done,
            1,
            vc,
        ))?;
        let vc = clocks.advance(1)?;
        store.delete(1)?;
        log.append_next(LogEntry::draft(
            OpType::DeleteTask,
            1,
            "",
            "",
            "",
            Column::Todo,
            1,
            vc,
        ))?;

        // replaying the snapshot into an empty store reproduces the tasks
        let rebuilt = TaskStore::new();
        OperationLog::replay(&rebuilt, &log.snapshot()?)?;

        assert_eq!(rebuilt.task_count()?, 1);
        assert!(rebuilt.get(1)?.is_none());
        let original = store.get(0)?.unwrap();
        let replayed = rebuilt.get(0)?.unwrap();
        assert_eq!(replayed.task_id, original.task_id);
        assert_eq!(replayed.title, original.title);
        assert_eq!(replayed.description, original.description);
        assert_eq!(replayed.column, original.column);
        assert_eq!(replayed.board_id, original.board_id);
        assert_eq!(rebuilt.id_counter()?, store.id_counter()?);
        Ok(())
    }

    #[test]
    fn replay_keeps_ids_dense_across_deletes() -> Result<(), TaskboardError> {
        let log = OperationLog::new();
        for (op, task_id) in [
            (OpType::CreateTask, 0),
            (OpType::CreateTask, 1),
            (OpType::DeleteTask, 0),
            (OpType::CreateTask, 2),
        ] {
            let mut entry = draft_create("t", 1, VectorClock::new(1));
            entry.op_type = op;
            entry.task_id = task_id;
            log.append_next(entry)?;
        }

        let store = TaskStore::new();
        OperationLog::replay(&store, &log.snapshot()?)?;
        assert_eq!(store.id_counter()?, 3);
        assert!(store.get(0)?.is_none());
        assert!(store.get(1)?.is_some());
        assert!(store.get(2)?.is_some());
        Ok(())
    }

    #[test]
    fn replay_skips_non_data_ops() -> Result<(), TaskboardError> {
        let mut entry = draft_create("t", 1, VectorClock::new(1));
        entry.op_type = OpType::GetBoard;
        let store = TaskStore::new();
        OperationLog::replay(&store, &[entry])?;
        assert_eq!(store.task_count()?, 0);
        Ok(())
    }
}
