//! In-memory task store with vector-clock conflict detection.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::server::clock::{ClockOrdering, ProcessId, VectorClock};
use crate::utils::TaskboardError;

/// Task ID type. Server-assigned, dense from zero, never reused.
pub type TaskId = i32;

/// Client ID type, as stamped into request envelopes by clients.
pub type ClientId = ProcessId;

/// Board column a task sits in. Values are stable on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Column {
    Todo = 0,
    InProgress = 1,
    Done = 2,
}

impl Column {
    /// Decodes a wire integer into a column.
    pub(crate) fn from_wire(v: i32) -> Result<Self, TaskboardError> {
        match v {
            0 => Ok(Column::Todo),
            1 => Ok(Column::InProgress),
            2 => Ok(Column::Done),
            _ => Err(TaskboardError(format!("invalid column value {}", v))),
        }
    }

    /// Wire integer of this column.
    pub(crate) fn to_wire(self) -> i32 {
        self as i32
    }
}

/// One task on the board.
#[derive(Debug, PartialEq, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    pub board_id: String,
    pub created_by: String,
    pub column: Column,
    pub client_id: ClientId,
    /// Milliseconds since epoch.
    pub created_at: i64,
    /// Milliseconds since epoch; never precedes `created_at`.
    pub updated_at: i64,
    pub clock: VectorClock,
}

impl Task {
    /// Builds an unsaved task envelope; the serving node assigns the real
    /// `task_id` and timestamps at creation time.
    pub fn new(
        title: &str,
        description: &str,
        board_id: &str,
        created_by: &str,
        column: Column,
        client_id: ClientId,
    ) -> Self {
        Task {
            task_id: -1,
            title: title.into(),
            description: description.into(),
            board_id: board_id.into(),
            created_by: created_by.into(),
            column,
            client_id,
            created_at: 0,
            updated_at: 0,
            clock: VectorClock::new(client_id),
        }
    }
}

/// Outcome of a store mutation, echoed back to the client.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct OperationResponse {
    /// True if the operation had observable effect.
    pub success: bool,

    /// True when concurrent writes were detected and last-write-wins
    /// resolution was applied.
    pub conflict: bool,

    /// True when the operation carried a clock strictly older than the
    /// stored one and was discarded.
    pub rejected: bool,

    /// Task the operation touched; the server-assigned ID for creates,
    /// -1 on failure.
    pub updated_task_id: TaskId,
}

impl OperationResponse {
    /// Response for an applied mutation.
    pub(crate) fn applied(task_id: TaskId, conflict: bool) -> Self {
        OperationResponse {
            success: true,
            conflict,
            rejected: false,
            updated_task_id: task_id,
        }
    }

    /// Response for a mutation rejected by clock comparison.
    pub(crate) fn stale() -> Self {
        OperationResponse {
            success: false,
            conflict: false,
            rejected: true,
            updated_task_id: -1,
        }
    }

    /// Response for a mutation that found nothing to act on.
    pub(crate) fn failure() -> Self {
        OperationResponse {
            success: false,
            conflict: false,
            rejected: false,
            updated_task_id: -1,
        }
    }
}

/// Current wall-clock time in milliseconds since epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The in-memory authoritative task map. One lock covers the map, the id
/// counter, and every compare-apply-merge sequence.
#[derive(Debug, Default)]
pub struct TaskStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tasks: BTreeMap<TaskId, Task>,
    id_counter: TaskId,
}

impl TaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        TaskStore {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Creates a task, allocating the next dense task ID. The new task's
    /// clock is fresh and owned by the creating client. Always succeeds.
    pub fn create(
        &self,
        title: &str,
        description: &str,
        board_id: &str,
        created_by: &str,
        column: Column,
        client_id: ClientId,
    ) -> Result<TaskId, TaskboardError> {
        let mut inner = self.inner.lock()?;
        let task_id = inner.id_counter;
        inner.id_counter += 1;

        let now = now_millis();
        let mut task =
            Task::new(title, description, board_id, created_by, column, client_id);
        task.task_id = task_id;
        task.created_at = now;
        task.updated_at = now;
        inner.tasks.insert(task_id, task);

        Ok(task_id)
    }

    /// Rewrites a task's title and description if the incoming clock
    /// permits it. Concurrent clocks apply under last-write-wins and are
    /// flagged; strictly older clocks are rejected. On apply, the stored
    /// clock absorbs the incoming one.
    pub fn update(
        &self,
        task_id: TaskId,
        title: &str,
        description: &str,
        incoming: &VectorClock,
    ) -> Result<OperationResponse, TaskboardError> {
        let mut inner = self.inner.lock()?;
        let task = match inner.tasks.get_mut(&task_id) {
            Some(task) => task,
            None => return Ok(OperationResponse::failure()),
        };

        match task.clock.compare(incoming) {
            ClockOrdering::Greater => Ok(OperationResponse::stale()),
            ordering => {
                task.title = title.into();
                task.description = description.into();
                task.clock.merge(incoming);
                task.updated_at = now_millis().max(task.created_at);
                Ok(OperationResponse::applied(
                    task_id,
                    ordering == ClockOrdering::Concurrent,
                ))
            }
        }
    }

    /// Moves a task to a column under the same clock rules as `update`.
    /// Moving to the column the task already sits in succeeds without
    /// touching the clock.
    pub fn move_to(
        &self,
        task_id: TaskId,
        column: Column,
        incoming: &VectorClock,
    ) -> Result<OperationResponse, TaskboardError> {
        let mut inner = self.inner.lock()?;
        let task = match inner.tasks.get_mut(&task_id) {
            Some(task) => task,
            None => return Ok(OperationResponse::failure()),
        };

        if task.column == column {
            return Ok(OperationResponse::applied(task_id, false));
        }

        match task.clock.compare(incoming) {
            ClockOrdering::Greater => Ok(OperationResponse::stale()),
            ordering => {
                task.column = column;
                task.clock.merge(incoming);
                task.updated_at = now_millis().max(task.created_at);
                Ok(OperationResponse::applied(
                    task_id,
                    ordering == ClockOrdering::Concurrent,
                ))
            }
        }
    }

    /// Removes a task. Returns false when it does not exist.
    pub fn delete(&self, task_id: TaskId) -> Result<bool, TaskboardError> {
        Ok(self.inner.lock()?.tasks.remove(&task_id).is_some())
    }

    /// Looks up one task by ID.
    pub fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskboardError> {
        Ok(self.inner.lock()?.tasks.get(&task_id).cloned())
    }

    /// Snapshot of all tasks in ascending `task_id` order.
    pub fn list_all(&self) -> Result<Vec<Task>, TaskboardError> {
        Ok(self.inner.lock()?.tasks.values().cloned().collect())
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> Result<usize, TaskboardError> {
        Ok(self.inner.lock()?.tasks.len())
    }

    /// Drops every task. State transfer installation only.
    pub fn clear_all(&self) -> Result<(), TaskboardError> {
        self.inner.lock()?.tasks.clear();
        Ok(())
    }

    /// Inserts a task as-is, without allocating an ID. State transfer
    /// installation only.
    pub fn add_direct(&self, task: Task) -> Result<(), TaskboardError> {
        self.inner.lock()?.tasks.insert(task.task_id, task);
        Ok(())
    }

    /// Overwrites the ID allocation counter. State transfer installation
    /// only.
    pub fn set_id_counter(&self, n: TaskId) -> Result<(), TaskboardError> {
        self.inner.lock()?.id_counter = n;
        Ok(())
    }

    /// Current ID allocation counter.
    pub fn id_counter(&self) -> Result<TaskId, TaskboardError> {
        Ok(self.inner.lock()?.id_counter)
    }
}
