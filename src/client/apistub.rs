//! Board client API stub: frames the data operations a gateway issues
//! and decodes the serving node's responses.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::server::{ClientId, Column, OperationResponse, Task, TaskId};
use crate::utils::TaskboardError;
use crate::wire::{self, OpType};

/// Client connection handle to a serving node. Requests and responses
/// alternate strictly on the one channel.
pub struct BoardClient {
    /// My client ID, stamped into every request envelope.
    id: ClientId,

    /// The connection to the serving node.
    conn: TcpStream,
}

impl BoardClient {
    /// Connects to the given serving node address.
    pub async fn connect(
        id: ClientId,
        addr: SocketAddr,
    ) -> Result<Self, TaskboardError> {
        pf_debug!("client {} connecting to '{}'...", id, addr);
        let conn = TcpStream::connect(addr).await?;
        conn.set_nodelay(true)?;
        Ok(BoardClient { id, conn })
    }

    /// My client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Creates a task on the board. The response carries the
    /// server-assigned task ID.
    pub async fn create_task(
        &mut self,
        title: &str,
        description: &str,
        board_id: &str,
        created_by: &str,
        column: Column,
    ) -> Result<OperationResponse, TaskboardError> {
        let task =
            Task::new(title, description, board_id, created_by, column, self.id);
        self.send_request(OpType::CreateTask, &task).await?;
        wire::read_response(&mut self.conn).await
    }

    /// Rewrites a task's title and description.
    pub async fn update_task(
        &mut self,
        task_id: TaskId,
        title: &str,
        description: &str,
    ) -> Result<OperationResponse, TaskboardError> {
        let mut task =
            Task::new(title, description, "", "", Column::Todo, self.id);
        task.task_id = task_id;
        self.send_request(OpType::UpdateTask, &task).await?;
        wire::read_response(&mut self.conn).await
    }

    /// Moves a task to another column.
    pub async fn move_task(
        &mut self,
        task_id: TaskId,
        column: Column,
    ) -> Result<OperationResponse, TaskboardError> {
        let mut task = Task::new("", "", "", "", column, self.id);
        task.task_id = task_id;
        self.send_request(OpType::MoveTask, &task).await?;
        wire::read_response(&mut self.conn).await
    }

    /// Deletes a task. Answers with a bare success flag (old wire quirk).
    pub async fn delete_task(
        &mut self,
        task_id: TaskId,
    ) -> Result<bool, TaskboardError> {
        let mut task = Task::new("", "", "", "", Column::Todo, self.id);
        task.task_id = task_id;
        self.send_request(OpType::DeleteTask, &task).await?;
        wire::read_success(&mut self.conn).await
    }

    /// Fetches the whole board, tasks in ascending ID order.
    pub async fn get_board(&mut self) -> Result<Vec<Task>, TaskboardError> {
        let envelope = Task::new("", "", "", "", Column::Todo, self.id);
        self.send_request(OpType::GetBoard, &envelope).await?;
        wire::read_task_list(&mut self.conn).await
    }

    /// One request half of a turn: op-code, then the task envelope.
    async fn send_request(
        &mut self,
        op: OpType,
        task: &Task,
    ) -> Result<(), TaskboardError> {
        wire::write_op_type(&mut self.conn, op).await?;
        wire::write_task(&mut self.conn, task).await
    }
}
