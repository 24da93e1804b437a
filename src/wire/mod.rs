//! Length-framed big-endian wire protocol shared by client traffic and
//! replication traffic.
//!
//! - `marshal`: byte-level encodings of the data model types.
//! - `stream`: framed reads/writes over live connections with the
//!   full-read/full-write guarantee.

mod marshal;
mod stream;

use crate::server::{LogEntry, Task, TaskId};
use crate::utils::TaskboardError;

pub(crate) use marshal::{
    marshal_log_entry, marshal_task, unmarshal_log_entry, unmarshal_task,
    MAX_FRAME_BYTES,
};
pub(crate) use stream::{
    read_log_entry, read_op_type, read_response, read_state_transfer,
    read_success, read_task, read_task_list, write_log_entry, write_op_type,
    write_response, write_state_transfer, write_success, write_task,
    write_task_list,
};

/// Protocol op-code, the free-standing first element of every exchange.
/// Wire values are stable.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpType {
    CreateTask = 0,
    UpdateTask = 1,
    MoveTask = 2,
    DeleteTask = 3,
    GetBoard = 4,
    HeartbeatPing = 5,
    HeartbeatAck = 6,
    MasterRejoin = 7,
    StateTransferRequest = 8,
    StateTransferResponse = 9,
    DemoteAck = 10,
    ReplicationInit = 11,
}

impl OpType {
    /// Decodes a wire integer into an op-code.
    pub(crate) fn from_wire(v: i32) -> Result<Self, TaskboardError> {
        match v {
            0 => Ok(OpType::CreateTask),
            1 => Ok(OpType::UpdateTask),
            2 => Ok(OpType::MoveTask),
            3 => Ok(OpType::DeleteTask),
            4 => Ok(OpType::GetBoard),
            5 => Ok(OpType::HeartbeatPing),
            6 => Ok(OpType::HeartbeatAck),
            7 => Ok(OpType::MasterRejoin),
            8 => Ok(OpType::StateTransferRequest),
            9 => Ok(OpType::StateTransferResponse),
            10 => Ok(OpType::DemoteAck),
            11 => Ok(OpType::ReplicationInit),
            _ => Err(TaskboardError(format!("invalid op-code value {}", v))),
        }
    }

    /// Wire integer of this op-code.
    pub(crate) fn to_wire(self) -> i32 {
        self as i32
    }

    /// True for the op-codes that open a client session turn (board reads
    /// included).
    pub(crate) fn is_data(self) -> bool {
        matches!(
            self,
            OpType::CreateTask
                | OpType::UpdateTask
                | OpType::MoveTask
                | OpType::DeleteTask
                | OpType::GetBoard
        )
    }
}

/// State transfer blob exchanged during catchup and rejoin.
#[derive(Debug, PartialEq, Clone)]
pub struct StateTransfer {
    /// Task ID allocation counter of the sending node.
    pub id_counter: TaskId,

    /// Full task snapshot, ascending `task_id`.
    pub tasks: Vec<Task>,

    /// Full operation log snapshot.
    pub log: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_type_wire_values_are_stable() -> Result<(), TaskboardError> {
        for (value, op) in [
            (0, OpType::CreateTask),
            (4, OpType::GetBoard),
            (7, OpType::MasterRejoin),
            (11, OpType::ReplicationInit),
        ] {
            assert_eq!(OpType::from_wire(value)?, op);
            assert_eq!(op.to_wire(), value);
        }
        assert!(OpType::from_wire(12).is_err());
        assert!(OpType::from_wire(-1).is_err());
        Ok(())
    }

    #[test]
    fn data_ops_include_board_reads() {
        assert!(OpType::GetBoard.is_data());
        assert!(OpType::DeleteTask.is_data());
        assert!(!OpType::HeartbeatPing.is_data());
        assert!(!OpType::ReplicationInit.is_data());
    }
}
