//! Public interface to the task board core library, linked by the server
//! executables and by gateway/test clients.

#[macro_use]
mod utils;

mod client;
mod server;
mod wire;

pub use client::BoardClient;
pub use server::{
    ClientId, ClockOrdering, Column, EntryId, LogEntry, Node, NodeConfig,
    OperationLog, OperationResponse, ProcessId, Role, Task, TaskId,
    TaskStore, VectorClock,
};
pub use utils::TaskboardError;
pub use wire::{OpType, StateTransfer};
