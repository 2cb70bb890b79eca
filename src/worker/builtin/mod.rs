//! Built-in worker implementations.

pub mod command;
pub mod heartbeat;

pub use command::CommandWorker;
pub use heartbeat::HeartbeatWorker;
