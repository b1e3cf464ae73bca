pub mod log;
pub mod machine;

pub use log::{LogEntry, ReplicatedLog};
pub use machine::ScooterStateMachine;
