pub mod coordinator;
pub mod matcher;
pub mod queue;
pub mod retry;
pub mod timer;
