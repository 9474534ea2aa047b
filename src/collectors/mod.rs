/// Remote service log follower
pub mod log_stream;

pub use log_stream::{follow_command, FailureSink, LogStreamReader};
