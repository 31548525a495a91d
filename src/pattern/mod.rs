pub mod buffer;
pub mod machine;

pub use buffer::PatternBuffer;
pub use machine::{Direction, IoTask, PatternMachine, ProtocolViolation, Verdict};
