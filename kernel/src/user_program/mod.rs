pub mod process;

pub use process::{MapId, Pid, Process};
