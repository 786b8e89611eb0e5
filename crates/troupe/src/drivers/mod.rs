pub mod memory;

pub use memory::{AlarmCall, MemoryActorDriver, MemoryManagerDriver};
