mod memory_driver;
mod memory_store;

pub use memory_driver::{MemoryDriver, MemoryDriverStats};
pub use memory_store::MemoryStore;
