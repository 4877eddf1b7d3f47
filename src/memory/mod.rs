//! Conversation history and long-term memory contract.

pub mod in_memory;
pub mod traits;

pub use in_memory::InMemoryMemory;
pub use traits::{Fact, MemoryProvider};
