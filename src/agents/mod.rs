//! Stateful agents: declarations, live sessions, registry and pool.

pub mod definition;
pub mod fields;
pub mod pool;
pub mod registry;
pub mod session;
pub mod store;

pub use definition::{AgentBuilder, AgentDefinition};
pub use fields::{FieldType, InputField};
pub use pool::{AgentPool, PoolEntry, PooledAgent};
pub use registry::{schema_version, synthesize_tool_info, AgentRegistry, AgentSpec, FieldSpec};
pub use session::{AgentResult, AgentSession, AgentStatus};
pub use store::{MemoryPoolStore, PoolStore, SqlitePoolStore};
