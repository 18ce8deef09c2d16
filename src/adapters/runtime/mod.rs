//! Runtime providers: local worktree + child process, gateway sessions,
//! and a scriptable mock.

pub mod gateway;
pub mod local;
pub mod mock;

pub use gateway::GatewayRuntime;
pub use local::LocalProcessRuntime;
pub use mock::{MockFailure, MockRuntime, MockSendResult};
