pub mod config;
pub mod engine;
pub mod error;
pub mod hook;
pub mod log;
pub mod machine;
pub mod permission;
pub mod queue;
pub mod request;
pub mod sled_store;
pub mod store;
pub mod types;

pub use config::{EngineConfig, HookFailure};
pub use engine::ApprovalEngine;
pub use error::{MachineError, StoreError, TransitionError};
pub use permission::is_pending;
