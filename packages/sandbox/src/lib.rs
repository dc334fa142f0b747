// ABOUTME: Execution sandbox management for Scribble collaboration rooms
// ABOUTME: One isolated container per room with stateful/stateless execution and idle reclamation

pub mod agent;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod settings;
pub mod types;

// Re-export commonly used types
pub use agent::{AgentClient, AgentReply};
pub use error::{Result, SandboxError};
pub use executor::StatelessExecutor;
pub use lifecycle::SandboxManager;
pub use reaper::{IdleReaper, ReaperHandle};
pub use registry::Registry;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
pub use service::SandboxService;
pub use settings::SandboxSettings;
pub use types::{ContainerState, ExecOutput, ExecutionResult, SandboxHandle, SandboxMode};
