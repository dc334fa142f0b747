// ABOUTME: Error types for sandbox lifecycle and execution
// ABOUTME: Maps runtime, creation, stop, and guest-code failures to one taxonomy

use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Container runtime unreachable or settings invalid. The service keeps
    /// running and re-probes reachability per request via `is_ready`.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation referenced a room with no active sandbox
    #[error("No running sandbox for room: {0}")]
    NotRunning(String),

    /// Runtime refused to allocate a new environment
    #[error("Sandbox creation failed: {0}")]
    Creation(String),

    /// Guest code raised, or every execution fallback was exhausted.
    /// The message names each attempted path and its failure reason.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Graceful stop and forceful kill both failed
    #[error("Sandbox stop failed: {0}")]
    Stop(String),

    /// Docker/container-runtime errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
