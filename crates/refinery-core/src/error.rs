use thiserror::Error;

use crate::status::ExecutionStatus;

#[derive(Debug, Error)]
pub enum RefineryError {
    // Graph errors
    #[error("graph contains a cycle")]
    GraphCycle,

    #[error("No root agent: every agent in the graph has inputs")]
    NoRootAgent,

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    // Lookup errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Execution errors
    #[error("Failed to persist step {agent_id} of execution {execution_id}: {message}")]
    StepPersistence {
        execution_id: String,
        agent_id: String,
        message: String,
    },

    #[error("Agent {agent} failed: {message}")]
    AgentProcessor { agent: String, message: String },

    #[error("Execution {execution_id} is already terminal ({status})")]
    CancellationConflict {
        execution_id: String,
        status: ExecutionStatus,
    },

    // Processor errors
    #[error("Processor request failed: {0}")]
    ProcessorRequest(String),

    #[error("Processor timed out after {0}s")]
    ProcessorTimeout(u64),

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefineryError {
    /// Whether this error is a graph validation failure that blocks a launch.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::GraphCycle | Self::NoRootAgent | Self::InvalidConnection(_)
        )
    }

    /// Whether this error means the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AgentNotFound(_) | Self::ExecutionNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RefineryError>;
