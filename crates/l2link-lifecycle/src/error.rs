use std::fmt;
use thiserror::Error;

/// Transition a lifecycle error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Checking existing kernel objects against the record
    Observe,
    CreateTunnel,
    CreateSession,
    BringUp,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Observe => "observe",
            Stage::CreateTunnel => "create_tunnel",
            Stage::CreateSession => "create_session",
            Stage::BringUp => "bring_up",
            Stage::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Lifecycle conflict at {stage}: {detail}")]
    Conflict { stage: Stage, detail: String },

    #[error("Failed to load kernel module {module}: {detail}")]
    ModuleLoad { module: String, detail: String },

    #[error("Command `{command}` failed: {detail}")]
    Command { command: String, detail: String },
}

impl LifecycleError {
    pub fn conflict(stage: Stage, detail: impl Into<String>) -> Self {
        LifecycleError::Conflict {
            stage,
            detail: detail.into(),
        }
    }

    /// Short taxonomy name, used when errors cross the IPC boundary
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Conflict { .. } => "lifecycle_conflict",
            LifecycleError::ModuleLoad { .. } => "module_load",
            LifecycleError::Command { .. } => "command",
        }
    }
}
