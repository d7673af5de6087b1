use crate::LifecycleError;
use std::process::Command;
use tracing::debug;

/// Loads kernel modules
pub trait ModuleLoader: Send + Sync {
    fn load(&self, module: &str) -> Result<(), LifecycleError>;
}

/// Loads modules with `modprobe`; already-loaded modules succeed silently
#[derive(Debug, Default)]
pub struct Modprobe;

impl ModuleLoader for Modprobe {
    fn load(&self, module: &str) -> Result<(), LifecycleError> {
        debug!("Loading kernel module {}", module);
        let output = Command::new("modprobe")
            .arg(module)
            .output()
            .map_err(|e| LifecycleError::ModuleLoad {
                module: module.to_string(),
                detail: format!("failed to execute modprobe: {}", e),
            })?;

        if !output.status.success() {
            return Err(LifecycleError::ModuleLoad {
                module: module.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
