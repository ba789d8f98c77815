//! Notification actions run after completed file operations

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ActionsConfig;

/// Operations that can trigger a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOperation {
    /// Download completed
    Download,
    /// Upload completed
    Upload,
    /// File removed
    Delete,
    /// File or directory renamed
    Rename,
}

impl ActionOperation {
    /// Name passed as the first argument to the command
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOperation::Download => "download",
            ActionOperation::Upload => "upload",
            ActionOperation::Delete => "delete",
            ActionOperation::Rename => "rename",
        }
    }
}

/// Spawns the configured command for enabled operations
#[derive(Debug, Clone, Default)]
pub struct ActionRunner {
    command: Option<PathBuf>,
    execute_on: Vec<String>,
}

impl ActionRunner {
    /// Build from configuration
    pub fn new(config: &ActionsConfig) -> Self {
        Self {
            command: config.command.clone(),
            execute_on: config.execute_on.clone(),
        }
    }

    /// Whether `operation` triggers the command
    pub fn is_enabled(&self, operation: ActionOperation) -> bool {
        self.command.is_some() && self.execute_on.iter().any(|op| op == operation.as_str())
    }

    /// Argument vector for `operation`
    pub fn arguments(
        operation: ActionOperation,
        username: &str,
        path: &Path,
        target: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![
            operation.as_str().to_string(),
            username.to_string(),
            path.display().to_string(),
        ];
        if let Some(target) = target {
            args.push(target.display().to_string());
        }
        args
    }

    /// Fire the notification without waiting for it
    pub fn execute(
        &self,
        operation: ActionOperation,
        username: &str,
        path: &Path,
        target: Option<&Path>,
    ) {
        if !self.is_enabled(operation) {
            return;
        }
        let Some(command) = self.command.clone() else {
            return;
        };
        let args = Self::arguments(operation, username, path, target);
        debug!(command = %command.display(), args = ?args, "Running notification action");

        tokio::spawn(async move {
            match tokio::process::Command::new(&command)
                .args(&args)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await
            {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(
                    command = %command.display(),
                    status = %status,
                    "Notification action exited with failure"
                ),
                Err(e) => warn!(
                    command = %command.display(),
                    error = %e,
                    "Unable to run notification action"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_operations() {
        let runner = ActionRunner::new(&ActionsConfig {
            execute_on: vec!["upload".into(), "rename".into()],
            command: Some(PathBuf::from("/bin/true")),
        });
        assert!(runner.is_enabled(ActionOperation::Upload));
        assert!(runner.is_enabled(ActionOperation::Rename));
        assert!(!runner.is_enabled(ActionOperation::Delete));

        let disabled = ActionRunner::new(&ActionsConfig {
            execute_on: vec!["upload".into()],
            command: None,
        });
        assert!(!disabled.is_enabled(ActionOperation::Upload));
    }

    #[test]
    fn test_arguments() {
        let args = ActionRunner::arguments(
            ActionOperation::Rename,
            "alice",
            Path::new("/srv/alice/a"),
            Some(Path::new("/srv/alice/b")),
        );
        assert_eq!(args, vec!["rename", "alice", "/srv/alice/a", "/srv/alice/b"]);
    }
}
