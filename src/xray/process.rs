//! Control of the xray service process
//!
//! Production code shells out to `systemctl`. Tests use `MockProcessController`
//! to count restarts and inject failures.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Service state as reported on `/health-check`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
}

impl ServiceState {
    /// Map `systemctl is-active` output to a state
    ///
    /// Anything other than `active`/`inactive` (activating, failed, unknown
    /// unit, empty output) is reported as failed.
    pub fn from_is_active(output: &str) -> Self {
        match output.trim().to_lowercase().as_str() {
            "active" => ServiceState::Active,
            "inactive" => ServiceState::Inactive,
            _ => ServiceState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ServiceState,
    pub version: Option<String>,
}

/// Out-of-band control of the serving process
#[async_trait]
pub trait ProcessController: Send + Sync {
    async fn restart(&self) -> Result<(), ProcessError>;

    async fn status(&self) -> Result<ProcessStatus, ProcessError>;
}

/// Controls xray through its systemd unit
pub struct SystemdController {
    unit: String,
    binary: String,
}

impl SystemdController {
    pub fn new(unit: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            binary: binary.into(),
        }
    }

    /// First line of `<binary> version`, if the binary runs at all
    async fn version(&self) -> Option<String> {
        let output = Command::new(&self.binary).arg("version").output().await.ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }
}

#[async_trait]
impl ProcessController for SystemdController {
    async fn restart(&self) -> Result<(), ProcessError> {
        let command = format!("systemctl restart {}", self.unit);
        let output = Command::new("systemctl")
            .args(["restart", &self.unit])
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProcessError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(unit = %self.unit, "xray restarted");
        Ok(())
    }

    async fn status(&self) -> Result<ProcessStatus, ProcessError> {
        // is-active exits non-zero for inactive units, so only stdout matters
        let output = Command::new("systemctl")
            .args(["is-active", &self.unit])
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                command: format!("systemctl is-active {}", self.unit),
                source,
            })?;

        let state = ServiceState::from_is_active(&String::from_utf8_lossy(&output.stdout));
        debug!(unit = %self.unit, ?state, "xray status queried");

        Ok(ProcessStatus {
            state,
            version: self.version().await,
        })
    }
}

/// Mock process controller for testing
#[cfg(test)]
pub struct MockProcessController {
    restarts: std::sync::atomic::AtomicU32,
    fail_restart: std::sync::atomic::AtomicBool,
    fail_status: std::sync::atomic::AtomicBool,
    state: std::sync::Mutex<ServiceState>,
}

#[cfg(test)]
impl Default for MockProcessController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockProcessController {
    pub fn new() -> Self {
        Self {
            restarts: std::sync::atomic::AtomicU32::new(0),
            fail_restart: std::sync::atomic::AtomicBool::new(false),
            fail_status: std::sync::atomic::AtomicBool::new(false),
            state: std::sync::Mutex::new(ServiceState::Active),
        }
    }

    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_status(&self, fail: bool) {
        self.fail_status
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_state(&self, state: ServiceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl ProcessController for MockProcessController {
    async fn restart(&self) -> Result<(), ProcessError> {
        if self.fail_restart.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProcessError::CommandFailed {
                command: "systemctl restart xray".into(),
                code: Some(1),
                stderr: "Job for xray.service failed".into(),
            });
        }
        self.restarts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> Result<ProcessStatus, ProcessError> {
        if self.fail_status.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProcessError::Spawn {
                command: "systemctl is-active xray".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "systemctl not found"),
            });
        }
        Ok(ProcessStatus {
            state: *self.state.lock().unwrap(),
            version: Some("Xray 1.8.24 (Xray, Penetrates Everything.)".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_active_output_mapping() {
        assert_eq!(ServiceState::from_is_active("active\n"), ServiceState::Active);
        assert_eq!(ServiceState::from_is_active("INACTIVE"), ServiceState::Inactive);
        assert_eq!(ServiceState::from_is_active("activating"), ServiceState::Failed);
        assert_eq!(ServiceState::from_is_active(""), ServiceState::Failed);
    }

    #[test]
    fn test_service_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServiceState::Inactive).unwrap(),
            "\"inactive\""
        );
    }

    #[tokio::test]
    async fn test_mock_restart_failure() {
        let mock = MockProcessController::new();
        mock.set_fail_restart(true);
        assert!(mock.restart().await.is_err());
        assert_eq!(mock.restarts(), 0);

        mock.set_fail_restart(false);
        mock.restart().await.unwrap();
        assert_eq!(mock.restarts(), 1);
    }
}
