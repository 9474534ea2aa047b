//! Restarts of services running on the coordinator host itself

use crate::config::LocalServicesConfig;
use crate::error::LocalServiceError;
use log::{info, warn};
use std::time::Duration;
use tokio::process::Command;

/// Restarts allow-listed local services through systemd
pub struct LocalServiceController {
    allowed: Vec<String>,
    engine_service: String,
    resync_delay: Duration,
    command_timeout: Duration,
    /// Program and leading arguments, e.g. `sudo systemctl`
    systemctl: Vec<String>,
}

impl LocalServiceController {
    pub fn from_config(config: &LocalServicesConfig, use_sudo: bool) -> Self {
        let systemctl = if use_sudo {
            vec!["sudo".to_string(), "systemctl".to_string()]
        } else {
            vec!["systemctl".to_string()]
        };
        Self::with_program(config, systemctl)
    }

    /// Controller running `program restart <service>` instead of systemctl
    pub fn with_program(config: &LocalServicesConfig, program: Vec<String>) -> Self {
        Self {
            allowed: config.allowed.clone(),
            engine_service: config.engine_service.clone(),
            resync_delay: Duration::from_secs(config.resync_delay_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            systemctl: program,
        }
    }

    pub fn is_allowed(&self, service: &str) -> bool {
        self.allowed.iter().any(|s| s == service)
    }

    /// Whether restarting `service` resets the mixing engine's plan
    pub fn requires_plan_resync(&self, service: &str) -> bool {
        service == self.engine_service
    }

    /// Time the engine needs after a restart before it accepts commands
    pub fn resync_delay(&self) -> Duration {
        self.resync_delay
    }

    /// Restart `service`
    ///
    /// # Errors
    ///
    /// * `LocalServiceError::NotAllowed` - service is not on the allow-list
    /// * `LocalServiceError::CommandFailed` - systemctl could not run or exited non-zero
    /// * `LocalServiceError::Timeout` - systemctl did not finish in time
    pub async fn restart(&self, service: &str) -> Result<(), LocalServiceError> {
        if !self.is_allowed(service) {
            warn!("Unknown service: {}", service);
            return Err(LocalServiceError::NotAllowed(service.to_string()));
        }
        let Some((program, args)) = self.systemctl.split_first() else {
            return Err(LocalServiceError::CommandFailed {
                service: service.to_string(),
                reason: "no restart command configured".to_string(),
            });
        };

        info!("Restarting {}...", service);
        let mut command = Command::new(program);
        command.args(args).arg("restart").arg(service).kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, command.output())
            .await
            .map_err(|_| LocalServiceError::Timeout(service.to_string()))?
            .map_err(|e| LocalServiceError::CommandFailed {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(LocalServiceError::CommandFailed {
                service: service.to_string(),
                reason: format!(
                    "exit status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        info!("Restarted {}", service);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(program: &[&str]) -> LocalServiceController {
        LocalServiceController::with_program(
            &LocalServicesConfig::default(),
            program.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_allow_list_and_resync() {
        let controller = LocalServiceController::from_config(&LocalServicesConfig::default(), true);
        assert!(controller.is_allowed("icecast2"));
        assert!(controller.is_allowed("liquidsoap"));
        assert!(!controller.is_allowed("sshd"));
        assert!(controller.requires_plan_resync("liquidsoap"));
        assert!(!controller.requires_plan_resync("icecast2"));
        assert_eq!(controller.resync_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_disallowed_service_is_not_run() {
        let controller = controller(&["false"]);
        assert!(matches!(
            controller.restart("sshd").await,
            Err(LocalServiceError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_success() {
        let controller = controller(&["true"]);
        assert!(controller.restart("icecast2").await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_failure() {
        let controller = controller(&["false"]);
        assert!(matches!(
            controller.restart("liquidsoap").await,
            Err(LocalServiceError::CommandFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let controller = controller(&["/nonexistent/systemctl"]);
        assert!(matches!(
            controller.restart("icecast2").await,
            Err(LocalServiceError::CommandFailed { .. })
        ));
    }
}
