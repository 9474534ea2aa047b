use crate::config::RestartPolicy;
use crate::error::RestartError;
use crate::events::RestartStrategy;
use crate::remote::{RemoteShell, SessionPool};
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Future of one restart execution; owns everything it needs
pub type RestartFuture = Pin<Box<dyn Future<Output = Result<RestartStrategy, RestartError>> + Send>>;

/// Executes the restart of one service on one node
///
/// Implementations return the strategy that brought the service back, or
/// `RestartError::ExecutionFailed` once every strategy failed.
#[cfg_attr(test, mockall::automock)]
pub trait ServiceRestarter: Send + Sync {
    fn restart(&self, node: &str, service: &str, attempt: u32) -> RestartFuture;
}

/// Command settings of the tiered restart
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub command_timeout: Duration,
    pub graceful_retries: u32,
    pub retry_delay: Duration,
    pub use_sudo: bool,
}

impl ExecutorSettings {
    pub fn from_policy(policy: &RestartPolicy) -> Self {
        Self {
            command_timeout: policy.command_timeout(),
            graceful_retries: policy.graceful_retries,
            retry_delay: policy.retry_delay(),
            use_sudo: policy.use_sudo,
        }
    }

    fn command(&self, command: &str) -> String {
        if self.use_sudo {
            format!("sudo {}", command)
        } else {
            command.to_string()
        }
    }
}

/// Tiered restart over the node's remote session
///
/// Strategies run in order and stop at the first success:
/// 1. `systemctl restart`, retried `graceful_retries` times
/// 2. `systemctl stop` followed by `systemctl start`
/// 3. `pkill -9` followed by `systemctl start`
pub struct RestartExecutor {
    pool: Arc<SessionPool>,
    settings: ExecutorSettings,
}

impl RestartExecutor {
    pub fn new(pool: Arc<SessionPool>, settings: ExecutorSettings) -> Self {
        Self { pool, settings }
    }
}

impl ServiceRestarter for RestartExecutor {
    fn restart(&self, node: &str, service: &str, attempt: u32) -> RestartFuture {
        let pool = Arc::clone(&self.pool);
        let settings = self.settings.clone();
        let node = node.to_string();
        let service = service.to_string();

        Box::pin(async move {
            let session = pool
                .acquire(&node)
                .await
                .map_err(|e| RestartError::ExecutionFailed {
                    node: node.clone(),
                    service: service.clone(),
                    reason: format!("no session available: {}", e),
                })?;

            info!(
                "Restarting {} on {} (attempt {})",
                service, node, attempt
            );
            match run_strategies(session.as_ref(), &service, &settings).await {
                Some(strategy) => {
                    info!(
                        "Successfully restarted {} on {} using {}",
                        service, node, strategy
                    );
                    Ok(strategy)
                }
                None => Err(RestartError::ExecutionFailed {
                    node,
                    service,
                    reason: "all restart strategies failed".to_string(),
                }),
            }
        })
    }
}

/// Run the three strategies in order, returning the first that succeeded
pub async fn run_strategies(
    session: &dyn RemoteShell,
    service: &str,
    settings: &ExecutorSettings,
) -> Option<RestartStrategy> {
    let restart = settings.command(&format!("systemctl restart {}", service));
    let stop = settings.command(&format!("systemctl stop {}", service));
    let start = settings.command(&format!("systemctl start {}", service));
    let kill = settings.command(&format!("pkill -9 {}", service));

    for retry in 1..=settings.graceful_retries {
        if run_command(session, &restart, settings.command_timeout).await {
            return Some(RestartStrategy::Graceful);
        }
        if retry < settings.graceful_retries {
            tokio::time::sleep(settings.retry_delay).await;
        }
    }

    warn!(
        "systemctl restart failed, trying stop/start for {}/{}",
        session.node(),
        service
    );
    if run_command(session, &stop, settings.command_timeout).await
        && run_command(session, &start, settings.command_timeout).await
    {
        return Some(RestartStrategy::StopStart);
    }

    warn!(
        "stop/start failed, trying force kill for {}/{}",
        session.node(),
        service
    );
    if run_command(session, &kill, settings.command_timeout).await
        && run_command(session, &start, settings.command_timeout).await
    {
        return Some(RestartStrategy::ForceKill);
    }

    None
}

async fn run_command(session: &dyn RemoteShell, command: &str, timeout: Duration) -> bool {
    match session.exec(command, timeout).await {
        Ok(output) if output.success() => {
            debug!("Command succeeded on {}: {}", session.node(), command);
            true
        }
        Ok(output) => {
            warn!(
                "Command failed on {} with exit code {:?}: {}",
                session.node(),
                output.status,
                command
            );
            if !output.stderr.trim().is_empty() {
                warn!("stderr: {}", output.stderr.trim());
            }
            false
        }
        Err(e) => {
            warn!("Error executing '{}' on {}: {}", command, session.node(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetNode;
    use crate::remote::{CommandOutput, MockConnector, MockShell, PoolSettings};

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            command_timeout: Duration::from_millis(200),
            graceful_retries: 3,
            retry_delay: Duration::from_millis(1),
            use_sudo: true,
        }
    }

    fn fail(shell: &MockShell, command: &str, times: usize) {
        for _ in 0..times {
            shell.respond(command, CommandOutput::failed(1, "Job failed"));
        }
    }

    #[tokio::test]
    async fn test_graceful_restart_first_try() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        let strategy = run_strategies(&shell, "darkice", &settings()).await;

        assert_eq!(strategy, Some(RestartStrategy::Graceful));
        assert_eq!(shell.executed(), vec!["sudo systemctl restart darkice"]);
    }

    #[tokio::test]
    async fn test_graceful_restart_retries() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        fail(&shell, "sudo systemctl restart darkice", 2);

        let strategy = run_strategies(&shell, "darkice", &settings()).await;
        assert_eq!(strategy, Some(RestartStrategy::Graceful));
        assert_eq!(shell.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_falls_back_to_stop_start() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        fail(&shell, "sudo systemctl restart darkice", 3);

        let strategy = run_strategies(&shell, "darkice", &settings()).await;
        assert_eq!(strategy, Some(RestartStrategy::StopStart));
        assert_eq!(
            shell.executed()[3..],
            [
                "sudo systemctl stop darkice".to_string(),
                "sudo systemctl start darkice".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_force_kill() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        fail(&shell, "sudo systemctl restart darkice", 3);
        fail(&shell, "sudo systemctl stop darkice", 1);

        let strategy = run_strategies(&shell, "darkice", &settings()).await;
        assert_eq!(strategy, Some(RestartStrategy::ForceKill));
        let executed = shell.executed();
        assert_eq!(executed[executed.len() - 2], "sudo pkill -9 darkice");
        assert_eq!(executed[executed.len() - 1], "sudo systemctl start darkice");
    }

    #[tokio::test]
    async fn test_failed_kill_fails_force_kill_step() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        fail(&shell, "sudo systemctl restart darkice", 3);
        fail(&shell, "sudo systemctl stop darkice", 1);
        fail(&shell, "sudo pkill -9 darkice", 1);

        assert_eq!(run_strategies(&shell, "darkice", &settings()).await, None);
        let executed = shell.executed();
        assert_eq!(executed.last().unwrap(), "sudo pkill -9 darkice");
        assert!(!executed[3..].contains(&"sudo systemctl start darkice".to_string()));
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        fail(&shell, "sudo systemctl restart darkice", 3);
        fail(&shell, "sudo systemctl stop darkice", 1);
        shell.fail("sudo systemctl start darkice", "connection reset");

        assert_eq!(run_strategies(&shell, "darkice", &settings()).await, None);
    }

    #[tokio::test]
    async fn test_command_timeout_counts_as_failure() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        shell.set_exec_delay(Duration::from_secs(5));

        assert_eq!(run_strategies(&shell, "darkice", &settings()).await, None);
    }

    #[tokio::test]
    async fn test_without_sudo() {
        let shell = MockShell::new("sculpture1", "sculpture1.local");
        let mut settings = settings();
        settings.use_sudo = false;

        run_strategies(&shell, "darkice", &settings).await;
        assert_eq!(shell.executed(), vec!["systemctl restart darkice"]);
    }

    #[tokio::test]
    async fn test_executor_without_session() {
        let connector = Arc::new(MockConnector::new());
        let pool = Arc::new(SessionPool::new(
            connector,
            vec![FleetNode::new("sculpture1", &["sculpture1.local"])],
            PoolSettings {
                connect_timeout: Duration::from_millis(100),
                probe: true,
                probe_timeout: Duration::from_millis(100),
                verify_services: false,
                services: Vec::new(),
            },
        ));
        let executor = RestartExecutor::new(pool, settings());

        match executor.restart("sculpture1", "darkice", 1).await {
            Err(RestartError::ExecutionFailed { reason, .. }) => {
                assert!(reason.contains("no session"))
            }
            other => panic!("Expected execution failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executor_restarts_over_pool_session() {
        let connector = Arc::new(MockConnector::new());
        let shell = connector.add_shell("sculpture1", "sculpture1.local");
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&connector) as Arc<dyn crate::remote::SessionConnector>,
            vec![FleetNode::new("sculpture1", &["sculpture1.local"])],
            PoolSettings {
                connect_timeout: Duration::from_millis(100),
                probe: true,
                probe_timeout: Duration::from_millis(100),
                verify_services: false,
                services: Vec::new(),
            },
        ));
        let executor = RestartExecutor::new(pool, settings());

        let strategy = executor.restart("sculpture1", "darkice", 1).await.unwrap();
        assert_eq!(strategy, RestartStrategy::Graceful);
        assert!(shell
            .executed()
            .contains(&"sudo systemctl restart darkice".to_string()));
    }
}
