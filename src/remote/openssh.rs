//! OpenSSH transport
//!
//! Each node gets one `ssh` ControlMaster process. Commands and log follows run
//! as separate `ssh -S <control socket>` invocations multiplexed over it, so a
//! node costs one TCP connection and one authentication no matter how many
//! services are watched.

use crate::config::{ConnectionConfig, FleetNode};
use crate::error::SessionError;
use crate::remote::session::{CommandOutput, LineStream, RemoteShell, SessionConnector};
use crate::BoxFuture;
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CONTROL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Lines of master stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

type StderrTail = Arc<parking_lot::Mutex<VecDeque<String>>>;

/// Read `stderr` to the end, logging each line and keeping the last few
async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R, destination: String, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("ssh {}: {}", destination, line);
                let mut tail = tail.lock();
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => return,
            Err(e) => {
                debug!("Failed to read ssh stderr for {}: {}", destination, e);
                return;
            }
        }
    }
}

/// Session backed by an OpenSSH ControlMaster
pub struct OpenSshShell {
    node: String,
    address: String,
    destination: String,
    control_path: PathBuf,
    ssh_binary: PathBuf,
    master: Mutex<Option<Child>>,
    stderr_tail: StderrTail,
    stderr_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl OpenSshShell {
    /// Master stderr seen so far, waiting briefly for the drain to finish
    async fn master_stderr(&self) -> String {
        let task = self.stderr_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(CONTROL_CHECK_TIMEOUT, task).await.is_err() {
                debug!("ssh stderr of {} still open", self.destination);
            }
        }
        let tail = self.stderr_tail.lock();
        tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    fn control_command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn control_check(&self) -> bool {
        let mut cmd = self.control_command();
        cmd.arg("-O")
            .arg("check")
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(
            tokio::time::timeout(CONTROL_CHECK_TIMEOUT, cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    /// Wait until the master accepts multiplexed sessions
    async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut master = self.master.lock().await;
                if let Some(child) = master.as_mut() {
                    if let Some(status) = child.try_wait()? {
                        *master = None;
                        drop(master);
                        let stderr = self.master_stderr().await;
                        return Err(SessionError::Transport(format!(
                            "ssh to {} exited with {}: {}",
                            self.destination,
                            status,
                            stderr.trim()
                        )));
                    }
                }
            }

            if self.control_check().await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::Timeout(timeout));
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }
    }
}

impl RemoteShell for OpenSshShell {
    fn node(&self) -> &str {
        &self.node
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn exec<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, SessionError>> {
        Box::pin(async move {
            let mut cmd = self.control_command();
            cmd.arg(&self.destination)
                .arg("--")
                .arg(command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let output = tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| SessionError::CommandTimeout(command.to_string()))??;

            // ssh reserves 255 for its own failures
            if output.status.code() == Some(255) {
                return Err(SessionError::Transport(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }

            Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn stream<'a>(
        &'a self,
        command: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn LineStream>, SessionError>> {
        Box::pin(async move {
            let mut cmd = self.control_command();
            cmd.arg(&self.destination)
                .arg("--")
                .arg(command)
                .stdout(Stdio::piped())
                .stderr(Stdio::null());

            let mut child = cmd.spawn()?;
            let stdout = child.stdout.take().ok_or_else(|| {
                SessionError::Transport(format!("no stdout for '{}'", command))
            })?;

            Ok(Box::new(ChildLineStream {
                _child: child,
                lines: BufReader::new(stdout).lines(),
            }) as Box<dyn LineStream>)
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            {
                let mut master = self.master.lock().await;
                match master.as_mut() {
                    Some(child) => {
                        if !matches!(child.try_wait(), Ok(None)) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            self.control_check().await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            let mut cmd = self.control_command();
            cmd.arg("-O")
                .arg("exit")
                .arg(&self.destination)
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if let Err(e) = tokio::time::timeout(CONTROL_CHECK_TIMEOUT, cmd.status()).await {
                debug!("ssh -O exit for {} timed out: {}", self.destination, e);
            }

            if let Some(mut child) = self.master.lock().await.take() {
                if let Err(e) = child.kill().await {
                    debug!("ssh master for {} already gone: {}", self.destination, e);
                }
            }

            match std::fs::remove_file(&self.control_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove control socket {}: {}",
                    self.control_path.display(),
                    e
                ),
            }
            Ok(())
        })
    }
}

/// Stdout of a multiplexed `ssh` child, killed on drop
struct ChildLineStream {
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl LineStream for ChildLineStream {
    fn next_line(&mut self) -> BoxFuture<'_, std::io::Result<Option<String>>> {
        Box::pin(self.lines.next_line())
    }
}

/// Starts OpenSSH ControlMasters
pub struct OpenSshConnector {
    ssh_binary: PathBuf,
    control_dir: PathBuf,
}

impl OpenSshConnector {
    pub fn new(ssh_binary: PathBuf, control_dir: PathBuf) -> Self {
        Self {
            ssh_binary,
            control_dir,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.ssh_binary.clone(), config.control_dir.clone())
    }

    fn control_path(&self, node: &str, address: &str) -> PathBuf {
        control_socket_path(&self.control_dir, node, address)
    }
}

/// Control socket location for a node/address pair
pub fn control_socket_path(dir: &Path, node: &str, address: &str) -> PathBuf {
    let sanitized: String = address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("fleetwatch-{}-{}.sock", node, sanitized))
}

impl SessionConnector for OpenSshConnector {
    fn connect<'a>(
        &'a self,
        node: &'a FleetNode,
        address: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Arc<dyn RemoteShell>, SessionError>> {
        Box::pin(async move {
            let control_path = self.control_path(&node.name, address);
            let destination = format!("{}@{}", node.user, address);

            // a stale socket from a crashed run would make ssh refuse to listen
            match std::fs::remove_file(&control_path) {
                Ok(()) => debug!("Removed stale control socket {}", control_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(
                    "Failed to remove stale control socket {}: {}",
                    control_path.display(),
                    e
                ),
            }

            let mut cmd = Command::new(&self.ssh_binary);
            cmd.arg("-M")
                .arg("-N")
                .arg("-S")
                .arg(&control_path)
                .arg("-o")
                .arg("BatchMode=yes")
                .arg("-o")
                .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
                .arg("-o")
                .arg("ServerAliveInterval=15")
                .arg("-o")
                .arg("ServerAliveCountMax=3")
                .arg("-o")
                .arg("StrictHostKeyChecking=accept-new");
            if let Some(identity) = &node.identity_file {
                cmd.arg("-i").arg(identity);
            }
            cmd.arg(&destination)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            debug!("Starting ssh master for {} at {}", node.name, destination);
            let mut child = cmd.spawn()?;

            let stderr_tail = StderrTail::default();
            let stderr_task = child.stderr.take().map(|stderr| {
                tokio::spawn(drain_stderr(
                    stderr,
                    destination.clone(),
                    Arc::clone(&stderr_tail),
                ))
            });

            let shell = OpenSshShell {
                node: node.name.clone(),
                address: address.to_string(),
                destination,
                control_path,
                ssh_binary: self.ssh_binary.clone(),
                master: Mutex::new(Some(child)),
                stderr_tail,
                stderr_task: parking_lot::Mutex::new(stderr_task),
            };

            if let Err(e) = shell.wait_ready(timeout).await {
                if let Err(close_err) = shell.close().await {
                    debug!("Cleanup of failed ssh master for {}: {}", node.name, close_err);
                }
                return Err(e);
            }

            Ok(Arc::new(shell) as Arc<dyn RemoteShell>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_socket_path() {
        let path = control_socket_path(Path::new("/tmp"), "sculpture1", "192.168.8.158");
        assert_eq!(
            path,
            PathBuf::from("/tmp/fleetwatch-sculpture1-192.168.8.158.sock")
        );

        let path = control_socket_path(Path::new("/tmp"), "sculpture1", "fe80::1%eth0");
        assert_eq!(
            path,
            PathBuf::from("/tmp/fleetwatch-sculpture1-fe80__1_eth0.sock")
        );
    }

    #[tokio::test]
    async fn test_drain_stderr_keeps_tail() {
        let text: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        let tail = StderrTail::default();

        drain_stderr(text.as_bytes(), "pi@sculpture1.local".to_string(), Arc::clone(&tail)).await;

        let tail = tail.lock();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.front().map(String::as_str), Some("line 11"));
        assert_eq!(tail.back().map(String::as_str), Some("line 30"));
    }

    #[tokio::test]
    async fn test_connect_fails_without_ssh_binary() {
        let dir = tempfile::tempdir().unwrap();
        let connector = OpenSshConnector::new(
            PathBuf::from("/nonexistent/ssh"),
            dir.path().to_path_buf(),
        );
        let node = FleetNode::new("sculpture1", &["127.0.0.1"]);

        let result = connector
            .connect(&node, "127.0.0.1", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SessionError::IoError(_))));
    }
}
