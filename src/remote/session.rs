//! Remote shell abstraction
//!
//! A `RemoteShell` is one authenticated connection to one fleet node. Every
//! command (a one-shot `exec` or a long-running `stream`) is a separate
//! invocation multiplexed over that connection.

use crate::config::FleetNode;
use crate::error::SessionError;
use crate::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of a completed remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit status; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Line-by-line output of a long-running remote command
pub trait LineStream: Send {
    /// Next line of output, `Ok(None)` once the remote process has exited
    fn next_line(&mut self) -> BoxFuture<'_, std::io::Result<Option<String>>>;
}

/// One live connection to a fleet node
pub trait RemoteShell: Send + Sync {
    fn node(&self) -> &str;

    /// Candidate address this session is bound to
    fn address(&self) -> &str;

    /// Run a command to completion within `timeout`
    fn exec<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, SessionError>>;

    /// Start a long-running command and stream its stdout
    fn stream<'a>(&'a self, command: &'a str)
        -> BoxFuture<'a, Result<Box<dyn LineStream>, SessionError>>;

    /// Whether the underlying transport is still usable
    fn is_alive(&self) -> BoxFuture<'_, bool>;

    /// Tear the connection down
    fn close(&self) -> BoxFuture<'_, Result<(), SessionError>>;
}

/// Opens transports to candidate addresses
pub trait SessionConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        node: &'a FleetNode,
        address: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Arc<dyn RemoteShell>, SessionError>>;
}

/// Scripted line stream used by `MockShell`
pub struct ScriptedStream {
    lines: VecDeque<String>,
    hold_open: bool,
    fail_at_end: bool,
}

impl LineStream for ScriptedStream {
    fn next_line(&mut self) -> BoxFuture<'_, std::io::Result<Option<String>>> {
        Box::pin(async move {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            if self.fail_at_end {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            if self.hold_open {
                std::future::pending::<()>().await;
            }
            Ok(None)
        })
    }
}

struct StreamScript {
    lines: Vec<String>,
    hold_open: bool,
    fail_at_end: bool,
}

/// In-memory remote shell for tests and dry runs
///
/// Commands are answered from per-command scripts (consumed in order) and
/// fall back to sensible defaults: `echo` returns its argument,
/// `systemctl is-active` reports `active`, everything else succeeds silently.
pub struct MockShell {
    node: String,
    address: String,
    alive: AtomicBool,
    closed: AtomicBool,
    responses: Mutex<HashMap<String, VecDeque<Result<CommandOutput, String>>>>,
    streams: Mutex<HashMap<String, VecDeque<StreamScript>>>,
    executed: Mutex<Vec<String>>,
    streams_started: AtomicUsize,
    exec_delay: Mutex<Option<Duration>>,
}

impl MockShell {
    pub fn new(node: &str, address: &str) -> Self {
        Self {
            node: node.to_string(),
            address: address.to_string(),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            responses: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            streams_started: AtomicUsize::new(0),
            exec_delay: Mutex::new(None),
        }
    }

    /// Queue the result of the next invocation of `command`
    pub fn respond(&self, command: &str, output: CommandOutput) {
        self.responses
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(Ok(output));
    }

    /// Queue a transport failure for the next invocation of `command`
    pub fn fail(&self, command: &str, reason: &str) {
        self.responses
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    /// Queue the output of the next stream started with `command`
    ///
    /// With `hold_open` the stream stays pending after its last line, like a
    /// healthy `journalctl -f`.
    pub fn script_stream(&self, command: &str, lines: &[&str], hold_open: bool) {
        self.push_stream(command, lines, hold_open, false);
    }

    /// Queue a stream that fails with an I/O error after its lines
    pub fn script_broken_stream(&self, command: &str, lines: &[&str]) {
        self.push_stream(command, lines, false, true);
    }

    fn push_stream(&self, command: &str, lines: &[&str], hold_open: bool, fail_at_end: bool) {
        self.streams
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(StreamScript {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                hold_open,
                fail_at_end,
            });
    }

    /// Delay every `exec` by `delay`
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock() = Some(delay);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn streams_started(&self) -> usize {
        self.streams_started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn default_output(command: &str) -> CommandOutput {
        if let Some(text) = command.strip_prefix("echo ") {
            return CommandOutput::ok(format!("{}\n", text.trim_matches('"')));
        }
        if command.starts_with("systemctl is-active") {
            return CommandOutput::ok("active\n");
        }
        CommandOutput::ok("")
    }

    fn check_usable(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) || !self.alive.load(Ordering::SeqCst) {
            return Err(SessionError::Transport(format!(
                "session to {} ({}) is closed",
                self.node, self.address
            )));
        }
        Ok(())
    }
}

impl RemoteShell for MockShell {
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
            self.check_usable()?;
            self.executed.lock().push(command.to_string());

            let delay = *self.exec_delay.lock();
            if let Some(delay) = delay {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(SessionError::CommandTimeout(command.to_string()));
                }
                tokio::time::sleep(delay).await;
            }

            let scripted = self
                .responses
                .lock()
                .get_mut(command)
                .and_then(|queue| queue.pop_front());
            match scripted {
                Some(Ok(output)) => Ok(output),
                Some(Err(reason)) => Err(SessionError::Transport(reason)),
                None => Ok(Self::default_output(command)),
            }
        })
    }

    fn stream<'a>(
        &'a self,
        command: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn LineStream>, SessionError>> {
        Box::pin(async move {
            self.check_usable()?;
            self.executed.lock().push(command.to_string());
            self.streams_started.fetch_add(1, Ordering::SeqCst);

            let script = self
                .streams
                .lock()
                .get_mut(command)
                .and_then(|queue| queue.pop_front());
            let stream = match script {
                Some(script) => ScriptedStream {
                    lines: script.lines.into_iter().collect(),
                    hold_open: script.hold_open,
                    fail_at_end: script.fail_at_end,
                },
                None => ScriptedStream {
                    lines: VecDeque::new(),
                    hold_open: false,
                    fail_at_end: false,
                },
            };
            Ok(Box::new(stream) as Box<dyn LineStream>)
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.check_usable().is_ok() })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Connector handing out pre-registered `MockShell`s
///
/// Addresses without a registered shell, or marked unreachable, fail with a
/// transport error. Every attempt is recorded in order.
#[derive(Default)]
pub struct MockConnector {
    shells: Mutex<HashMap<String, Arc<MockShell>>>,
    unreachable: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable address and return its shell
    pub fn add_shell(&self, node: &str, address: &str) -> Arc<MockShell> {
        let shell = Arc::new(MockShell::new(node, address));
        self.shells
            .lock()
            .insert(address.to_string(), Arc::clone(&shell));
        shell
    }

    /// Replace the shell of an address, e.g. after the previous one was closed
    pub fn replace_shell(&self, node: &str, address: &str) -> Arc<MockShell> {
        self.add_shell(node, address)
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(address);
        } else {
            unreachable.insert(address.to_string());
        }
    }

    /// Delay every connect to `address`; a long delay simulates a host that
    /// accepts the TCP handshake and then never answers
    pub fn set_connect_delay(&self, address: &str, delay: Duration) {
        self.delays.lock().insert(address.to_string(), delay);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn clear_attempts(&self) {
        self.attempts.lock().clear();
    }
}

impl SessionConnector for MockConnector {
    fn connect<'a>(
        &'a self,
        node: &'a FleetNode,
        address: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Arc<dyn RemoteShell>, SessionError>> {
        Box::pin(async move {
            self.attempts.lock().push(address.to_string());
            let delay = self.delays.lock().get(address).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.unreachable.lock().contains(address) {
                return Err(SessionError::Transport(format!(
                    "{}: no route to host",
                    address
                )));
            }
            match self.shells.lock().get(address) {
                Some(shell) if !shell.is_closed() => Ok(Arc::clone(shell) as Arc<dyn RemoteShell>),
                _ => Err(SessionError::Transport(format!(
                    "{}: connection refused ({})",
                    address, node.name
                ))),
            }
        })
    }
}
