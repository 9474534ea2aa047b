//! Remote session pool
//!
//! Keeps at most one live session per fleet node. Connection attempts for one
//! node are serialized; attempts for different nodes run independently.

use crate::config::{ConnectionConfig, FleetNode};
use crate::error::SessionError;
use crate::events::Timestamp;
use crate::remote::session::{RemoteShell, SessionConnector};
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Liveness probe sent after connecting
pub const PROBE_COMMAND: &str = "echo \"SSH connection test\"";
/// Exact output expected from the probe
pub const PROBE_EXPECTED: &str = "SSH connection test";

/// Connection behaviour of the pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connect_timeout: Duration,
    pub probe: bool,
    pub probe_timeout: Duration,
    pub verify_services: bool,
    /// Services every node is expected to expose
    pub services: Vec<String>,
}

impl PoolSettings {
    pub fn from_config(config: &ConnectionConfig, services: Vec<String>) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            probe: config.probe,
            probe_timeout: config.probe_timeout(),
            verify_services: config.verify_services,
            services,
        }
    }
}

#[derive(Default)]
struct NodeConnection {
    session: Option<Arc<dyn RemoteShell>>,
    bound_address: Option<String>,
    failed_addresses: HashSet<String>,
    connection_count: u64,
    last_attempt: Option<Timestamp>,
    connected: bool,
}

/// Externally visible connection state of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnectivity {
    pub node: String,
    pub connected: bool,
    pub address: Option<String>,
    pub connection_count: u64,
    pub last_attempt: Option<Timestamp>,
}

/// Order in which candidate addresses are tried
///
/// The last-known-good address comes first, followed by the remaining
/// addresses that have not failed, in configured order.
pub fn candidate_order(
    hosts: &[String],
    bound: Option<&str>,
    failed: &HashSet<String>,
) -> Vec<String> {
    let mut order = Vec::with_capacity(hosts.len());
    if let Some(bound) = bound {
        if hosts.iter().any(|h| h == bound) && !failed.contains(bound) {
            order.push(bound.to_string());
        }
    }
    for host in hosts {
        if !failed.contains(host) && !order.contains(host) {
            order.push(host.clone());
        }
    }
    order
}

/// Pool of one remote session per fleet node
pub struct SessionPool {
    connector: Arc<dyn SessionConnector>,
    nodes: Vec<FleetNode>,
    settings: PoolSettings,
    state: Mutex<HashMap<String, NodeConnection>>,
    connect_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionPool {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        nodes: Vec<FleetNode>,
        settings: PoolSettings,
    ) -> Self {
        let connect_locks = nodes
            .iter()
            .map(|n| (n.name.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        let state = nodes
            .iter()
            .map(|n| (n.name.clone(), NodeConnection::default()))
            .collect();
        Self {
            connector,
            nodes,
            settings,
            state: Mutex::new(state),
            connect_locks,
        }
    }

    pub fn nodes(&self) -> &[FleetNode] {
        &self.nodes
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn node(&self, name: &str) -> Result<&FleetNode, SessionError> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| SessionError::UnknownNode(name.to_string()))
    }

    fn current(&self, node: &str) -> Option<Arc<dyn RemoteShell>> {
        self.state
            .lock()
            .get(node)
            .and_then(|c| c.session.as_ref().map(Arc::clone))
    }

    /// Get the live session of a node, connecting if needed
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Exhausted` when no candidate address could be
    /// connected; the caller is expected to back off before retrying.
    pub async fn acquire(&self, node: &str) -> Result<Arc<dyn RemoteShell>, SessionError> {
        let fleet_node = self.node(node)?;

        if let Some(session) = self.live_session(node).await {
            return Ok(session);
        }

        let lock = self
            .connect_locks
            .get(node)
            .map(Arc::clone)
            .ok_or_else(|| SessionError::UnknownNode(node.to_string()))?;
        let _guard = lock.lock().await;

        // another task may have connected while we waited
        if let Some(session) = self.live_session(node).await {
            return Ok(session);
        }

        self.connect(fleet_node).await
    }

    /// Return the current session if it still passes the liveness check,
    /// dropping it otherwise
    async fn live_session(&self, node: &str) -> Option<Arc<dyn RemoteShell>> {
        let session = self.current(node)?;
        if session.is_alive().await {
            return Some(session);
        }

        warn!(
            "Session to {} ({}) is no longer alive",
            node,
            session.address()
        );
        self.forget(node, &session);
        if let Err(e) = session.close().await {
            debug!("Closing dead session to {} failed: {}", node, e);
        }
        None
    }

    fn forget(&self, node: &str, session: &Arc<dyn RemoteShell>) {
        let mut state = self.state.lock();
        if let Some(conn) = state.get_mut(node) {
            let same = conn
                .session
                .as_ref()
                .map(|s| Arc::ptr_eq(s, session))
                .unwrap_or(false);
            if same {
                conn.session = None;
                conn.connected = false;
            }
        }
    }

    async fn connect(&self, node: &FleetNode) -> Result<Arc<dyn RemoteShell>, SessionError> {
        let (bound, failed) = {
            let state = self.state.lock();
            let conn = state.get(&node.name);
            (
                conn.and_then(|c| c.bound_address.clone()),
                conn.map(|c| c.failed_addresses.clone()).unwrap_or_default(),
            )
        };

        let mut order = candidate_order(&node.hosts, bound.as_deref(), &failed);
        if order.is_empty() {
            info!(
                "All addresses of {} failed previously, retrying all of them",
                node.name
            );
            self.with_state(&node.name, |c| c.failed_addresses.clear());
            order = candidate_order(&node.hosts, bound.as_deref(), &HashSet::new());
        }

        let mut attempted: Vec<String> = Vec::new();
        for address in &order {
            attempted.push(address.clone());
            if let Some(session) = self.try_address(node, address).await {
                return Ok(session);
            }
        }

        // addresses skipped because they had failed before get one more chance
        let remaining: Vec<String> = node
            .hosts
            .iter()
            .filter(|h| !attempted.contains(h))
            .cloned()
            .collect();
        if !remaining.is_empty() {
            debug!(
                "Resetting failed addresses of {} and retrying {:?}",
                node.name, remaining
            );
            self.with_state(&node.name, |c| c.failed_addresses.clear());
            for address in &remaining {
                attempted.push(address.clone());
                if let Some(session) = self.try_address(node, address).await {
                    return Ok(session);
                }
            }
        }

        self.with_state(&node.name, |c| {
            c.connected = false;
            c.session = None;
            c.last_attempt = Some(Utc::now());
        });
        error!(
            "Could not connect to {} on any of {} addresses",
            node.name,
            attempted.len()
        );
        Err(SessionError::Exhausted {
            node: node.name.clone(),
            attempted: attempted.len(),
        })
    }

    async fn try_address(&self, node: &FleetNode, address: &str) -> Option<Arc<dyn RemoteShell>> {
        debug!("Connecting to {} at {}", node.name, address);
        match self.open(node, address).await {
            Ok(session) => {
                let count = self.with_state(&node.name, |c| {
                    c.session = Some(Arc::clone(&session));
                    c.bound_address = Some(address.to_string());
                    c.failed_addresses.remove(address);
                    c.connection_count += 1;
                    c.last_attempt = Some(Utc::now());
                    c.connected = true;
                    c.connection_count
                });
                info!(
                    "Connected to {} at {} (connection #{})",
                    node.name,
                    address,
                    count.unwrap_or_default()
                );
                Some(session)
            }
            Err(e) => {
                warn!("Connection to {} at {} failed: {}", node.name, address, e);
                self.with_state(&node.name, |c| {
                    c.failed_addresses.insert(address.to_string());
                    c.last_attempt = Some(Utc::now());
                });
                None
            }
        }
    }

    /// Open, probe and verify one candidate address
    async fn open(
        &self,
        node: &FleetNode,
        address: &str,
    ) -> Result<Arc<dyn RemoteShell>, SessionError> {
        let timeout = self.settings.connect_timeout;
        let session = tokio::time::timeout(timeout, self.connector.connect(node, address, timeout))
            .await
            .map_err(|_| SessionError::Timeout(timeout))??;

        if self.settings.probe {
            if let Err(e) = self.probe(&session).await {
                if let Err(close_err) = session.close().await {
                    debug!("Closing unprobed session failed: {}", close_err);
                }
                return Err(e);
            }
        }

        if self.settings.verify_services {
            self.verify_services(&node.name, &session).await;
        }

        Ok(session)
    }

    async fn probe(&self, session: &Arc<dyn RemoteShell>) -> Result<(), SessionError> {
        let output = session
            .exec(PROBE_COMMAND, self.settings.probe_timeout)
            .await?;
        if output.success() && output.stdout.trim() == PROBE_EXPECTED {
            Ok(())
        } else {
            Err(SessionError::ProbeFailed(format!(
                "unexpected probe response: {:?}",
                output.stdout.trim()
            )))
        }
    }

    /// Log the systemd state of every expected service; never fails
    async fn verify_services(&self, node: &str, session: &Arc<dyn RemoteShell>) {
        for service in &self.settings.services {
            let command = format!("systemctl is-active {}", service);
            match session.exec(&command, self.settings.probe_timeout).await {
                Ok(output) => {
                    let status = output.stdout.trim();
                    if output.success() {
                        info!("{}: {} is {}", node, service, status);
                    } else {
                        warn!(
                            "{}: {} reports status '{}'",
                            node,
                            service,
                            if status.is_empty() { "unknown" } else { status }
                        );
                    }
                }
                Err(e) => warn!("{}: could not verify {}: {}", node, service, e),
            }
        }
    }

    fn with_state<R>(&self, node: &str, f: impl FnOnce(&mut NodeConnection) -> R) -> Option<R> {
        self.state.lock().get_mut(node).map(f)
    }

    /// Drop a node's session after an I/O failure
    pub async fn invalidate(&self, node: &str) {
        let session = self
            .with_state(node, |c| {
                c.connected = false;
                c.session.take()
            })
            .flatten();
        if let Some(session) = session {
            info!("Invalidating session to {} ({})", node, session.address());
            if let Err(e) = session.close().await {
                debug!("Closing session to {} failed: {}", node, e);
            }
        }
    }

    /// Connection state of every node, in configured order
    pub fn connectivity(&self) -> Vec<NodeConnectivity> {
        let state = self.state.lock();
        self.nodes
            .iter()
            .map(|node| {
                let conn = state.get(&node.name);
                NodeConnectivity {
                    node: node.name.clone(),
                    connected: conn.map(|c| c.connected).unwrap_or(false),
                    address: conn.and_then(|c| c.bound_address.clone()),
                    connection_count: conn.map(|c| c.connection_count).unwrap_or(0),
                    last_attempt: conn.and_then(|c| c.last_attempt),
                }
            })
            .collect()
    }

    /// Close every session; errors are logged and not retried
    pub async fn close_all(&self) {
        let sessions: Vec<(String, Arc<dyn RemoteShell>)> = {
            let mut state = self.state.lock();
            state
                .iter_mut()
                .filter_map(|(node, c)| {
                    c.connected = false;
                    c.session.take().map(|s| (node.clone(), s))
                })
                .collect()
        };

        for (node, session) in sessions {
            match session.close().await {
                Ok(()) => info!("Closed session to {}", node),
                Err(e) => warn!("Failed to close session to {}: {}", node, e),
            }
        }
    }
}
