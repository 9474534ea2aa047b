/// Remote shell traits and in-memory doubles
pub mod session;

/// OpenSSH ControlMaster transport
pub mod openssh;

/// One session per fleet node, with address fallback
pub mod pool;

pub use openssh::OpenSshConnector;
pub use pool::{NodeConnectivity, PoolSettings, SessionPool};
pub use session::{
    CommandOutput, LineStream, MockConnector, MockShell, RemoteShell, SessionConnector,
};
