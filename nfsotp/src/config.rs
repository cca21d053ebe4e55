//! Client settings
use crate::{mount::MountProtocol, rpc::OpaqueAuth};
use std::time::Duration;

/// Default bound on the wait for a reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest reply accepted, after reassembly of all fragments
pub const MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// Settings shared by the RPC clients, fixed once a client is built.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a call waits for its reply
    pub timeout: Duration,

    pub max_record_size: u32,

    /// Credential sent with every call
    pub credential: OpaqueAuth,

    /// Program, version and procedure numbers of the MOUNT protocol
    pub mount: MountProtocol,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: DEFAULT_TIMEOUT,
            max_record_size: MAX_PACKET_SIZE,
            credential: OpaqueAuth::new_none(),
            mount: MountProtocol::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
