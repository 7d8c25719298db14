//! Node configuration. Immutable after startup.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::pools::PeerAddr;

/// Default port for listening and for peers advertised without one.
pub const DEFAULT_PORT: u16 = 8444;

/// Server-side cap on the number of simultaneous connections.
pub const DEFAULT_CONNECTION_LIMIT: usize = 150;

/// Target number of outgoing connections.
pub const DEFAULT_OUTGOING_LIMIT: usize = 8;

/// Seconds of silence after which an established peer is dropped.
pub const NETWORK_TIMEOUT: u64 = 600;

/// Services advertised in our `version`: NODE_NETWORK | NODE_SSL.
pub const SERVICES: u64 = 3;

/// The NODE_SSL service bit: the peer accepts a TLS upgrade over IP.
pub const NODE_SSL: u64 = 2;

/// User agent included in `version` messages.
pub const USER_AGENT: &str = concat!("MiNode-v", env!("CARGO_PKG_VERSION"));

/// Reserved object type carrying an I2P destination advertisement.
/// Deployment constants of the network; see DESIGN.md.
pub const I2P_DEST_OBJ_TYPE: u32 = 0x493250;
pub const I2P_DEST_OBJ_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to listen on; both families when unset.
    pub listen_host: Option<IpAddr>,
    pub listen_port: u16,
    /// Directory for snapshots and I2P keys.
    pub data_dir: PathBuf,
    pub listen_for_connections: bool,
    pub send_outgoing_connections: bool,
    pub ip_enabled: bool,
    pub i2p_enabled: bool,
    /// Do not persist the I2P destination and never publish it.
    pub i2p_transient: bool,
    pub i2p_sam_host: IpAddr,
    pub i2p_sam_port: u16,
    pub i2p_tunnel_length: u8,
    /// When set, the only peer we ever dial.
    pub trusted_peer: Option<PeerAddr>,
    pub connection_limit: usize,
    pub outgoing_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: None,
            listen_port: DEFAULT_PORT,
            data_dir: PathBuf::from("minode_data"),
            listen_for_connections: true,
            send_outgoing_connections: true,
            ip_enabled: true,
            i2p_enabled: false,
            i2p_transient: false,
            i2p_sam_host: IpAddr::from([127, 0, 0, 1]),
            i2p_sam_port: 7656,
            i2p_tunnel_length: 2,
            trusted_peer: None,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            outgoing_limit: DEFAULT_OUTGOING_LIMIT,
        }
    }
}
