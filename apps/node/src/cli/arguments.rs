use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Minimal Bitmessage object-relay node.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Port to listen on
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Host to listen on
    #[clap(long)]
    pub host: Option<IpAddr>,

    /// Enable debug logging
    #[clap(long)]
    pub debug: bool,

    /// Path to the data directory
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Do not listen for incoming connections
    #[clap(long)]
    pub no_incoming: bool,

    /// Do not send outgoing connections
    #[clap(long)]
    pub no_outgoing: bool,

    /// Do not use the IP network
    #[clap(long)]
    pub no_ip: bool,

    /// A trusted peer to connect to exclusively: host, host:port,
    /// [v6]:port, or an I2P destination
    #[clap(long)]
    pub trusted_peer: Option<String>,

    /// Maximum number of incoming connections
    #[clap(long)]
    pub connection_limit: Option<usize>,

    /// Enable I2P support (uses SAMv3)
    #[clap(long)]
    pub i2p: bool,

    /// Length of I2P tunnels
    #[clap(long)]
    pub i2p_tunnel_length: Option<u8>,

    /// Host of the I2P SAMv3 bridge
    #[clap(long)]
    pub i2p_sam_host: Option<IpAddr>,

    /// Port of the I2P SAMv3 bridge
    #[clap(long)]
    pub i2p_sam_port: Option<u16>,

    /// Generate a new I2P destination on every start and never publish it
    #[clap(long)]
    pub i2p_transient: bool,
}
