//! Translate CLI options into node configuration.

use std::net::{IpAddr, ToSocketAddrs};

use eyre::{eyre, WrapErr};

use minode_p2p::config::{Config, DEFAULT_PORT};
use minode_p2p::pools::PeerAddr;

use crate::cli::arguments::Args;

pub fn from_args(args: &Args) -> eyre::Result<Config> {
    let mut config = Config::default();

    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.listen_host = args.host;
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if args.no_incoming {
        config.listen_for_connections = false;
    }
    if args.no_outgoing {
        config.send_outgoing_connections = false;
    }
    if args.no_ip {
        config.ip_enabled = false;
    }
    if let Some(peer) = &args.trusted_peer {
        config.trusted_peer = Some(parse_trusted_peer(peer)?);
    }
    if let Some(limit) = args.connection_limit {
        config.connection_limit = limit;
    }
    if args.i2p {
        config.i2p_enabled = true;
    }
    if args.i2p_transient {
        config.i2p_transient = true;
    }
    if let Some(length) = args.i2p_tunnel_length {
        config.i2p_tunnel_length = length;
    }
    if let Some(host) = args.i2p_sam_host {
        config.i2p_sam_host = host;
    }
    if let Some(port) = args.i2p_sam_port {
        config.i2p_sam_port = port;
    }

    Ok(config)
}

/// `host`, `host:port`, `[v6]:port`, or a raw I2P destination (which is
/// always longer than any host name we would dial).
fn parse_trusted_peer(peer: &str) -> eyre::Result<PeerAddr> {
    if peer.len() > 50 {
        return Ok(PeerAddr::I2p(peer.to_string()));
    }
    if let Some(rest) = peer.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| eyre!("invalid trusted peer: {}", peer))?;
        return resolve(host, port.parse().wrap_err("invalid trusted peer port")?);
    }
    match peer.split_once(':') {
        // A single colon separates host and port; more means bare IPv6.
        Some((host, port)) if !port.contains(':') => {
            resolve(host, port.parse().wrap_err("invalid trusted peer port")?)
        }
        _ => resolve(peer, DEFAULT_PORT),
    }
}

fn resolve(host: &str, port: u16) -> eyre::Result<PeerAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(PeerAddr::Ip(ip, port));
    }
    let addr = (host, port)
        .to_socket_addrs()
        .wrap_err("failed to resolve trusted peer")?
        .next()
        .ok_or_else(|| eyre!("no address found for trusted peer {}", host))?;
    Ok(PeerAddr::Ip(addr.ip(), addr.port()))
}
