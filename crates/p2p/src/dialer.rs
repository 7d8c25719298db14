//! Outbound TCP dialing.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::connection::{Connection, Handle, Link, Status};
use crate::pools::PeerAddr;
use crate::state::State;

/// Maximum time to wait for a TCP connection to come up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial an IP peer and run a client connection over the socket.
///
/// The attempt is registered in the connection set immediately, in the
/// `ready` state, so the manager does not dial the same host twice; a
/// failed dial ends up `failed` and is reaped on the next tick.
pub fn spawn(state: &Arc<State>, host: IpAddr, port: u16) {
    let (handle, channels) = Handle::new(PeerAddr::Ip(host, port), Link::Outbound, Status::Ready);
    if !state.connections.try_register(handle.clone(), None) {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        debug!(target: "p2p", "Connecting to {}", handle.peer);
        let connected = tokio::task::spawn_blocking(move || connect(SocketAddr::new(host, port)))
            .await
            .unwrap_or_else(|join_error| Err(io::Error::new(io::ErrorKind::Other, join_error)));
        match connected {
            Ok(stream) => {
                info!(target: "p2p", "Established TCP connection to {}", handle.peer);
                handle.set_status(Status::Connected);
                Connection::from_parts(state, handle, channels, stream).run().await;
            }
            Err(err) => {
                warn!(target: "p2p", "Connection to {} failed: {}", handle.peer, err);
                handle.set_status(Status::Failed);
            }
        }
    });
}

fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.connect_timeout(&addr.into(), CONNECT_TIMEOUT)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
