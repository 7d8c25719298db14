//! TCP listeners, one per address family.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::connection::{Connection, Link};
use crate::pools::PeerAddr;
use crate::state::State;

/// How long to wait between accept attempts, so shutdown is observed.
const ACCEPT_POLL: Duration = Duration::from_secs(1);

pub struct Listener {
    state: Arc<State>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind a non-blocking listening socket with address reuse.
    pub fn bind(state: Arc<State>, host: IpAddr, port: u16) -> io::Result<Self> {
        let domain = if host.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        if host.is_ipv6() {
            // Both-family listeners share one port; keep this socket off
            // the v4 side.
            socket.set_only_v6(true)?;
        }
        socket.bind(&SocketAddr::new(host, port).into())?;
        socket.listen(1)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    /// The bound address; the port is resolved when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) {
        debug!(target: "net", "Listening for connections on {}", self.local_addr);
        loop {
            if self.state.shutting_down() {
                debug!(target: "net", "Shutting down listener on {}", self.local_addr);
                break;
            }
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!(target: "p2p", "Incoming connection from: {}", addr);
                    self.accept(stream, addr);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(ACCEPT_POLL).await;
                }
                Err(err) => {
                    warn!(target: "net", "Accept error: {}", err);
                    tokio::time::sleep(ACCEPT_POLL).await;
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let peer = PeerAddr::Ip(addr.ip(), addr.port());
        let limit = Some(self.state.config.connection_limit);
        // Over the limit, the socket is dropped and thereby closed.
        if Connection::spawn(&self.state, stream, peer, Link::Inbound, limit).is_none() {
            debug!(target: "p2p", "Connection limit reached, dropping connection from {}", addr);
        }
    }
}
