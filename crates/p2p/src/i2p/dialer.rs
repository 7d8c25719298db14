//! Outbound I2P streams.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::{Connection, Handle, Link, Status};
use crate::error::Error;
use crate::i2p::util::{hello, recv_reply, SamSocket};
use crate::pools::PeerAddr;
use crate::state::State;

/// Tunnel establishment can be slow; give stream connects extra room.
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Open a stream to `destination` through our session and run a client
/// connection over it.
pub fn spawn(state: &Arc<State>, destination: String, nick: String) {
    let peer = PeerAddr::I2p(destination.clone());
    let (handle, channels) = Handle::new(peer, Link::Outbound, Status::Ready);
    if !state.connections.try_register(handle.clone(), None) {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        debug!(target: "i2p", "Connecting to {}", handle.peer);
        match connect(&state, &destination, &nick).await {
            Ok(stream) => {
                handle.set_status(Status::Connected);
                Connection::from_parts(state, handle, channels, stream).run().await;
            }
            Err(err) => {
                warn!(target: "i2p", "Error while connecting to {}: {}", handle.peer, err);
                handle.set_status(Status::Failed);
            }
        }
    });
}

async fn connect(state: &Arc<State>, destination: &str, nick: &str) -> Result<TcpStream, Error> {
    let mut socket = SamSocket::connect(state.config.i2p_sam_host, state.config.i2p_sam_port)?;
    hello(&mut socket).await?;
    socket
        .send_line(&format!(
            "STREAM CONNECT ID={} DESTINATION={}",
            nick, destination
        ))
        .await?;
    let reply = recv_reply(&mut socket, CONNECT_REPLY_TIMEOUT).await?;
    if !reply.contains("RESULT=OK") {
        return Err(Error::Sam(reply));
    }
    Ok(socket.into_stream())
}
