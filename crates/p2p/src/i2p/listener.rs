//! Inbound I2P streams.
//!
//! Each accept socket is parked in `STREAM ACCEPT` until a peer arrives;
//! the first line names the peer's destination, after which the socket
//! carries protocol traffic and a fresh accept socket is opened.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{Connection, Link};
use crate::error::Error;
use crate::i2p::util::{hello, recv_reply, SamSocket};
use crate::pools::{Host, PeerAddr};
use crate::state::State;

const ACCEPT_RETRY: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct I2pListener {
    state: Arc<State>,
    nick: String,
}

impl I2pListener {
    pub fn new(state: Arc<State>, nick: String) -> Self {
        Self { state, nick }
    }

    pub async fn run(self) {
        loop {
            if self.state.shutting_down() {
                debug!(target: "i2p", "Shutting down I2P listener");
                break;
            }
            if let Err(err) = self.accept_one().await {
                if !self.state.shutting_down() {
                    warn!(target: "i2p", "I2P accept error: {}", err);
                }
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }

    async fn accept_one(&self) -> Result<(), Error> {
        let mut socket =
            SamSocket::connect(self.state.config.i2p_sam_host, self.state.config.i2p_sam_port)?;
        hello(&mut socket).await?;
        socket
            .send_line(&format!("STREAM ACCEPT ID={}", self.nick))
            .await?;
        let reply = recv_reply(&mut socket, REPLY_TIMEOUT).await?;
        if !reply.contains("RESULT=OK") {
            return Err(Error::Sam(reply));
        }

        // Park until a peer shows up; its destination is the first line.
        let destination = loop {
            if self.state.shutting_down() {
                return Ok(());
            }
            match socket.recv_line(Some(Duration::from_secs(1))).await? {
                Some(line) => {
                    break line
                        .split(' ')
                        .next()
                        .unwrap_or_default()
                        .to_string()
                }
                None => continue,
            }
        };
        if destination.is_empty() {
            return Err(Error::Sam("empty destination line".into()));
        }

        info!(
            target: "i2p",
            "Incoming I2P connection from: {}…", &destination[..destination.len().min(8)]
        );
        if self.state.host_busy(&Host::I2p(destination.clone()))
            || self.state.own_i2p_dest().as_deref() == Some(destination.as_str())
        {
            debug!(target: "i2p", "Rejecting duplicate I2P connection");
            return Ok(());
        }
        if Connection::spawn(
            &self.state,
            socket.into_stream(),
            PeerAddr::I2p(destination),
            Link::Inbound,
            Some(self.state.config.connection_limit),
        )
        .is_none()
        {
            debug!(target: "i2p", "Connection limit reached, dropping I2P connection");
        }
        Ok(())
    }
}
