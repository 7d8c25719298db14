//! SAMv3 session owner.
//!
//! Creates the stream session every other I2P socket joins by nickname,
//! then answers the bridge's keep-alive pings until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::Error;
use crate::i2p::util::{self, hello, recv_reply, SamSocket};
use crate::state::State;

const BRIDGE_RETRY: Duration = Duration::from_secs(10);
const SESSION_RETRY: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct I2pController {
    state: Arc<State>,
    socket: SamSocket,
    /// Session nickname identifying our tunnels at the bridge.
    pub nick: String,
    /// Our public destination, I2P base64.
    pub dest_pub: String,
    /// The private key blob; persisted unless the session is transient.
    pub dest_priv: String,
}

impl I2pController {
    /// Connect to the SAM bridge and create the tunnel session.
    /// Retries until the bridge is reachable or shutdown begins.
    pub async fn start(state: Arc<State>, dest_priv: Option<String>) -> Result<Self, Error> {
        let sam_host = state.config.i2p_sam_host;
        let sam_port = state.config.i2p_sam_port;

        let mut socket = loop {
            if state.shutting_down() {
                return Err(Error::Sam("shutting down".into()));
            }
            match SamSocket::connect(sam_host, sam_port) {
                Ok(socket) => break socket,
                Err(err) => {
                    error!(
                        target: "i2p",
                        "Error while connecting to I2P SAM bridge: {}. Retrying.", err
                    );
                    tokio::time::sleep(BRIDGE_RETRY).await;
                }
            }
        };
        let version_reply = hello(&mut socket).await?;

        let (dest_priv, dest_pub) = match dest_priv {
            Some(key) => {
                let dest_pub = util::pub_from_priv(&key)?;
                debug!(target: "i2p", "Loaded I2P destination private key");
                (key, dest_pub)
            }
            None => generate_destination(&mut socket, &version_reply).await?,
        };

        let nick = format!("MiNode_{:08x}", fastrand::u32(..));
        let tunnel_length = state.config.i2p_tunnel_length;
        loop {
            socket
                .send_line(&format!(
                    "SESSION CREATE STYLE=STREAM ID={} inbound.length={} outbound.length={} DESTINATION={}",
                    nick, tunnel_length, tunnel_length, dest_priv
                ))
                .await?;
            let reply = recv_reply(&mut socket, REPLY_TIMEOUT).await?;
            if reply.contains("RESULT=OK") {
                break;
            }
            warn!(
                target: "i2p",
                "Could not create I2P session ({}), retrying in 5 seconds.", reply
            );
            tokio::time::sleep(SESSION_RETRY).await;
            if state.shutting_down() {
                return Err(Error::Sam("shutting down".into()));
            }
        }

        Ok(Self {
            state,
            socket,
            nick,
            dest_pub,
            dest_priv,
        })
    }

    /// Keep-alive loop: answer `PING` lines until shutdown closes the
    /// control socket.
    pub async fn run(mut self) {
        loop {
            if self.state.shutting_down() {
                debug!(target: "i2p", "Shutting down I2P controller");
                break;
            }
            match self.socket.recv_line(Some(Duration::from_secs(1))).await {
                Ok(Some(line)) => {
                    let mut parts = line.split(' ');
                    if parts.next() == Some("PING") {
                        let value = parts.next().unwrap_or("");
                        if let Err(err) =
                            self.socket.send_line(&format!("PONG {}", value)).await
                        {
                            warn!(target: "i2p", "SAM control socket error: {}", err);
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    if !self.state.shutting_down() {
                        warn!(target: "i2p", "SAM control socket error: {}", err);
                    }
                    break;
                }
            }
        }
    }
}

async fn generate_destination(
    socket: &mut SamSocket,
    version_reply: &str,
) -> Result<(String, String), Error> {
    // A 3.0-only bridge can only produce legacy DSA destinations.
    let command = if version_reply.contains("VERSION=3.0") {
        "DEST GENERATE"
    } else {
        "DEST GENERATE SIGNATURE_TYPE=EdDSA_SHA512_Ed25519"
    };
    socket.send_line(command).await?;
    let reply = recv_reply(socket, REPLY_TIMEOUT).await?;

    let mut dest_pub = None;
    let mut dest_priv = None;
    for part in reply.split(' ') {
        if let Some(value) = part.strip_prefix("PUB=") {
            dest_pub = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("PRIV=") {
            dest_priv = Some(value.to_string());
        }
    }
    match (dest_priv, dest_pub) {
        (Some(dest_priv), Some(dest_pub)) => Ok((dest_priv, dest_pub)),
        _ => Err(Error::Sam(format!("unusable DEST REPLY: {}", reply))),
    }
}
