//! Periodic maintenance: reaping, dialing, expiry and persistence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use minode_types::{Object, STREAM};

use crate::config::{I2P_DEST_OBJ_TYPE, I2P_DEST_OBJ_VERSION};
use crate::i2p;
use crate::pools::PeerAddr;
use crate::state::State;
use crate::{dialer, pow, unix_now};

const TICK: Duration = Duration::from_millis(800);

const CLEAN_OBJECTS_INTERVAL: u64 = 90;
const CLEAN_CONNECTIONS_INTERVAL: u64 = 2;
const SAVE_OBJECTS_INTERVAL: u64 = 100;
const SAVE_NODES_INTERVAL: u64 = 60;
const PUBLISH_DESTINATION_INTERVAL: u64 = 3600;

pub struct Manager {
    state: Arc<State>,
    rng: fastrand::Rng,
    last_cleaned_objects: u64,
    last_cleaned_connections: u64,
    last_saved_objects: u64,
    last_saved_nodes: u64,
    last_published_i2p_destination: u64,
}

impl Manager {
    pub fn new(state: Arc<State>) -> Self {
        let now = unix_now();
        let mut rng = fastrand::Rng::new();
        // The first destination publish lands 5 to 15 minutes after
        // start, once tunnels have settled.
        let first_publish =
            now - PUBLISH_DESTINATION_INTERVAL + 10 * 60 + rng.u64(0..600) - 300;
        Self {
            state,
            rng,
            last_cleaned_objects: now,
            last_cleaned_connections: now,
            last_saved_objects: now,
            last_saved_nodes: now,
            last_published_i2p_destination: first_publish,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::time::sleep(TICK).await;
            if self.state.shutting_down() {
                debug!(target: "p2p", "Shutting down Manager");
                break;
            }
            let now = unix_now();
            if now - self.last_cleaned_connections > CLEAN_CONNECTIONS_INTERVAL {
                self.manage_connections();
                self.last_cleaned_connections = now;
            }
            if now - self.last_cleaned_objects > CLEAN_OBJECTS_INTERVAL {
                self.state.objects.remove_expired(now);
                self.last_cleaned_objects = now;
            }
            if now - self.last_saved_objects > SAVE_OBJECTS_INTERVAL {
                if let Err(err) = self.state.objects.save(&self.state.config.data_dir) {
                    warn!(target: "p2p", "Error while saving objects: {}", err);
                }
                self.last_saved_objects = now;
            }
            if now - self.last_saved_nodes > SAVE_NODES_INTERVAL {
                self.state.pools.cap(&mut self.rng);
                if let Err(err) = self.state.pools.save(&self.state.config.data_dir) {
                    warn!(target: "p2p", "Error while saving nodes: {}", err);
                }
                self.last_saved_nodes = now;
            }
            if now - self.last_published_i2p_destination > PUBLISH_DESTINATION_INTERVAL {
                self.publish_i2p_destination();
                self.last_published_i2p_destination = now;
            }
        }
    }

    /// Reap dead connections and decide whom to dial.
    fn manage_connections(&mut self) {
        let state = &self.state;
        state.connections.reap();

        let mut to_connect: HashSet<PeerAddr> = HashSet::new();
        if let Some(peer) = &state.config.trusted_peer {
            to_connect.insert(peer.clone());
        }
        if state.connections.outgoing_count() < state.config.outgoing_limit
            && state.config.send_outgoing_connections
            && state.config.trusted_peer.is_none()
        {
            to_connect.extend(state.pools.sample_for_dialing(
                state.config.ip_enabled,
                state.config.i2p_enabled,
                &mut self.rng,
            ));
        }
        if to_connect.is_empty() {
            return;
        }

        let hosts = state.connections.hosts();
        let own_dest = state.own_i2p_dest();
        for peer in to_connect {
            if hosts.contains(&peer.host()) {
                continue;
            }
            match &peer {
                PeerAddr::Ip(host, port) => dialer::spawn(state, *host, *port),
                PeerAddr::I2p(dest) => {
                    if Some(dest) == own_dest.as_ref() || !state.config.i2p_enabled {
                        continue;
                    }
                    match state
                        .i2p_session
                        .read()
                        .expect("i2p session lock poisoned")
                        .clone()
                    {
                        Some(session) => i2p::dialer::spawn(state, dest.clone(), session.nick),
                        None => debug!(
                            target: "i2p",
                            "We were going to connect to an I2P peer but our tunnels are not ready"
                        ),
                    }
                }
            }
        }
    }

    /// Publish our own I2P destination as a proof-of-work sealed object.
    fn publish_i2p_destination(&self) {
        if self.state.config.i2p_transient {
            return;
        }
        let Some(session) = self
            .state
            .i2p_session
            .read()
            .expect("i2p session lock poisoned")
            .clone()
        else {
            return;
        };
        info!(target: "i2p", "Publishing our I2P destination");
        match i2p::util::decode_dest(&session.dest_pub) {
            Ok(raw) => {
                let draft = Object::new(
                    [0; 8],
                    unix_now() + 2 * 3600,
                    I2P_DEST_OBJ_TYPE,
                    I2P_DEST_OBJ_VERSION,
                    STREAM,
                    raw,
                );
                pow::spawn(self.state.clone(), draft);
            }
            Err(err) => {
                warn!(target: "i2p", "Our own destination does not decode: {}", err);
            }
        }
    }
}
