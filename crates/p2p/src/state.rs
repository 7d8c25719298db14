//! Process-wide shared state.
//!
//! One [`State`] is created at startup and passed to every component.
//! It replaces ad-hoc global singletons: immutable configuration plus a
//! small number of typed concurrency-safe containers.

use std::sync::{Arc, RwLock};

use flume as chan;
use tokio_util::sync::CancellationToken;

use minode_types::{NetAddr, Vector};

use crate::config::Config;
use crate::connection::Connections;
use crate::objects::Objects;
use crate::pools::{Host, Pools};

/// A live I2P session, published by the controller once tunnels are up.
#[derive(Debug, Clone)]
pub struct I2pSession {
    /// Session nickname identifying our tunnels at the SAM bridge.
    pub nick: String,
    /// Our own destination, base64 with the I2P alphabet.
    pub dest_pub: String,
}

pub struct State {
    pub config: Config,
    /// Random bytes generated at startup; a peer presenting them back in
    /// its `version` is ourselves.
    pub nonce: [u8; 8],
    pub objects: Objects,
    pub pools: Pools,
    pub connections: Connections,
    pub shutdown: CancellationToken,
    pub i2p_session: RwLock<Option<I2pSession>>,

    vector_advertise_tx: chan::Sender<Vector>,
    vector_advertise_rx: chan::Receiver<Vector>,
    addr_advertise_tx: chan::Sender<NetAddr>,
    addr_advertise_rx: chan::Receiver<NetAddr>,
}

impl State {
    pub fn new(config: Config) -> Arc<Self> {
        let (vector_advertise_tx, vector_advertise_rx) = chan::unbounded();
        let (addr_advertise_tx, addr_advertise_rx) = chan::unbounded();

        Arc::new(Self {
            config,
            nonce: fastrand::u64(..).to_be_bytes(),
            objects: Objects::new(),
            pools: Pools::new(),
            connections: Connections::new(),
            shutdown: CancellationToken::new(),
            i2p_session: RwLock::new(None),
            vector_advertise_tx,
            vector_advertise_rx,
            addr_advertise_tx,
            addr_advertise_rx,
        })
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue a vector for fan-out to every established peer.
    pub fn advertise_vector(&self, vector: Vector) {
        self.vector_advertise_tx.send(vector).ok();
    }

    /// Queue an address record for fan-out to every established peer.
    pub fn advertise_addr(&self, addr: NetAddr) {
        self.addr_advertise_tx.send(addr).ok();
    }

    pub fn vector_advertise_queue(&self) -> &chan::Receiver<Vector> {
        &self.vector_advertise_rx
    }

    pub fn addr_advertise_queue(&self) -> &chan::Receiver<NetAddr> {
        &self.addr_advertise_rx
    }

    /// Whether a host is already connected or being dialed.
    pub fn host_busy(&self, host: &Host) -> bool {
        self.connections.hosts().contains(host)
    }

    /// Our own I2P destination, when the session is up.
    pub fn own_i2p_dest(&self) -> Option<String> {
        self.i2p_session
            .read()
            .expect("i2p session lock poisoned")
            .as_ref()
            .map(|session| session.dest_pub.clone())
    }

    pub fn set_i2p_session(&self, session: I2pSession) {
        *self.i2p_session.write().expect("i2p session lock poisoned") = Some(session);
    }
}
