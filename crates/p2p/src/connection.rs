//! Per-peer connection state machine.
//!
//! Each connection is a task owning a non-blocking socket, a receive
//! decoder and a send buffer, plus the bookkeeping sets driving object
//! exchange: `to_get` (vectors to request), `requested` (in flight) and
//! `to_send` (vectors the peer asked for). Other components talk to a
//! connection through its [`Handle`].

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume as chan;
use openssl::ssl::SslStream;
use tracing::{debug, error, info, warn};

use minode_types::{Message, NetAddr, NetAddrNoPrefix, Object, Vector, Version, PROTOCOL_VERSION, STREAM};

use crate::config::{DEFAULT_PORT, I2P_DEST_OBJ_TYPE, I2P_DEST_OBJ_VERSION, NETWORK_TIMEOUT, NODE_SSL, SERVICES, USER_AGENT};
use crate::error::DisconnectReason;
use crate::i2p::util::encode_dest;
use crate::pools::{Host, PeerAddr};
use crate::state::State;
use crate::stream::Decoder;
use crate::{tls, unix_now};

/// Delay between iterations of the connection loop.
const ITERATION_DELAY: Duration = Duration::from_millis(200);

/// Bytes read per call once fully established.
const READ_CHUNK: usize = 4096;

/// Stop draining the socket once this much is buffered unparsed.
const RECV_BUFFER_LIMIT: usize = 4_000_000;

/// Inventories are chunked to this many vectors so they do not time out
/// on very slow links.
pub const MAX_INV_COUNT: usize = 10_000;

/// No new `getdata` while this many vectors are in flight.
const MAX_PENDING_REQUESTS: usize = 100;

/// Vectors requested per `getdata`.
const GETDATA_COUNT: usize = 64;

/// Objects served per loop iteration.
const SEND_OBJECTS_COUNT: usize = 16;

/// Re-request a vector not answered within this many seconds.
const REQUEST_RETRY: u64 = 10 * 60;

/// Give up on a requested vector after this many seconds.
const REQUEST_EXPIRY: u64 = 15 * 60;

/// Seconds a connection may sit in handshake before it is dropped.
const HANDSHAKE_TIMEOUT: u64 = 30;

/// Seconds of send silence after which a keepalive goes out.
const KEEPALIVE_INTERVAL: u64 = 300;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Created, not yet connected (outbound dial in progress).
    Ready = 0,
    /// Socket up, handshake in progress.
    Connected = 1,
    /// Handshake complete and post-handshake burst drained.
    FullyEstablished = 2,
    /// Tear-down decided; the loop exits on its next iteration.
    Disconnecting = 3,
    /// Terminal: socket closed.
    Disconnected = 4,
    /// Terminal: the dial never succeeded.
    Failed = 5,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Connected,
            2 => Self::FullyEstablished,
            3 => Self::Disconnecting,
            4 => Self::Disconnected,
            _ => Self::Failed,
        }
    }
}

/// Direction of the connection. Servers accepted the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

impl Link {
    pub fn is_inbound(&self) -> bool {
        *self == Self::Inbound
    }

    pub fn is_outbound(&self) -> bool {
        *self == Self::Outbound
    }
}

/// Control events on the per-connection event channel, distinct from the
/// outbound message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Enter `fully_established` once both buffers have drained.
    FullyEstablished,
    /// Tear the connection down.
    Disconnect,
}

/// Shared face of a connection, registered in the connection set.
#[derive(Debug)]
pub struct Handle {
    pub peer: PeerAddr,
    pub link: Link,
    status: AtomicU8,
    remote_version: Mutex<Option<Version>>,
    messages: chan::Sender<Message>,
    control: chan::Sender<ControlEvent>,
}

pub(crate) struct Channels {
    pub(crate) messages: chan::Receiver<Message>,
    pub(crate) control: chan::Receiver<ControlEvent>,
}

impl Handle {
    pub(crate) fn new(peer: PeerAddr, link: Link, status: Status) -> (Arc<Self>, Channels) {
        let (messages_tx, messages_rx) = chan::unbounded();
        let (control_tx, control_rx) = chan::unbounded();
        let handle = Arc::new(Self {
            peer,
            link,
            status: AtomicU8::new(status as u8),
            remote_version: Mutex::new(None),
            messages: messages_tx,
            control: control_tx,
        });
        (
            handle,
            Channels {
                messages: messages_rx,
                control: control_rx,
            },
        )
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn is_fully_established(&self) -> bool {
        self.status() == Status::FullyEstablished
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status(), Status::Disconnected | Status::Failed)
    }

    /// Queue a message for this peer. Quietly dropped if the connection
    /// task already exited.
    pub fn send(&self, message: Message) {
        self.messages.send(message).ok();
    }

    pub fn control(&self, event: ControlEvent) {
        self.control.send(event).ok();
    }

    pub fn remote_version(&self) -> Option<Version> {
        self.remote_version
            .lock()
            .expect("version lock poisoned")
            .clone()
    }

    pub fn remote_services(&self) -> Option<u64> {
        self.remote_version
            .lock()
            .expect("version lock poisoned")
            .as_ref()
            .map(|version| version.services)
    }

    fn set_remote_version(&self, version: Version) {
        *self.remote_version.lock().expect("version lock poisoned") = Some(version);
    }

    pub fn host(&self) -> Host {
        self.peer.host()
    }
}

/// The set of connections, shared across components.
#[derive(Debug, Default)]
pub struct Connections {
    inner: Mutex<Vec<Arc<Handle>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("connection set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a connection; refused when a limit is given and reached.
    pub(crate) fn try_register(&self, handle: Arc<Handle>, limit: Option<usize>) -> bool {
        let mut inner = self.inner.lock().expect("connection set lock poisoned");
        if let Some(limit) = limit {
            if inner.len() > limit {
                return false;
            }
        }
        inner.push(handle);
        true
    }

    /// Copy of the set; callers iterate outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Handle>> {
        self.inner
            .lock()
            .expect("connection set lock poisoned")
            .clone()
    }

    /// Drop terminal connections from the set.
    pub fn reap(&self) -> usize {
        let mut inner = self.inner.lock().expect("connection set lock poisoned");
        let before = inner.len();
        inner.retain(|handle| !handle.is_dead());
        before - inner.len()
    }

    /// Hosts of all live connections, dials in progress included.
    pub fn hosts(&self) -> HashSet<Host> {
        self.inner
            .lock()
            .expect("connection set lock poisoned")
            .iter()
            .filter(|handle| !handle.is_dead())
            .map(|handle| handle.host())
            .collect()
    }

    /// Live outgoing connections, dials in progress included.
    pub fn outgoing_count(&self) -> usize {
        self.inner
            .lock()
            .expect("connection set lock poisoned")
            .iter()
            .filter(|handle| handle.link.is_outbound() && !handle.is_dead())
            .count()
    }
}

/// The socket under a connection, possibly upgraded to TLS.
enum PeerStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
    /// Placeholder while the TLS upgrade owns the socket.
    Closed,
}

impl PeerStream {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Self::Plain(stream) => Some(stream),
            Self::Tls(stream) => Some(stream.get_ref()),
            Self::Closed => None,
        }
    }

    fn shutdown(&self) {
        if let Some(stream) = self.tcp() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
    }
}

impl Read for PeerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
            Self::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Write for PeerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
            Self::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
            Self::Closed => Ok(()),
        }
    }
}

/// Outcome of one receive pass.
enum Recv {
    /// Bytes arrived, or a frame is already waiting to be parsed.
    Progress,
    /// Nothing to read; receive pressure is low.
    Idle,
    /// The peer performed an orderly shutdown.
    Closed,
    Failed(io::Error),
}

pub struct Connection {
    state: Arc<State>,
    handle: Arc<Handle>,
    channels: Channels,
    stream: PeerStream,
    decoder: Decoder,
    send_buf: Vec<u8>,
    to_get: HashSet<Vector>,
    to_send: HashSet<Vector>,
    requested: HashMap<Vector, u64>,
    verack_sent: bool,
    verack_received: bool,
    fully_established_pending: bool,
    tls: bool,
    last_rx: u64,
    last_tx: u64,
    rng: fastrand::Rng,
}

impl Connection {
    /// Spawn a connection task over an established socket. Returns `None`
    /// when the connection set is full.
    pub fn spawn(
        state: &Arc<State>,
        stream: TcpStream,
        peer: PeerAddr,
        link: Link,
        limit: Option<usize>,
    ) -> Option<Arc<Handle>> {
        let (handle, channels) = Handle::new(peer, link, Status::Connected);
        if !state.connections.try_register(handle.clone(), limit) {
            return None;
        }
        let connection = Self::from_parts(state.clone(), handle.clone(), channels, stream);
        tokio::spawn(connection.run());
        Some(handle)
    }

    pub(crate) fn from_parts(
        state: Arc<State>,
        handle: Arc<Handle>,
        channels: Channels,
        stream: TcpStream,
    ) -> Self {
        let now = unix_now();
        Self {
            state,
            handle,
            channels,
            stream: PeerStream::Plain(stream),
            decoder: Decoder::new(),
            send_buf: Vec::new(),
            to_get: HashSet::new(),
            to_send: HashSet::new(),
            requested: HashMap::new(),
            verack_sent: false,
            verack_received: false,
            fully_established_pending: false,
            tls: false,
            last_rx: now,
            last_tx: now,
            rng: fastrand::Rng::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        if self.handle.link.is_outbound() {
            self.enqueue_version();
        }
        loop {
            if self.state.shutting_down() {
                self.disconnecting(DisconnectReason::Shutdown);
            }
            if self.fully_established_pending
                && self.send_buf.is_empty()
                && self.decoder.is_empty()
                && self.verack_sent
                && self.verack_received
            {
                if let Err(reason) = self.establish().await {
                    self.disconnecting(reason);
                }
            }

            let outcome = self.receive();
            let idle = matches!(outcome, Recv::Idle);
            match outcome {
                Recv::Closed => self.disconnecting(DisconnectReason::PeerClosed),
                Recv::Failed(err) => self.disconnecting(err.into()),
                Recv::Progress | Recv::Idle => {}
            }

            self.drain_decoder();
            self.process_queues();
            self.flush();

            if self.handle.is_fully_established() && idle {
                self.request_objects();
                self.send_objects();
            }
            self.check_liveness();

            if self.handle.status() == Status::Disconnecting {
                break;
            }
            tokio::time::sleep(ITERATION_DELAY).await;
        }
        self.stream.shutdown();
        self.handle.set_status(Status::Disconnected);
        info!(target: "p2p", "Disconnected from {}", self.handle.peer);
    }

    fn receive(&mut self) -> Recv {
        let mut progressed = false;
        loop {
            let established = self.handle.is_fully_established();
            let want = if established {
                READ_CHUNK
            } else {
                // Read exactly up to the frame boundary so the handshake
                // is parsed one message at a time.
                match self.decoder.wanted() {
                    0 => return Recv::Progress,
                    wanted => wanted.min(65536),
                }
            };
            let mut buf = vec![0u8; want];
            match self.stream.read(&mut buf) {
                Ok(0) => return Recv::Closed,
                Ok(n) => {
                    self.decoder.input(&buf[..n]);
                    progressed = true;
                    if established && self.decoder.buffered() < RECV_BUFFER_LIMIT {
                        continue;
                    }
                    return Recv::Progress;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return if progressed { Recv::Progress } else { Recv::Idle };
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Recv::Failed(err),
            }
        }
    }

    fn drain_decoder(&mut self) {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(message)) => {
                    self.last_rx = unix_now();
                    if let Err(reason) = self.handle_message(message) {
                        self.disconnecting(reason);
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(
                        target: "p2p",
                        "Received malformed message from {}: {}", self.handle.peer, err
                    );
                    self.disconnecting(err.into());
                    return;
                }
            }
        }
    }

    fn process_queues(&mut self) {
        while let Ok(event) = self.channels.control.try_recv() {
            match event {
                ControlEvent::FullyEstablished => self.fully_established_pending = true,
                ControlEvent::Disconnect => self.disconnecting(DisconnectReason::Shutdown),
            }
        }
        while let Ok(message) = self.channels.messages.try_recv() {
            self.write_message(&message);
        }
    }

    fn write_message(&mut self, message: &Message) {
        if let Message::Inv(vectors) = message {
            if vectors.len() > MAX_INV_COUNT {
                let mut vectors = vectors.clone();
                self.rng.shuffle(&mut vectors);
                for chunk in vectors.chunks(MAX_INV_COUNT) {
                    self.write_message(&Message::Inv(chunk.to_vec()));
                }
                return;
            }
        }
        debug!(target: "p2p", "{} <- {}", self.handle.peer, message);
        self.send_buf.extend_from_slice(&message.to_bytes());
        self.last_tx = unix_now();
    }

    fn flush(&mut self) {
        if self.send_buf.is_empty() {
            return;
        }
        match self.stream.write(&self.send_buf) {
            Ok(written) => {
                self.send_buf.drain(..written);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!(target: "p2p", "Disconnecting from {}: {}", self.handle.peer, err);
                self.disconnecting(err.into());
            }
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<(), DisconnectReason> {
        match message {
            Message::Version(version) => return self.handle_version(version),
            Message::Verack => {
                debug!(target: "p2p", "{} -> verack", self.handle.peer);
                self.verack_received = true;
                if self.handle.link.is_inbound() {
                    self.handle.control(ControlEvent::FullyEstablished);
                }
            }
            Message::Inv(vectors) => {
                debug!(target: "p2p", "{} -> inv, count: {}", self.handle.peer, vectors.len());
                let mut wanted: HashSet<Vector> = vectors.iter().copied().collect();
                self.state.objects.retain_missing(&mut wanted);
                self.to_get.extend(wanted);
                // Do not send objects they already have.
                for vector in &vectors {
                    self.to_send.remove(vector);
                }
            }
            Message::GetData(vectors) => {
                debug!(target: "p2p", "{} -> getdata, count: {}", self.handle.peer, vectors.len());
                self.to_send.extend(vectors);
            }
            Message::Object(object) => self.handle_object(object),
            Message::Addr(addrs) => {
                debug!(target: "p2p", "{} -> addr, count: {}", self.handle.peer, addrs.len());
                for addr in addrs {
                    self.state.pools.add_unchecked_ip(addr.host, addr.port);
                }
            }
            Message::Ping(_) => {
                debug!(target: "p2p", "{} -> ping", self.handle.peer);
                self.write_message(&Message::Pong(Vec::new()));
            }
            Message::Pong(_) => {
                debug!(target: "p2p", "{} -> pong", self.handle.peer);
            }
            Message::Error(payload) => {
                error!(
                    target: "p2p",
                    "{} -> error: {}", self.handle.peer, String::from_utf8_lossy(&payload)
                );
            }
            unknown @ Message::Unknown { .. } => {
                debug!(target: "p2p", "{} -> {}", self.handle.peer, unknown);
            }
        }
        Ok(())
    }

    fn handle_version(&mut self, version: Version) -> Result<(), DisconnectReason> {
        debug!(
            target: "p2p",
            "{} -> version, protocol_version: {}, services: {}, user_agent: {}",
            self.handle.peer,
            version.protocol_version,
            version.services,
            String::from_utf8_lossy(&version.user_agent),
        );
        if version.nonce == self.state.nonce {
            return Err(DisconnectReason::SelfConnection);
        }
        if version.protocol_version != PROTOCOL_VERSION {
            return Err(DisconnectReason::ProtocolVersion(version.protocol_version));
        }

        self.write_message(&Message::Verack);
        self.verack_sent = true;

        if self.handle.link.is_outbound() {
            self.handle.control(ControlEvent::FullyEstablished);
            match &self.handle.peer {
                PeerAddr::Ip(host, port) => {
                    self.state
                        .advertise_addr(NetAddr::new(version.services, *host, *port, unix_now()));
                    self.state.pools.add_known_ip(*host, *port);
                }
                PeerAddr::I2p(dest) => {
                    self.state.pools.add_known_i2p(dest.clone());
                }
            }
        }
        // Advertise our own address as this peer sees it.
        if !self.handle.peer.is_i2p() && self.state.config.listen_for_connections {
            self.state.advertise_addr(NetAddr::new(
                SERVICES,
                version.receiver.host,
                self.state.config.listen_port,
                unix_now(),
            ));
        }
        self.handle.set_remote_version(version);

        if self.handle.link.is_inbound() {
            self.enqueue_version();
        }
        Ok(())
    }

    fn handle_object(&mut self, object: Object) {
        debug!(target: "p2p", "{} -> object, vector: {}", self.handle.peer, object.vector());
        let vector = object.vector();
        self.requested.remove(&vector);
        self.to_get.remove(&vector);

        let now = unix_now();
        match object.validate(now) {
            Ok(()) => {
                if self.state.objects.insert(object.clone()) {
                    self.state.advertise_vector(vector);
                    if object.object_type() == I2P_DEST_OBJ_TYPE
                        && object.version() == I2P_DEST_OBJ_VERSION
                    {
                        self.state.pools.add_unchecked_i2p(encode_dest(object.payload()));
                    }
                }
            }
            // Peers may be buggy, not hostile: drop without disconnecting.
            Err(reason) => {
                debug!(target: "p2p", "Invalid object {}, reason: {}", vector, reason);
            }
        }
    }

    fn enqueue_version(&mut self) {
        let (receiver_host, receiver_port) = match &self.handle.peer {
            PeerAddr::Ip(host, port) => (*host, *port),
            PeerAddr::I2p(_) => (IpAddr::from([127, 0, 0, 1]), 7656),
        };
        let version = Version {
            protocol_version: PROTOCOL_VERSION,
            services: SERVICES,
            timestamp: unix_now(),
            receiver: NetAddrNoPrefix::new(SERVICES, receiver_host, receiver_port),
            sender: NetAddrNoPrefix::new(SERVICES, IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT),
            nonce: self.state.nonce,
            user_agent: USER_AGENT.as_bytes().to_vec(),
            streams: vec![STREAM],
        };
        self.write_message(&Message::Version(version));
    }

    /// Run the post-handshake burst and enter `fully_established`.
    async fn establish(&mut self) -> Result<(), DisconnectReason> {
        self.fully_established_pending = false;
        let remote = self
            .handle
            .remote_version()
            .ok_or(DisconnectReason::Timeout("handshake"))?;

        if !self.handle.peer.is_i2p() && remote.services & NODE_SSL == NODE_SSL {
            debug!(target: "p2p", "Initializing TLS connection with {}", self.handle.peer);
            let plain = match std::mem::replace(&mut self.stream, PeerStream::Closed) {
                PeerStream::Plain(stream) => stream,
                other => {
                    self.stream = other;
                    return Err(DisconnectReason::Tls("socket already upgraded".into()));
                }
            };
            let upgraded = tls::upgrade(plain, self.handle.link.is_inbound()).await?;
            self.stream = PeerStream::Tls(upgraded);
            self.tls = true;
        }

        let now = unix_now();
        let mut addrs: HashSet<NetAddr> = HashSet::new();
        for connection in self.state.connections.snapshot() {
            if connection.link.is_outbound() && connection.is_fully_established() {
                if let PeerAddr::Ip(host, port) = &connection.peer {
                    if let Some(services) = connection.remote_services() {
                        addrs.insert(NetAddr::new(services, *host, *port, now));
                    }
                }
            }
        }
        for peer in self.state.pools.sample_known_ip(10, &mut self.rng) {
            if let PeerAddr::Ip(host, port) = peer {
                addrs.insert(NetAddr::new(1, host, port, now));
            }
        }
        for peer in self.state.pools.sample_unchecked_ip(10, &mut self.rng) {
            if let PeerAddr::Ip(host, port) = peer {
                addrs.insert(NetAddr::new(1, host, port, now));
            }
        }
        if !addrs.is_empty() {
            self.write_message(&Message::Addr(addrs.into_iter().collect()));
        }

        let mut vectors = self.state.objects.unexpired_vectors(now);
        if !vectors.is_empty() {
            self.rng.shuffle(&mut vectors);
            for chunk in vectors.chunks(MAX_INV_COUNT) {
                self.write_message(&Message::Inv(chunk.to_vec()));
            }
        }

        self.handle.set_status(Status::FullyEstablished);
        info!(
            target: "p2p",
            "Established Bitmessage protocol connection to {}{}",
            self.handle.peer,
            if self.tls { " (TLS)" } else { "" },
        );
        Ok(())
    }

    fn request_objects(&mut self) {
        if !self.to_get.is_empty() && self.requested.len() < MAX_PENDING_REQUESTS {
            self.state.objects.retain_missing(&mut self.to_get);
            if !self.to_get.is_empty() {
                let mut pack: Vec<Vector> = self.to_get.iter().copied().collect();
                self.rng.shuffle(&mut pack);
                pack.truncate(GETDATA_COUNT);

                let now = unix_now();
                for vector in &pack {
                    self.requested.insert(*vector, now);
                    self.to_get.remove(vector);
                }
                self.write_message(&Message::GetData(pack));
            }
        }
        if !self.requested.is_empty() {
            let now = unix_now();
            let objects = &self.state.objects;
            self.requested
                .retain(|vector, requested_at| {
                    !objects.has(vector) && *requested_at + REQUEST_EXPIRY > now
                });
            let stale: Vec<Vector> = self
                .requested
                .iter()
                .filter(|(_, requested_at)| **requested_at + REQUEST_RETRY < now)
                .map(|(vector, _)| *vector)
                .collect();
            self.to_get.extend(stale);
        }
    }

    fn send_objects(&mut self) {
        if self.to_send.is_empty() {
            return;
        }
        let mut pack: Vec<Vector> = self.to_send.iter().copied().collect();
        self.rng.shuffle(&mut pack);
        pack.truncate(SEND_OBJECTS_COUNT);
        for vector in &pack {
            self.to_send.remove(vector);
        }
        for object in self.state.objects.get_many(pack.iter()) {
            self.write_message(&Message::Object(object));
        }
    }

    fn check_liveness(&mut self) {
        let now = unix_now();
        let status = self.handle.status();
        if now.saturating_sub(self.last_rx) > NETWORK_TIMEOUT {
            self.disconnecting(DisconnectReason::Timeout("idle"));
        } else if now.saturating_sub(self.last_rx) > HANDSHAKE_TIMEOUT
            && status != Status::FullyEstablished
            && status != Status::Disconnecting
        {
            self.disconnecting(DisconnectReason::Timeout("handshake"));
        }
        if now.saturating_sub(self.last_tx) > KEEPALIVE_INTERVAL
            && status == Status::FullyEstablished
        {
            self.write_message(&Message::Pong(Vec::new()));
        }
    }

    fn disconnecting(&mut self, reason: DisconnectReason) {
        let status = self.handle.status();
        if status != Status::Disconnecting && status != Status::Disconnected {
            debug!(target: "p2p", "Disconnecting from {}: {}", self.handle.peer, reason);
            self.handle.set_status(Status::Disconnecting);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::{Ipv4Addr, TcpListener};

    fn test_connection(link: Link) -> (Connection, Arc<Handle>) {
        // A loopback socket pair; these tests never perform I/O on it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_accepted, _) = listener.accept().unwrap();

        let state = State::new(Config::default());
        let peer = PeerAddr::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 8444);
        let (handle, channels) = Handle::new(peer, link, Status::Connected);
        assert!(state.connections.try_register(handle.clone(), None));
        let connection = Connection::from_parts(state, handle.clone(), channels, stream);
        (connection, handle)
    }

    fn version(nonce: [u8; 8], protocol_version: u32) -> Version {
        Version {
            protocol_version,
            services: SERVICES,
            timestamp: unix_now(),
            receiver: NetAddrNoPrefix::new(SERVICES, IpAddr::V4(Ipv4Addr::LOCALHOST), 8444),
            sender: NetAddrNoPrefix::new(SERVICES, IpAddr::V4(Ipv4Addr::LOCALHOST), 8444),
            nonce,
            user_agent: b"MiNode-test".to_vec(),
            streams: vec![STREAM],
        }
    }

    fn sent_messages(connection: &Connection) -> Vec<Message> {
        let mut decoder = Decoder::new();
        decoder.input(&connection.send_buf);
        let mut messages = Vec::new();
        while let Some(message) = decoder.decode_next().unwrap() {
            messages.push(message);
        }
        messages
    }

    fn vector(i: u32) -> Vector {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&i.to_be_bytes());
        Vector(bytes)
    }

    #[test]
    fn oversized_inventories_are_chunked_exactly() {
        let (mut connection, _) = test_connection(Link::Outbound);
        let vectors: Vec<Vector> = (0..12_345).map(vector).collect();
        connection.write_message(&Message::Inv(vectors.clone()));

        let messages = sent_messages(&connection);
        assert_eq!(messages.len(), 2);

        let mut seen: HashSet<Vector> = HashSet::new();
        let mut total = 0;
        for message in messages {
            match message {
                Message::Inv(chunk) => {
                    assert!(chunk.len() <= MAX_INV_COUNT);
                    total += chunk.len();
                    seen.extend(chunk);
                }
                other => panic!("expected inv chunks, got {}", other),
            }
        }
        // The chunks partition the original set exactly.
        assert_eq!(total, vectors.len());
        assert_eq!(seen, vectors.into_iter().collect());
    }

    #[test]
    fn own_nonce_is_rejected_before_verack() {
        let (mut connection, _) = test_connection(Link::Inbound);
        let own_nonce = connection.state.nonce;
        let result =
            connection.handle_message(Message::Version(version(own_nonce, PROTOCOL_VERSION)));
        assert!(matches!(result, Err(DisconnectReason::SelfConnection)));
        assert!(!connection.verack_sent);
        assert!(connection.send_buf.is_empty());
    }

    #[test]
    fn foreign_protocol_version_is_rejected() {
        let (mut connection, _) = test_connection(Link::Inbound);
        let result = connection.handle_message(Message::Version(version([9; 8], 2)));
        assert!(matches!(result, Err(DisconnectReason::ProtocolVersion(2))));
        assert!(connection.send_buf.is_empty());
    }

    #[test]
    fn outbound_version_promotes_peer_and_schedules_establishment() {
        let (mut connection, handle) = test_connection(Link::Outbound);
        connection
            .handle_message(Message::Version(version([9; 8], PROTOCOL_VERSION)))
            .unwrap();

        assert!(connection.verack_sent);
        assert_eq!(
            connection.channels.control.try_recv(),
            Ok(ControlEvent::FullyEstablished)
        );
        assert_eq!(connection.state.pools.known_ip_len(), 1);
        assert!(handle.remote_version().is_some());
        assert!(connection.state.addr_advertise_queue().try_recv().is_ok());
    }

    #[test]
    fn inbound_version_replies_with_verack_then_version() {
        let (mut connection, _) = test_connection(Link::Inbound);
        connection
            .handle_message(Message::Version(version([9; 8], PROTOCOL_VERSION)))
            .unwrap();

        let messages = sent_messages(&connection);
        assert!(matches!(messages[0], Message::Verack));
        assert!(matches!(messages[1], Message::Version(_)));
        // Servers wait for the peer's verack before establishment.
        assert!(connection.channels.control.try_recv().is_err());
    }

    #[test]
    fn inv_skips_stored_vectors_and_prunes_to_send() {
        let (mut connection, _) = test_connection(Link::Outbound);
        let stored = Object::new([0; 8], unix_now() + 100, 42, 1, 1, b"stored".to_vec());
        connection.state.objects.insert(stored.clone());
        connection.to_send.insert(stored.vector());

        let fresh = vector(1);
        connection
            .handle_message(Message::Inv(vec![stored.vector(), fresh]))
            .unwrap();

        assert!(!connection.to_get.contains(&stored.vector()));
        assert!(connection.to_get.contains(&fresh));
        // Do not return what they already have.
        assert!(!connection.to_send.contains(&stored.vector()));
    }

    #[test]
    fn getdata_moves_vectors_into_requested() {
        let (mut connection, handle) = test_connection(Link::Outbound);
        handle.set_status(Status::FullyEstablished);
        for i in 0..100 {
            connection.to_get.insert(vector(i));
        }
        connection.request_objects();

        assert_eq!(connection.requested.len(), GETDATA_COUNT);
        assert_eq!(connection.to_get.len(), 100 - GETDATA_COUNT);
        let requested: HashSet<Vector> = connection.requested.keys().copied().collect();
        assert!(connection.to_get.is_disjoint(&requested));

        match sent_messages(&connection).as_slice() {
            [Message::GetData(vectors)] => assert_eq!(vectors.len(), GETDATA_COUNT),
            other => panic!("expected one getdata, got {} messages", other.len()),
        }
    }

    #[test]
    fn no_new_requests_while_too_many_in_flight() {
        let (mut connection, handle) = test_connection(Link::Outbound);
        handle.set_status(Status::FullyEstablished);
        let now = unix_now();
        for i in 0..MAX_PENDING_REQUESTS as u32 {
            connection.requested.insert(vector(i), now);
        }
        connection.to_get.insert(vector(10_000));
        connection.request_objects();

        assert!(connection.send_buf.is_empty());
        assert_eq!(connection.requested.len(), MAX_PENDING_REQUESTS);
        assert!(connection.to_get.contains(&vector(10_000)));
    }

    #[test]
    fn stale_requests_are_retried_then_abandoned() {
        let (mut connection, _) = test_connection(Link::Outbound);
        let now = unix_now();
        let retry = vector(1);
        let expired = vector(2);
        connection.requested.insert(retry, now - REQUEST_RETRY - 1);
        connection.requested.insert(expired, now - REQUEST_EXPIRY - 1);
        connection.request_objects();

        assert!(!connection.requested.contains_key(&expired));
        assert!(!connection.to_get.contains(&expired));
        assert!(connection.requested.contains_key(&retry));
        assert!(connection.to_get.contains(&retry));
    }

    #[test]
    fn getdata_is_served_from_the_store() {
        let (mut connection, _) = test_connection(Link::Outbound);
        let object = Object::new([0; 8], unix_now() + 100, 42, 1, 1, b"served".to_vec());
        connection.state.objects.insert(object.clone());

        connection
            .handle_message(Message::GetData(vec![object.vector(), vector(7)]))
            .unwrap();
        assert_eq!(connection.to_send.len(), 2);

        connection.send_objects();
        assert!(connection.to_send.is_empty());
        // Only the object we actually hold goes out.
        match sent_messages(&connection).as_slice() {
            [Message::Object(sent)] => assert_eq!(*sent, object),
            other => panic!("expected one object, got {} messages", other.len()),
        }
    }

    #[test]
    fn invalid_objects_are_dropped_without_disconnecting() {
        let (mut connection, handle) = test_connection(Link::Outbound);
        let unsealed = Object::new([0; 8], unix_now() + 100, 42, 1, 1, b"no pow".to_vec());
        connection.to_get.insert(unsealed.vector());
        connection.requested.insert(unsealed.vector(), unix_now());

        connection
            .handle_message(Message::Object(unsealed.clone()))
            .unwrap();

        assert!(!connection.state.objects.has(&unsealed.vector()));
        assert!(!connection.to_get.contains(&unsealed.vector()));
        assert!(!connection.requested.contains_key(&unsealed.vector()));
        assert_ne!(handle.status(), Status::Disconnecting);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let (mut connection, _) = test_connection(Link::Outbound);
        connection.handle_message(Message::Ping(Vec::new())).unwrap();
        assert!(matches!(
            sent_messages(&connection).as_slice(),
            [Message::Pong(_)]
        ));
    }
}
