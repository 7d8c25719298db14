//! Inventory and address fan-out.
//!
//! Drains the two advertise queues in batches and multicasts the result
//! to every fully established connection. Connections chunk oversized
//! inventories themselves.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use minode_types::{Message, NetAddr, Vector};

use crate::state::State;

const CYCLE: Duration = Duration::from_millis(400);

pub struct Advertiser {
    state: Arc<State>,
}

impl Advertiser {
    pub fn new(state: Arc<State>) -> Self {
        Self { state }
    }

    pub async fn run(self) {
        loop {
            tokio::time::sleep(CYCLE).await;
            if self.state.shutting_down() {
                debug!(target: "p2p", "Shutting down Advertiser");
                break;
            }
            self.advertise_vectors();
            self.advertise_addrs();
        }
    }

    fn advertise_vectors(&self) {
        let mut vectors: HashSet<Vector> = HashSet::new();
        while let Ok(vector) = self.state.vector_advertise_queue().try_recv() {
            vectors.insert(vector);
        }
        if vectors.is_empty() {
            return;
        }
        let vectors: Vec<Vector> = vectors.into_iter().collect();
        for connection in self.state.connections.snapshot() {
            if connection.is_fully_established() {
                connection.send(Message::Inv(vectors.clone()));
            }
        }
    }

    fn advertise_addrs(&self) {
        let mut addrs: HashSet<NetAddr> = HashSet::new();
        while let Ok(addr) = self.state.addr_advertise_queue().try_recv() {
            addrs.insert(addr);
        }
        if addrs.is_empty() {
            return;
        }
        let addrs: Vec<NetAddr> = addrs.into_iter().collect();
        for connection in self.state.connections.snapshot() {
            if connection.is_fully_established() {
                connection.send(Message::Addr(addrs.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::{Handle, Link, Status};
    use crate::pools::PeerAddr;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn multicasts_only_to_established_connections() {
        let state = State::new(Config::default());
        let advertiser = Advertiser::new(state.clone());

        let (established, established_channels) = Handle::new(
            PeerAddr::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8444),
            Link::Outbound,
            Status::Connected,
        );
        established.set_status(Status::FullyEstablished);
        let (pending, pending_channels) = Handle::new(
            PeerAddr::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 8444),
            Link::Inbound,
            Status::Connected,
        );
        assert!(state.connections.try_register(established, None));
        assert!(state.connections.try_register(pending, None));

        let vector = Vector([9; 32]);
        state.advertise_vector(vector);
        advertiser.advertise_vectors();

        match established_channels.messages.try_recv() {
            Ok(Message::Inv(vectors)) => assert_eq!(vectors, vec![vector]),
            other => panic!("expected an inv, got {:?}", other),
        }
        assert!(pending_channels.messages.try_recv().is_err());
    }

    #[test]
    fn empty_queues_send_nothing() {
        let state = State::new(Config::default());
        let advertiser = Advertiser::new(state.clone());

        let (handle, channels) = Handle::new(
            PeerAddr::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 8444),
            Link::Outbound,
            Status::Connected,
        );
        handle.set_status(Status::FullyEstablished);
        assert!(state.connections.try_register(handle, None));

        advertiser.advertise_vectors();
        advertiser.advertise_addrs();
        assert!(channels.messages.try_recv().is_err());
    }
}
