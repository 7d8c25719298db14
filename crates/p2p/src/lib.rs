//! Peer-to-peer engine of the Bitmessage object-relay node.
//!
//! The node gossips proof-of-work sealed, time-limited objects so that
//! every honest peer converges on the same set. Components are
//! long-running tasks sharing a single [`state::State`] context: per-peer
//! [`connection`] state machines, TCP and I2P [`listener`]s, a periodic
//! [`manager`], the inventory [`advertiser`] and the [`pow`] worker.

pub mod advertiser;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod i2p;
pub mod listener;
pub mod manager;
pub mod node;
pub mod objects;
pub mod pools;
pub mod pow;
pub mod state;
pub mod stream;
pub mod tls;

/// Seconds since the Unix epoch. All protocol timestamps are in these.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}
