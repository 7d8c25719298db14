//! Peer address pools.
//!
//! Addresses move from *unchecked* to *known* on the first successful
//! handshake; unchecked entries are consumed when dialed. Pools are
//! capped by uniform random down-sampling when snapshotted.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

/// Pool caps applied at snapshot time.
pub const KNOWN_IP_CAP: usize = 10_000;
pub const UNCHECKED_IP_CAP: usize = 1_000;
pub const KNOWN_I2P_CAP: usize = 1_000;
pub const UNCHECKED_I2P_CAP: usize = 100;

/// A dialable peer: an IP endpoint or a base64 I2P destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddr {
    Ip(IpAddr, u16),
    I2p(String),
}

impl PeerAddr {
    pub fn is_i2p(&self) -> bool {
        matches!(self, Self::I2p(_))
    }

    /// The host part, used to avoid duplicate connections to one machine.
    pub fn host(&self) -> Host {
        match self {
            Self::Ip(host, _) => Host::Ip(*host),
            Self::I2p(dest) => Host::I2p(dest.clone()),
        }
    }

    /// Short form for logs; I2P destinations are abbreviated.
    pub fn short(&self) -> String {
        match self {
            Self::Ip(host, port) => format!("{}:{}", host, port),
            Self::I2p(dest) => format!("{}…", &dest[..dest.len().min(8)]),
        }
    }
}

// Display is the abbreviated form; full destinations would drown the logs.
impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Host identity of a peer, without the port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    I2p(String),
}

/// The four shared peer pools.
#[derive(Debug, Default)]
pub struct Pools {
    ip_known: Mutex<HashSet<PeerAddr>>,
    ip_unchecked: Mutex<HashSet<PeerAddr>>,
    i2p_known: Mutex<HashSet<PeerAddr>>,
    i2p_unchecked: Mutex<HashSet<PeerAddr>>,
}

#[derive(Serialize, Deserialize)]
struct PoolSnapshot {
    version: u32,
    peers: Vec<PeerAddr>,
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_known_ip(&self, host: IpAddr, port: u16) {
        self.ip_known
            .lock()
            .expect("pool lock poisoned")
            .insert(PeerAddr::Ip(host, port));
    }

    pub fn add_unchecked_ip(&self, host: IpAddr, port: u16) {
        self.ip_unchecked
            .lock()
            .expect("pool lock poisoned")
            .insert(PeerAddr::Ip(host, port));
    }

    pub fn add_known_i2p(&self, dest: String) {
        self.i2p_known
            .lock()
            .expect("pool lock poisoned")
            .insert(PeerAddr::I2p(dest));
    }

    pub fn add_unchecked_i2p(&self, dest: String) {
        self.i2p_unchecked
            .lock()
            .expect("pool lock poisoned")
            .insert(PeerAddr::I2p(dest));
    }

    pub fn known_ip_len(&self) -> usize {
        self.ip_known.lock().expect("pool lock poisoned").len()
    }

    /// Up to `n` random entries from the known-IP pool.
    pub fn sample_known_ip(&self, n: usize, rng: &mut fastrand::Rng) -> Vec<PeerAddr> {
        sample(&self.ip_known, n, rng, false)
    }

    /// Up to `n` random entries from the unchecked-IP pool.
    pub fn sample_unchecked_ip(&self, n: usize, rng: &mut fastrand::Rng) -> Vec<PeerAddr> {
        sample(&self.ip_unchecked, n, rng, false)
    }

    /// Dial candidates per the manager's selection rule: unchecked
    /// entries are removed from their pool, known entries are not.
    pub fn sample_for_dialing(
        &self,
        ip: bool,
        i2p: bool,
        rng: &mut fastrand::Rng,
    ) -> HashSet<PeerAddr> {
        let mut candidates = HashSet::new();
        if ip {
            candidates.extend(sample(&self.ip_unchecked, 16, rng, true));
            candidates.extend(sample(&self.ip_known, 8, rng, false));
        }
        if i2p {
            candidates.extend(sample(&self.i2p_unchecked, 16, rng, true));
            candidates.extend(sample(&self.i2p_known, 8, rng, false));
        }
        candidates
    }

    /// Reduce every pool to its cap by uniform random sampling.
    pub fn cap(&self, rng: &mut fastrand::Rng) {
        cap(&self.ip_known, KNOWN_IP_CAP, rng);
        cap(&self.ip_unchecked, UNCHECKED_IP_CAP, rng);
        cap(&self.i2p_known, KNOWN_I2P_CAP, rng);
        cap(&self.i2p_unchecked, UNCHECKED_I2P_CAP, rng);
    }

    /// Persist the known pools. Unchecked peers are rediscovered.
    pub fn save(&self, data_dir: &Path) -> Result<(), Error> {
        save_pool(&self.ip_known, &data_dir.join("nodes.cbor"))?;
        save_pool(&self.i2p_known, &data_dir.join("i2p_nodes.cbor"))?;
        debug!(target: "p2p", "Saved nodes");
        Ok(())
    }

    pub fn load(&self, data_dir: &Path) {
        load_pool(&self.ip_known, &data_dir.join("nodes.cbor"));
        load_pool(&self.i2p_known, &data_dir.join("i2p_nodes.cbor"));
    }
}

fn sample(
    pool: &Mutex<HashSet<PeerAddr>>,
    n: usize,
    rng: &mut fastrand::Rng,
    remove: bool,
) -> Vec<PeerAddr> {
    let mut pool = pool.lock().expect("pool lock poisoned");
    let mut entries: Vec<PeerAddr> = pool.iter().cloned().collect();
    rng.shuffle(&mut entries);
    entries.truncate(n);
    if remove {
        for entry in &entries {
            pool.remove(entry);
        }
    }
    entries
}

fn cap(pool: &Mutex<HashSet<PeerAddr>>, cap: usize, rng: &mut fastrand::Rng) {
    let mut pool = pool.lock().expect("pool lock poisoned");
    if pool.len() <= cap {
        return;
    }
    let mut entries: Vec<PeerAddr> = pool.drain().collect();
    rng.shuffle(&mut entries);
    entries.truncate(cap);
    pool.extend(entries);
}

fn save_pool(pool: &Mutex<HashSet<PeerAddr>>, path: &Path) -> Result<(), Error> {
    let snapshot = PoolSnapshot {
        version: 1,
        peers: pool
            .lock()
            .expect("pool lock poisoned")
            .iter()
            .cloned()
            .collect(),
    };
    let file = std::fs::File::create(path).map_err(|e| Error::Persist(e.to_string()))?;
    ciborium::into_writer(&snapshot, file).map_err(|e| Error::Persist(e.to_string()))
}

fn load_pool(pool: &Mutex<HashSet<PeerAddr>>, path: &Path) {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return,
    };
    match ciborium::from_reader::<PoolSnapshot, _>(file) {
        Ok(snapshot) => {
            pool.lock()
                .expect("pool lock poisoned")
                .extend(snapshot.peers);
        }
        Err(err) => {
            tracing::warn!(target: "p2p", "Error while loading nodes from {:?}: {}", path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(i: u16) -> (IpAddr, u16) {
        (IpAddr::V4(Ipv4Addr::new(10, 0, (i >> 8) as u8, i as u8)), 8444)
    }

    #[test]
    fn dial_sampling_consumes_unchecked_but_not_known() {
        let pools = Pools::new();
        let mut rng = fastrand::Rng::with_seed(7);
        for i in 0..30 {
            let (host, port) = addr(i);
            pools.add_unchecked_ip(host, port);
        }
        for i in 100..110 {
            let (host, port) = addr(i);
            pools.add_known_ip(host, port);
        }

        let candidates = pools.sample_for_dialing(true, false, &mut rng);
        assert_eq!(candidates.len(), 16 + 8);
        assert_eq!(
            pools.ip_unchecked.lock().unwrap().len(),
            30 - 16,
            "chosen unchecked entries leave their pool"
        );
        assert_eq!(pools.known_ip_len(), 10, "known entries stay");
    }

    #[test]
    fn capping_reduces_to_the_limit() {
        let pools = Pools::new();
        let mut rng = fastrand::Rng::with_seed(7);
        for i in 0..(UNCHECKED_I2P_CAP + 50) {
            pools.add_unchecked_i2p(format!("dest{}", i));
        }
        pools.cap(&mut rng);
        assert_eq!(
            pools.i2p_unchecked.lock().unwrap().len(),
            UNCHECKED_I2P_CAP
        );
    }

    #[test]
    fn known_pools_round_trip_through_snapshots() {
        let dir = std::env::temp_dir().join(format!("minode-pools-{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();

        let pools = Pools::new();
        let (host, port) = addr(1);
        pools.add_known_ip(host, port);
        pools.add_known_i2p("destination".into());
        pools.save(&dir).unwrap();

        let restored = Pools::new();
        restored.load(&dir);
        assert_eq!(restored.known_ip_len(), 1);
        assert_eq!(restored.i2p_known.lock().unwrap().len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
