//! Proof-of-work worker.
//!
//! The nonce search runs on dedicated OS threads, one per core, so the
//! hashing never starves the I/O tasks. The winning nonce travels back
//! over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flume as chan;
use tracing::{debug, info};

use minode_types::object::pow_trial_value;
use minode_types::Object;

use crate::state::State;
use crate::unix_now;

/// Find a nonce whose trial value meets `target`. Each thread strides
/// the nonce space from its own offset; the first hit wins.
pub fn find_nonce(target: u64, initial_hash: &[u8; 64]) -> u64 {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1);
    let found = Arc::new(AtomicBool::new(false));
    let (result_tx, result_rx) = chan::bounded(threads as usize);

    let mut workers = Vec::with_capacity(threads as usize);
    for offset in 0..threads {
        let found = found.clone();
        let result_tx = result_tx.clone();
        let initial_hash = *initial_hash;
        workers.push(std::thread::spawn(move || {
            let mut nonce = offset + 1;
            while !found.load(Ordering::Relaxed) {
                if pow_trial_value(nonce.to_be_bytes(), &initial_hash) <= target {
                    found.store(true, Ordering::Relaxed);
                    result_tx.send(nonce).ok();
                    return;
                }
                nonce += threads;
            }
        }));
    }
    drop(result_tx);

    let nonce = result_rx
        .recv()
        .expect("the nonce space always contains a solution");
    for worker in workers {
        worker.join().ok();
    }
    nonce
}

/// Seal a draft object (nonce left zero), insert it into the store and
/// queue its vector for advertisement. Runs out of band.
pub fn spawn(state: Arc<State>, draft: Object) {
    tokio::task::spawn_blocking(move || {
        let now = unix_now();
        let target = draft.pow_target(now);
        let initial_hash = draft.pow_initial_hash();
        debug!(target: "pow", "Starting nonce search, target: {}", target);

        let started = std::time::Instant::now();
        let nonce = find_nonce(target, &initial_hash);

        let object = Object::new(
            nonce.to_be_bytes(),
            draft.expires_time(),
            draft.object_type(),
            draft.version(),
            draft.stream_number(),
            draft.payload().to_vec(),
        );
        info!(
            target: "pow",
            "Finished nonce search, nonce: {}, time: {:.1}s, vector: {}",
            nonce,
            started.elapsed().as_secs_f64(),
            object.vector(),
        );
        if state.objects.insert(object.clone()) {
            state.advertise_vector(object.vector());
        }
    });
}
