//! Peer choice
//!
//! Whenever several peers could serve a request, one is picked uniformly at
//! random. Ordering by latency or registration order would keep starving the
//! same peers.

use rand::seq::SliceRandom;

use crate::model::PeerId;

pub fn choose_one(candidates: &[PeerId]) -> Option<PeerId> {
    candidates.choose(&mut rand::thread_rng()).copied()
}

/// Up to `count` distinct peers, in random order.
pub fn choose_up_to(candidates: &[PeerId], count: usize) -> Vec<PeerId> {
    candidates
        .choose_multiple(&mut rand::thread_rng(), count)
        .copied()
        .collect()
}
