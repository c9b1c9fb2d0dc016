//! Gossip-based peer sampler in the CYCLON style.
//!
//! Keeps a bounded cache of `(peer, age)` descriptors and periodically
//! shuffles a random subset with the oldest known peer, so the cache converges
//! to a uniform sample of the overlay. The repair orchestrator only consumes
//! [`State::random_peer`]; cache size, shuffle length and cycle interval are
//! configuration. Bootstrap happens through known hosts and neighbourhood
//! change notifications.

use std::collections::VecDeque;
use std::time::Duration;

use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::proto::PeerId;

/// Sampler tuning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of cached peer descriptors.
    pub cache_size: usize,
    /// Descriptors exchanged per shuffle.
    pub shuffle_length: usize,
    /// Interval between shuffles.
    pub shuffle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_size: 16,
            shuffle_length: 8,
            shuffle_interval: Duration::from_secs(30),
        }
    }
}

/// Shuffle traffic between samplers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<PA> {
    /// A random subset of the sender's cache, sent to its oldest peer.
    Shuffle { nodes: Vec<PA> },
    /// The answering subset.
    ShuffleReply { nodes: Vec<PA> },
}

/// The sampler's only timer: the shuffle cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Shuffle,
}

/// Input event.
#[derive(Debug)]
pub enum InEvent<PA> {
    RecvMessage(PA, Message<PA>),
    TimerExpired(Timer),
    /// Seed the cache (bootstrap or neighbourhood change).
    AddPeers(Vec<PA>),
    /// Drop a peer known to be gone.
    RemovePeer(PA),
}

/// Output event.
#[derive(Debug)]
pub enum OutEvent<PA> {
    SendMessage(PA, Message<PA>),
    ScheduleTimer(Duration, Timer),
}

/// Sampler state. Pure: all IO goes through the event queue.
#[derive(Debug)]
pub struct State<PA, R> {
    me: PA,
    cache: IndexMap<PA, u8>,
    /// Subset sent in the outstanding shuffle, preferred for eviction when
    /// the reply arrives.
    last_sent: Vec<PA>,
    config: Config,
    rng: R,
}

impl<PA: PeerId, R: Rng> State<PA, R> {
    pub fn new(me: PA, config: Config, rng: R) -> Self {
        State {
            me,
            cache: IndexMap::new(),
            last_sent: Vec::new(),
            config,
            rng,
        }
    }

    /// A uniformly random known peer.
    pub fn random_peer(&mut self) -> Option<PA> {
        if self.cache.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.cache.len());
        self.cache.get_index(index).map(|(peer, _)| *peer)
    }

    /// All currently known peers.
    pub fn peers(&self) -> impl Iterator<Item = &PA> {
        self.cache.keys()
    }

    pub fn handle(&mut self, event: InEvent<PA>, io: &mut VecDeque<OutEvent<PA>>) {
        match event {
            InEvent::AddPeers(peers) => {
                for peer in peers {
                    self.add_peer(peer, &[]);
                }
            }
            InEvent::RemovePeer(peer) => {
                self.cache.shift_remove(&peer);
            }
            InEvent::TimerExpired(Timer::Shuffle) => {
                self.shuffle(io);
                io.push_back(OutEvent::ScheduleTimer(
                    self.config.shuffle_interval,
                    Timer::Shuffle,
                ));
            }
            InEvent::RecvMessage(from, Message::Shuffle { nodes }) => {
                let reply = self.random_subset(Some(&from));
                io.push_back(OutEvent::SendMessage(
                    from,
                    Message::ShuffleReply { nodes: reply },
                ));
                for peer in nodes {
                    self.add_peer(peer, &[]);
                }
                self.add_peer(from, &[]);
            }
            InEvent::RecvMessage(_, Message::ShuffleReply { nodes }) => {
                let sent = std::mem::take(&mut self.last_sent);
                for peer in nodes {
                    self.add_peer(peer, &sent);
                }
            }
        }
    }

    /// One CYCLON cycle: age the cache, pick the oldest peer, trade subsets.
    fn shuffle(&mut self, io: &mut VecDeque<OutEvent<PA>>) {
        for age in self.cache.values_mut() {
            *age = age.saturating_add(1);
        }
        let oldest = self
            .cache
            .iter()
            .max_by_key(|(_, age)| **age)
            .map(|(peer, _)| *peer);
        let Some(target) = oldest else {
            return;
        };
        self.cache.shift_remove(&target);
        let mut nodes = self.random_subset(Some(&target));
        nodes.truncate(self.config.shuffle_length.saturating_sub(1));
        // our own fresh descriptor rides along
        nodes.push(self.me);
        self.last_sent = nodes.clone();
        trace!(?target, n = nodes.len(), "sampler shuffle");
        io.push_back(OutEvent::SendMessage(target, Message::Shuffle { nodes }));
    }

    fn random_subset(&mut self, without: Option<&PA>) -> Vec<PA> {
        let mut peers: Vec<PA> = self
            .cache
            .keys()
            .filter(|p| Some(*p) != without)
            .copied()
            .collect();
        peers.shuffle(&mut self.rng);
        peers.truncate(self.config.shuffle_length);
        peers
    }

    /// Insert a fresh descriptor, evicting first from `replaceable` (the
    /// descriptors we shipped out), then the oldest entry.
    fn add_peer(&mut self, peer: PA, replaceable: &[PA]) {
        if peer == self.me || self.cache.contains_key(&peer) {
            return;
        }
        if self.cache.len() >= self.config.cache_size {
            let victim = replaceable
                .iter()
                .find(|p| self.cache.contains_key(*p))
                .copied()
                .or_else(|| {
                    self.cache
                        .iter()
                        .max_by_key(|(_, age)| **age)
                        .map(|(p, _)| *p)
                });
            if let Some(victim) = victim {
                self.cache.shift_remove(&victim);
            }
        }
        self.cache.insert(peer, 0);
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand_core::SeedableRng;

    use super::*;

    fn state(me: u32, seed: u64) -> State<u32, StdRng> {
        State::new(me, Config::default(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn seeds_and_samples() {
        let mut s = state(0, 1);
        assert!(s.random_peer().is_none());
        let mut io = VecDeque::new();
        s.handle(InEvent::AddPeers(vec![1, 2, 3, 0]), &mut io);
        // never caches itself
        assert!(s.peers().all(|p| *p != 0));
        let peer = s.random_peer().unwrap();
        assert!([1, 2, 3].contains(&peer));
    }

    #[test]
    fn shuffle_targets_oldest_and_reschedules() {
        let mut s = state(0, 2);
        let mut io = VecDeque::new();
        s.handle(InEvent::AddPeers(vec![1, 2]), &mut io);
        s.handle(InEvent::TimerExpired(Timer::Shuffle), &mut io);
        let mut sent = None;
        let mut rescheduled = false;
        for event in io.drain(..) {
            match event {
                OutEvent::SendMessage(to, Message::Shuffle { nodes }) => {
                    assert!(nodes.contains(&0), "own descriptor rides along");
                    sent = Some(to);
                }
                OutEvent::ScheduleTimer(_, Timer::Shuffle) => rescheduled = true,
                _ => {}
            }
        }
        let target = sent.expect("shuffle sent");
        assert!(rescheduled);
        // the target was removed from the cache pending its reply
        assert!(s.peers().all(|p| *p != target));
    }

    #[test]
    fn shuffle_reply_merges_nodes() {
        let mut a = state(0, 3);
        let mut io = VecDeque::new();
        a.handle(InEvent::AddPeers(vec![1]), &mut io);
        a.handle(InEvent::TimerExpired(Timer::Shuffle), &mut io);
        io.clear();
        a.handle(
            InEvent::RecvMessage(1, Message::ShuffleReply { nodes: vec![5, 6] }),
            &mut io,
        );
        let known: Vec<u32> = a.peers().copied().collect();
        assert!(known.contains(&5) && known.contains(&6));
    }

    #[test]
    fn incoming_shuffle_is_answered() {
        let mut b = state(1, 4);
        let mut io = VecDeque::new();
        b.handle(InEvent::AddPeers(vec![7, 8]), &mut io);
        b.handle(
            InEvent::RecvMessage(0, Message::Shuffle { nodes: vec![9] }),
            &mut io,
        );
        let replied = io.iter().any(|e| {
            matches!(e, OutEvent::SendMessage(0, Message::ShuffleReply { .. }))
        });
        assert!(replied);
        let known: Vec<u32> = b.peers().copied().collect();
        assert!(known.contains(&9), "shuffled nodes are merged");
        assert!(known.contains(&0), "the shuffle origin is learned");
    }

    #[test]
    fn cache_is_bounded() {
        let config = Config {
            cache_size: 4,
            ..Default::default()
        };
        let mut s = State::new(0u32, config, StdRng::seed_from_u64(5));
        let mut io = VecDeque::new();
        s.handle(InEvent::AddPeers((1..=20).collect()), &mut io);
        assert_eq!(s.peers().count(), 4);
    }
}
