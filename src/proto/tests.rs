//! Simulation framework for the repair protocol, plus the end-to-end repair
//! scenarios.
//!
//! Events are stored in per-node queues and processed on ticks; the transport
//! delivers with one tick of latency and timers are checked against the
//! simulated clock. Everything is driven by seeded rngs, so runs are
//! deterministic.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand_core::SeedableRng;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::interval::Interval;
use crate::keys::{Quadrant, RingKey, QUADRANT_SPAN};
use crate::store::{memory::MemStore, Entry, Store};

use super::session::Role;
use super::state::State;
use super::util::TimerMap;
use super::{
    AbortReason, Body, Command, Config, Event, InEvent, Message, Method, OutEvent, RepairMessage,
    Routing, SessionOutcome, Timer,
};

const TICK: Duration = Duration::from_millis(10);
const LATENCY: Duration = Duration::from_millis(30);
const MAX_TICKS: usize = 50_000;

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

type PeerNo = u32;

/// Static routing table of the simulated ring.
#[derive(Debug, Clone)]
struct RingRouter {
    owners: Vec<(Interval, PeerNo)>,
}

impl Routing<PeerNo> for RingRouter {
    fn lookup(&self, key: RingKey) -> Option<PeerNo> {
        self.owners
            .iter()
            .find(|(interval, _)| interval.contains(key))
            .map(|(_, peer)| *peer)
    }
}

type NodeState = State<PeerNo, MemStore, RingRouter, StdRng>;

/// Test network: queues, a transport with fixed latency, and simulated time.
struct Network {
    time: Instant,
    peers: Vec<NodeState>,
    peer_index: HashMap<PeerNo, usize>,
    inqueues: Vec<VecDeque<InEvent<PeerNo>>>,
    timers: TimerMap<(usize, Timer<PeerNo>)>,
    transport: TimerMap<(usize, InEvent<PeerNo>)>,
    events: Vec<(PeerNo, Event<PeerNo>)>,
    bodies: HashMap<&'static str, usize>,
    messages_sent: usize,
}

impl Network {
    fn new() -> Self {
        Network {
            time: Instant::now(),
            peers: Vec::new(),
            peer_index: HashMap::new(),
            inqueues: Vec::new(),
            timers: TimerMap::new(),
            transport: TimerMap::new(),
            events: Vec::new(),
            bodies: HashMap::new(),
            messages_sent: 0,
        }
    }

    fn push(&mut self, state: NodeState) {
        let me = *state.me();
        self.peer_index.insert(me, self.peers.len());
        self.inqueues.push(VecDeque::new());
        self.peers.push(state);
    }

    fn command(&mut self, peer: PeerNo, command: Command<PeerNo>) {
        let index = self.peer_index[&peer];
        self.inqueues[index].push_back(InEvent::Command(command));
    }

    fn tick(&mut self) {
        self.time += TICK;
        let due: Vec<(Instant, (usize, Timer<PeerNo>))> =
            self.timers.drain_expired(self.time).collect();
        for (_, (index, timer)) in due {
            self.inqueues[index].push_back(InEvent::TimerExpired(timer));
        }
        let arrived: Vec<(Instant, (usize, InEvent<PeerNo>))> =
            self.transport.drain_expired(self.time).collect();
        for (_, (index, event)) in arrived {
            self.inqueues[index].push_back(event);
        }
        for index in 0..self.peers.len() {
            while let Some(event) = self.inqueues[index].pop_front() {
                let me = *self.peers[index].me();
                let outs: Vec<OutEvent<PeerNo>> =
                    self.peers[index].handle(event, self.time).collect();
                for out in outs {
                    match out {
                        OutEvent::SendMessage(to, message) => {
                            self.messages_sent += 1;
                            if let Message::Repair(RepairMessage { body, .. }) = &message {
                                *self.bodies.entry(body.name()).or_default() += 1;
                            }
                            let target = self.peer_index[&to];
                            self.transport.insert(
                                self.time + LATENCY,
                                (target, InEvent::RecvMessage(me, message)),
                            );
                        }
                        OutEvent::ScheduleTimer(delay, timer) => {
                            self.timers.insert(self.time + delay, (index, timer));
                        }
                        OutEvent::EmitEvent(event) => {
                            self.events.push((me, event));
                        }
                    }
                }
            }
        }
    }

    /// Run until queues, transport and timers drain.
    fn run_until_quiet(&mut self) {
        for _ in 0..MAX_TICKS {
            self.tick();
            let queued: usize = self.inqueues.iter().map(|q| q.len()).sum();
            if queued == 0 && self.transport.is_empty() && self.timers.is_empty() {
                return;
            }
        }
        panic!("network did not become quiet within {MAX_TICKS} ticks");
    }

    fn finished_sessions(&self) -> Vec<(PeerNo, Role, SessionOutcome)> {
        self.events
            .iter()
            .filter_map(|(peer, event)| match event {
                Event::SessionFinished { role, outcome, .. } => Some((*peer, *role, *outcome)),
                _ => None,
            })
            .collect()
    }

    fn body_count(&self, name: &str) -> usize {
        self.bodies.get(name).copied().unwrap_or(0)
    }
}

/// How a replica slot diverges from the authoritative copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Divergence {
    Missing,
    Stale,
}

/// A simulated ring with seeded data.
struct Sim {
    network: Network,
    stores: Vec<MemStore>,
    router: RingRouter,
    nodes: Vec<PeerNo>,
    items: Vec<RingKey>,
}

const AUTH_VERSION: u64 = 5;

impl Sim {
    /// Build a ring of `n_nodes` equally-sized ranges.
    fn ring(n_nodes: usize, config: Config, seed: u64) -> Self {
        let ranges = Interval::Full.partition(n_nodes);
        let nodes: Vec<PeerNo> = (1..=n_nodes as PeerNo).collect();
        let router = RingRouter {
            owners: ranges
                .iter()
                .zip(&nodes)
                .map(|(interval, peer)| (*interval, *peer))
                .collect(),
        };
        let mut network = Network::new();
        let mut stores = Vec::new();
        for (i, (me, responsible)) in nodes.iter().zip(&ranges).enumerate() {
            let store = MemStore::default();
            network.push(State::new(
                *me,
                *responsible,
                config.clone(),
                store.clone(),
                router.clone(),
                StdRng::seed_from_u64(seed.wrapping_add(i as u64)),
            ));
            stores.push(store);
        }
        Sim {
            network,
            stores,
            router,
            nodes,
            items: Vec::new(),
        }
    }

    /// Seed `n_items` logical keys. The quadrant-zero replica always holds the
    /// authoritative version; the other three diverge according to a fixed
    /// pattern at roughly `failure_pct` percent.
    fn populate(&mut self, n_items: usize, failure_pct: u32) {
        let spacing = QUADRANT_SPAN / n_items as u128;
        for j in 0..n_items {
            let base = RingKey::new(j as u128 * spacing + 1);
            self.items.push(base);
            for q in Quadrant::ALL {
                let slot = base.replica(q);
                let entry = match Self::divergence(j, q, failure_pct) {
                    Some(Divergence::Missing) => continue,
                    Some(Divergence::Stale) => {
                        Entry::with_value(slot, format!("stale-{j}"), AUTH_VERSION - 1)
                    }
                    None => Entry::with_value(slot, format!("val-{j}"), AUTH_VERSION),
                };
                self.store_of(slot).put(entry).unwrap();
            }
        }
    }

    /// Deterministic divergence pattern; the quadrant-zero replica is always
    /// authoritative.
    fn divergence(j: usize, q: Quadrant, failure_pct: u32) -> Option<Divergence> {
        if q == Quadrant::ZERO {
            return None;
        }
        let roll = (j as u32 * 31 + u32::from(q.index()) * 7) % 100;
        if roll >= failure_pct {
            return None;
        }
        if (j + q.index() as usize) % 2 == 0 {
            Some(Divergence::Missing)
        } else {
            Some(Divergence::Stale)
        }
    }

    fn store_of(&self, key: RingKey) -> &MemStore {
        let peer = self.router.lookup(key).expect("ring covers all keys");
        let index = self.network.peer_index[&peer];
        &self.stores[index]
    }

    /// `(total - missing - outdated) / total` over all replica slots.
    fn sync_degree(&self) -> f64 {
        let mut missing = 0usize;
        let mut outdated = 0usize;
        let total = self.items.len() * Quadrant::ALL.len();
        for (j, base) in self.items.iter().enumerate() {
            let authoritative = bytes::Bytes::from(format!("val-{j}"));
            for q in Quadrant::ALL {
                let slot = base.replica(q);
                match self.store_of(slot).get(slot).unwrap() {
                    None => missing += 1,
                    Some(entry) => {
                        if entry.version < AUTH_VERSION
                            || entry.value.as_ref() != Some(&authoritative)
                        {
                            outdated += 1;
                        }
                    }
                }
            }
        }
        (total - missing - outdated) as f64 / total as f64
    }

    /// One round: every node runs one trigger.
    fn trigger_round(&mut self) {
        for node in self.nodes.clone() {
            self.network.command(node, Command::Trigger);
        }
        self.network.run_until_quiet();
    }
}

fn scenario_config(method: Method) -> Config {
    Config {
        method,
        trigger_probability: 100,
        bloom_fpr: 0.1,
        max_open_sessions: 8,
        ..Default::default()
    }
}

// ---- end-to-end scenarios ----

#[test]
fn scenario_no_diff() {
    setup_logging();
    let mut sim = Sim::ring(4, scenario_config(Method::Bloom), 101);
    sim.populate(1000, 0);
    let initial = sim.sync_degree();
    assert_eq!(initial, 1.0);

    sim.trigger_round();

    // identical summaries: sessions complete without a single resolve
    assert_eq!(sim.sync_degree(), initial);
    assert_eq!(sim.network.body_count("resolve_update"), 0);
    assert_eq!(sim.network.body_count("resolve_regen"), 0);
    let finished = sim.network.finished_sessions();
    assert!(!finished.is_empty());
    assert!(finished
        .iter()
        .all(|(_, _, outcome)| *outcome == SessionOutcome::Done));
}

#[test]
fn scenario_one_node() {
    setup_logging();
    let mut sim = Sim::ring(1, scenario_config(Method::Bloom), 102);
    sim.populate(1, 50);
    let initial = sim.sync_degree();

    sim.trigger_round();

    // nothing to repair against: no sessions, no traffic, no change
    assert_eq!(sim.sync_degree(), initial);
    assert_eq!(sim.network.messages_sent, 0);
    assert!(sim.network.finished_sessions().is_empty());
}

#[test]
fn scenario_simple() {
    setup_logging();
    let mut sim = Sim::ring(4, scenario_config(Method::MerkleTree), 103);
    sim.populate(1000, 10);
    let initial = sim.sync_degree();
    assert!(initial < 1.0);

    sim.trigger_round();

    let after = sim.sync_degree();
    assert!(
        after > initial,
        "one round must improve the sync degree ({initial} -> {after})"
    );
}

#[test]
fn scenario_multi_round() {
    setup_logging();
    // same inputs and seed as scenario_simple, but the trigger fires three
    // times instead of once
    let mut sim = Sim::ring(4, scenario_config(Method::MerkleTree), 103);
    sim.populate(1000, 10);
    let initial = sim.sync_degree();

    let mut degrees = Vec::new();
    for _ in 0..3 {
        sim.trigger_round();
        degrees.push(sim.sync_degree());
    }
    let one_round = degrees[0];

    // monotone convergence: the degree never regresses across rounds and
    // three rounds end strictly beyond the one-round result, unless a lucky
    // first round already converged the whole ring
    assert!(one_round > initial);
    assert!(degrees[1] >= degrees[0]);
    assert!(degrees[2] >= degrees[1]);
    assert!(
        degrees[2] > one_round || one_round == 1.0,
        "three rounds must out-converge one ({one_round} -> {})",
        degrees[2]
    );
}

#[test]
fn scenario_dest() {
    setup_logging();
    let mut sim = Sim::ring(7, scenario_config(Method::Bloom), 105);
    sim.populate(1000, 50);

    // craft the repaired pair: our copy stale, the quadrant-2 replica
    // authoritative
    let base = sim.items[0];
    let target = Quadrant::new(2).unwrap();
    let remote = base.replica(target);
    sim.store_of(base)
        .put(Entry::with_value(base, "stale-0", AUTH_VERSION - 1))
        .unwrap();
    sim.store_of(remote)
        .put(Entry::with_value(remote, "val-0", AUTH_VERSION))
        .unwrap();

    let owner = sim.router.lookup(base).unwrap();
    sim.network.command(
        owner,
        Command::RepairKey {
            key: base,
            target: Some(target),
        },
    );
    sim.network.run_until_quiet();

    let healed = sim.store_of(base).get(base).unwrap().unwrap();
    assert_eq!(healed.version, AUTH_VERSION);
    assert_eq!(healed.value.unwrap(), "val-0");
    let finished = sim.network.finished_sessions();
    assert!(finished
        .iter()
        .any(|(peer, role, outcome)| *peer == owner
            && *role == Role::Initiator
            && *outcome == SessionOutcome::Done));
}

#[test]
fn scenario_parts() {
    setup_logging();
    let config = Config {
        max_items: 500,
        ..scenario_config(Method::Bloom)
    };
    let mut sim = Sim::ring(4, config, 106);
    sim.populate(1000, 100);
    let initial = sim.sync_degree();

    // one session from the authoritative quadrant toward quadrant 1; with
    // 1000 items and a 500 item bound the exchange runs in two parts
    let key = sim.items[0];
    sim.network.command(
        sim.nodes[0],
        Command::SyncWith {
            peer: sim.nodes[1],
            key,
            target: Quadrant::new(1).unwrap(),
        },
    );
    sim.network.run_until_quiet();

    assert!(sim.sync_degree() > initial);
    let summaries = sim.network.body_count("bloom_summary");
    assert!(
        summaries >= 4,
        "two parts mean at least two filter exchanges, got {summaries}"
    );
}

// ---- protocol-level tests on the simulated network ----

#[test]
fn equal_version_conflict_aborts() {
    setup_logging();
    let mut sim = Sim::ring(4, scenario_config(Method::MerkleTree), 107);
    sim.populate(10, 0);

    // same version, different value on the quadrant-1 replica
    let base = sim.items[3];
    let conflicted = base.replica(Quadrant::new(1).unwrap());
    sim.store_of(conflicted)
        .put(Entry::with_value(conflicted, "divergent", AUTH_VERSION))
        .unwrap();

    sim.network.command(
        sim.nodes[0],
        Command::SyncWith {
            peer: sim.nodes[1],
            key: base,
            target: Quadrant::new(1).unwrap(),
        },
    );
    sim.network.run_until_quiet();

    // the conflict is reported and neither side overwrites
    assert!(sim
        .network
        .finished_sessions()
        .iter()
        .any(|(_, _, outcome)| *outcome
            == SessionOutcome::Aborted(AbortReason::Conflict)));
    assert_eq!(
        sim.store_of(conflicted).get(conflicted).unwrap().unwrap().value.unwrap(),
        "divergent"
    );
    assert_eq!(
        sim.store_of(base).get(base).unwrap().unwrap().value.unwrap(),
        "val-3"
    );
}

#[test]
fn art_session_heals_divergence() {
    setup_logging();
    let config = Config {
        art: crate::art::ArtConfig {
            inner_fpr: 1e-6,
            leaf_fpr: 1e-6,
            correction_factor: 2.0,
        },
        ..scenario_config(Method::Art)
    };
    let mut sim = Sim::ring(4, config, 108);
    sim.populate(200, 20);
    let initial = sim.sync_degree();

    let key = sim.items[0];
    sim.network.command(
        sim.nodes[0],
        Command::SyncWith {
            peer: sim.nodes[1],
            key,
            target: Quadrant::new(1).unwrap(),
        },
    );
    sim.network.run_until_quiet();

    assert!(sim.sync_degree() > initial);
}

// ---- direct state-machine tests (no network) ----

fn lone_state(me: PeerNo, config: Config, seed: u64) -> NodeState {
    let responsible = Interval::quadrant(Quadrant::ZERO);
    let router = RingRouter {
        owners: vec![(responsible, me)],
    };
    let store = MemStore::default();
    store
        .put(Entry::with_value(RingKey::new(10), "x", 1))
        .unwrap();
    State::new(
        me,
        responsible,
        config,
        store,
        router,
        StdRng::seed_from_u64(seed),
    )
}

fn outs(state: &mut NodeState, event: InEvent<PeerNo>, now: Instant) -> Vec<OutEvent<PeerNo>> {
    state.handle(event, now).collect()
}

#[test]
fn unreachable_peer_backs_off_then_aborts() {
    setup_logging();
    let config = Config {
        method: Method::Bloom,
        retry_limit: 2,
        ..Default::default()
    };
    let mut state = lone_state(1, config.clone(), 1);
    let now = Instant::now();

    // open a session toward a peer that will never answer
    let sync = Command::SyncWith {
        peer: 9,
        key: RingKey::new(10),
        target: Quadrant::new(1).unwrap(),
    };
    let sent = outs(&mut state, InEvent::Command(sync), now);
    assert!(sent
        .iter()
        .any(|o| matches!(o, OutEvent::SendMessage(9, Message::Repair(m))
            if matches!(m.body, Body::RequestSync { .. }))));

    let mut now = now;
    let mut backoffs = 0;
    let mut aborted = false;
    for _ in 0..=config.retry_limit {
        let produced = outs(&mut state, InEvent::PeerDisconnected(9), now);
        let mut backoff_timer = None;
        for out in produced {
            match out {
                OutEvent::ScheduleTimer(delay, timer @ Timer::Backoff(_)) => {
                    // exponential: 1s, 2s, ...
                    assert_eq!(delay, config.backoff_base * 2u32.pow(backoffs));
                    backoff_timer = Some(timer);
                }
                OutEvent::EmitEvent(Event::SessionFinished { outcome, .. }) => {
                    assert_eq!(
                        outcome,
                        SessionOutcome::Aborted(AbortReason::Unreachable)
                    );
                    aborted = true;
                }
                _ => {}
            }
        }
        let Some(timer) = backoff_timer else { break };
        backoffs += 1;
        now += Duration::from_secs(10);
        // firing the backoff re-sends the request
        let retried = state
            .handle(InEvent::TimerExpired(timer), now)
            .collect::<Vec<_>>();
        assert!(retried
            .iter()
            .any(|o| matches!(o, OutEvent::SendMessage(9, Message::Repair(m))
                if matches!(m.body, Body::RequestSync { .. }))));
    }
    assert_eq!(backoffs, config.retry_limit);
    assert!(aborted, "the retry budget must exhaust into an abort");
}

#[test]
fn gc_sweeps_expired_sessions() {
    setup_logging();
    let config = Config {
        method: Method::Bloom,
        session_ttl: Duration::from_secs(100),
        ..Default::default()
    };
    let mut state = lone_state(1, config, 2);
    let now = Instant::now();
    outs(
        &mut state,
        InEvent::Command(Command::SyncWith {
            peer: 9,
            key: RingKey::new(10),
            target: Quadrant::new(1).unwrap(),
        }),
        now,
    );
    assert_eq!(state.open_sessions(), 1);

    // a sweep before the deadline keeps the session
    let early = outs(&mut state, InEvent::TimerExpired(Timer::Gc), now + Duration::from_secs(50));
    assert!(!early
        .iter()
        .any(|o| matches!(o, OutEvent::EmitEvent(Event::SessionFinished { .. }))));
    assert_eq!(state.open_sessions(), 1);

    // past the ttl the sweep aborts and collects it
    let late = outs(&mut state, InEvent::TimerExpired(Timer::Gc), now + Duration::from_secs(101));
    assert!(late.iter().any(|o| matches!(
        o,
        OutEvent::EmitEvent(Event::SessionFinished {
            outcome: SessionOutcome::Aborted(AbortReason::Ttl),
            ..
        })
    )));
    assert_eq!(state.open_sessions(), 0);

    // a resolve for the swept session is dropped silently
    let stray = outs(
        &mut state,
        InEvent::RecvMessage(
            9,
            Message::Repair(RepairMessage {
                session: super::SessionId(1),
                from_initiator: false,
                body: Body::ResolveUpdate {
                    entry: Entry::with_value(RingKey::new(11), "ghost", 9),
                },
            }),
        ),
        now + Duration::from_secs(102),
    );
    assert!(stray.is_empty());
    assert!(state.store().get(RingKey::new(11)).unwrap().is_none());
}

#[test]
fn busy_responder_rejects_session() {
    setup_logging();
    let config = Config {
        max_open_sessions: 0,
        ..Default::default()
    };
    let mut state = lone_state(1, config, 3);
    let now = Instant::now();
    let produced = outs(
        &mut state,
        InEvent::RecvMessage(
            9,
            Message::Repair(RepairMessage {
                session: super::SessionId(1),
                from_initiator: true,
                body: Body::RequestSync {
                    method: Method::Bloom,
                    kind: crate::store::RepairKind::Mixed,
                    replica_key: RingKey::new(10),
                    interval: Interval::quadrant(Quadrant::ZERO),
                },
            }),
        ),
        now,
    );
    assert!(produced.iter().any(|o| matches!(
        o,
        OutEvent::SendMessage(9, Message::Repair(m))
            if matches!(m.body, Body::SessionAbort { reason: AbortReason::Busy })
    )));
    assert_eq!(state.open_sessions(), 0);
}

#[test]
fn disabled_engine_ignores_triggers() {
    setup_logging();
    let config = Config {
        enabled: false,
        trigger_probability: 100,
        ..Default::default()
    };
    let mut state = lone_state(1, config, 4);
    let now = Instant::now();
    let produced = outs(&mut state, InEvent::Command(Command::Trigger), now);
    assert!(produced.is_empty());
    assert_eq!(state.open_sessions(), 0);
}
