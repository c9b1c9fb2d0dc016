//! Protocol implementation of the repair engine.
//!
//! Everything in this module is a pure state machine: no IO and no timers are
//! performed directly. The runtime (see [`crate::actor`]) feeds [`InEvent`]s
//! into [`state::State::handle`] and executes the returned [`OutEvent`]s. This
//! makes the whole protocol deterministic and testable in-memory (see the
//! simulation framework in `proto::tests`).

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::art::{Art, ArtConfig};
use crate::bloom::BloomFilter;
use crate::interval::Interval;
use crate::keys::{Quadrant, RingKey};
use crate::merkle::{MerkleConfig, NodeSummary};
use crate::sampler;
use crate::store::{Entry, RepairKind};

pub mod session;
pub mod state;
#[cfg(test)]
mod tests;
pub mod util;

pub use session::{AbortReason, FailReason, Role, SessionOutcome, SessionStats};
pub use state::State;

/// Trait for types that identify a peer on the network.
pub trait PeerId: Hash + Eq + Copy + fmt::Debug + Serialize + DeserializeOwned {}
impl<T> PeerId for T where T: Hash + Eq + Copy + fmt::Debug + Serialize + DeserializeOwned {}

/// Session identifier, monotonically increasing and unique per initiator.
/// Together with the initiating peer it names a session globally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Reconciliation method of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Bloom filter exchange; probabilistic, cheapest.
    #[default]
    Bloom,
    /// Merkle frontier exchange; deterministic modulo hash collisions.
    MerkleTree,
    /// Approximate reconciliation tree; bloom filters per tree level.
    Art,
}

/// Table key of a session: remote peer, initiator-scoped id, and our role.
/// The role disambiguates id collisions between the two directions of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey<PA> {
    pub peer: PA,
    pub id: SessionId,
    pub role: Role,
}

/// Top-level wire message: repair traffic or peer-sampler gossip.
#[derive(Debug, Clone, Serialize, Deserialize, derive_more::From)]
pub enum Message<PA> {
    Repair(RepairMessage),
    Sampler(sampler::Message<PA>),
}

/// One repair protocol message. `from_initiator` routes the message to the
/// right session of the receiving pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairMessage {
    pub session: SessionId,
    pub from_initiator: bool,
    pub body: Body,
}

/// Message bodies of the reconciliation protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    /// Opens a session: the initiator wants to reconcile `interval` (in
    /// canonical base key space) against the replica at `replica_key`.
    RequestSync {
        method: Method,
        kind: RepairKind,
        replica_key: RingKey,
        interval: Interval,
    },
    /// A Bloom filter over the item fingerprints of `interval`. `reply` marks
    /// the responder's returning filter.
    BloomSummary {
        interval: Interval,
        filter: BloomFilter,
        reply: bool,
    },
    /// A frontier of Merkle node summaries to check, plus the intervals whose
    /// entries the sender has pushed and wants answered in kind.
    MerkleSummary {
        level: u32,
        nodes: Vec<NodeSummary>,
        resolve: Vec<Interval>,
    },
    /// Per-level Bloom filters of the sender's fixed-depth summary. `reply`
    /// as above.
    ArtSummary { art: Art, reply: bool },
    /// Push one entry to the receiver (keys in the sender's key space; the
    /// receiver re-keys into its own quadrant).
    ResolveUpdate { entry: Entry },
    /// Pull request: send back your replica of the base-space `key`.
    ResolveRegen { key: RingKey },
    /// Successful completion, with the sender's final counters.
    SessionDone { stats: SessionStats },
    /// Unsuccessful termination.
    SessionAbort { reason: AbortReason },
}

impl Body {
    fn name(&self) -> &'static str {
        match self {
            Body::RequestSync { .. } => "request_sync",
            Body::BloomSummary { .. } => "bloom_summary",
            Body::MerkleSummary { .. } => "merkle_summary",
            Body::ArtSummary { .. } => "art_summary",
            Body::ResolveUpdate { .. } => "resolve_update",
            Body::ResolveRegen { .. } => "resolve_regen",
            Body::SessionDone { .. } => "session_done",
            Body::SessionAbort { .. } => "session_abort",
        }
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Input event to the node state.
#[derive(Debug)]
pub enum InEvent<PA> {
    /// Message received from the network.
    RecvMessage(PA, Message<PA>),
    /// A previously scheduled timer fired.
    TimerExpired(Timer<PA>),
    /// Command from the application.
    Command(Command<PA>),
    /// The connection to a peer failed.
    PeerDisconnected(PA),
}

/// Output event from the node state.
#[derive(Debug)]
pub enum OutEvent<PA> {
    /// Send a message on the network.
    SendMessage(PA, Message<PA>),
    /// Schedule a timer. The runtime must feed back
    /// [`InEvent::TimerExpired`] after the duration.
    ScheduleTimer(Duration, Timer<PA>),
    /// Notify the application.
    EmitEvent(Event<PA>),
}

/// Timers of the node state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer<PA> {
    /// Periodic repair trigger.
    Trigger,
    /// Periodic sweep of terminal and TTL-expired sessions.
    Gc,
    /// Retry backoff of one session.
    Backoff(SessionKey<PA>),
    /// Peer sampler timer.
    Sampler(sampler::Timer),
}

/// Commands from the application.
#[derive(Debug, Clone)]
pub enum Command<PA> {
    /// Arm the periodic trigger, gc and shuffle timers.
    Start,
    /// Run one repair round now, without re-arming the trigger.
    Trigger,
    /// Open a session toward `peer`, reconciling our arc around `key` with
    /// the replica in `target`.
    SyncWith {
        peer: PA,
        key: RingKey,
        target: Quadrant,
    },
    /// Directed repair of a single key against one of its replicas.
    RepairKey {
        key: RingKey,
        target: Option<Quadrant>,
    },
    /// Seed the peer sampler with known hosts.
    Bootstrap(Vec<PA>),
    /// Predecessor or successor changed; seeds the sampler cache.
    NeighborhoodChanged(Vec<PA>),
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<PA> {
    /// A session reached a terminal state.
    SessionFinished {
        peer: PA,
        id: SessionId,
        role: Role,
        outcome: SessionOutcome,
        stats: SessionStats,
    },
    /// The local database failed; the supervisor must take over.
    StoreFailed(String),
}

/// Routing collaborator: resolves a replica key to the peer responsible for
/// it. Provided by the overlay's routing layer.
pub trait Routing<PA> {
    fn lookup(&self, key: RingKey) -> Option<PA>;
}

/// Engine configuration. A snapshot is copied into every session at creation;
/// sessions never observe config changes mid-round.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch for periodic repair.
    pub enabled: bool,
    /// Period of the repair trigger.
    pub trigger_interval: Duration,
    /// Probability (0-100) that a trigger actually starts a session.
    pub trigger_probability: u8,
    /// Reconciliation method for triggered sessions.
    pub method: Method,
    /// What kinds of divergence rounds are allowed to heal.
    pub kind: RepairKind,
    /// False-positive rate of bloom summaries.
    pub bloom_fpr: f64,
    /// Upper bound on items summarised at once; larger arcs split into parts.
    pub max_items: usize,
    /// Merkle tree shape.
    pub merkle: MerkleConfig,
    /// ART filter sizing.
    pub art: ArtConfig,
    /// Session time-to-live.
    pub session_ttl: Duration,
    /// Period of the session sweeper.
    pub gc_interval: Duration,
    /// Transient failures tolerated per session before it aborts.
    pub retry_limit: u32,
    /// Base delay of the exponential retry backoff.
    pub backoff_base: Duration,
    /// Concurrent open sessions per node.
    pub max_open_sessions: usize,
    /// Peer sampler tuning.
    pub sampler: sampler::Config,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            trigger_interval: Duration::from_secs(600),
            trigger_probability: 33,
            method: Method::default(),
            kind: RepairKind::Mixed,
            bloom_fpr: 0.01,
            max_items: 100_000,
            merkle: MerkleConfig::default(),
            art: ArtConfig::default(),
            session_ttl: Duration::from_secs(100),
            gc_interval: Duration::from_secs(60),
            retry_limit: 3,
            backoff_base: Duration::from_secs(1),
            max_open_sessions: 3,
            sampler: sampler::Config::default(),
        }
    }
}
