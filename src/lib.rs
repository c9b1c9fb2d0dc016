//! Anti-entropy replica repair for a replicated ring key-value store.
//!
//! The key space is the ring of 128-bit integers, divided into four quadrants;
//! every logical key has one replica per quadrant. Replicas drift apart under
//! concurrent writes and partial failures, and this crate heals them: a
//! periodic trigger picks a random arc of the local key range and reconciles
//! it with the peer holding the replica in another quadrant, using a
//! bandwidth-compact summary — a [Bloom filter](bloom::BloomFilter), an
//! interval-partitioned [Merkle tree](merkle::MerkleTree), or an
//! [approximate reconciliation tree](art::Art). Located differences become
//! resolve messages: the newest version wins, missing entries are regenerated,
//! and equal-version value conflicts are reported, never overwritten.
//!
//! The protocol core (`proto`) is a pure state machine driven by in/out
//! events, which makes it deterministic under test; the [`actor`] module
//! supplies the runtime (thread, timers, channels). Peers are discovered
//! through a gossip-based [peer sampler](sampler), and the overlay's routing
//! layer is abstracted behind [`proto::Routing`]. Storage stays with the
//! node: the engine only talks to it through the [`store::Store`] trait and
//! persists nothing itself.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub mod actor;
pub mod art;
pub mod bloom;
pub mod interval;
pub mod keys;
pub mod merkle;
#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "net")]
pub mod net;
pub mod proto;
pub mod sampler;
pub mod store;

pub use self::interval::{Bound, Interval};
pub use self::keys::{Quadrant, RingKey, QUADRANT_SPAN, REPLICATION_FACTOR};
pub use self::proto::{Command, Config, Event, Method, Routing, SessionId};
pub use self::store::{Entry, RepairKind, ResolveOutcome, Store};
