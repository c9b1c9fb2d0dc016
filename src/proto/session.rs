//! Per-session reconciliation state machine.
//!
//! A session is one bilateral exchange between an initiator and a responder.
//! Both sides run the same machine; the roles only differ in which message
//! each receives first and in who closes the session. All wire-level keys and
//! intervals are expressed in the canonical base key space (quadrant zero);
//! each side translates to and from its own quadrant at the boundary, so
//! summaries and fingerprints agree across replicas.
//!
//! Sessions are deliberately permissive about the order messages arrive in:
//! only a terminal state stops processing. Resolves are idempotent at the
//! store level, which makes at-least-once delivery acceptable.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::art::Art;
use crate::bloom::BloomFilter;
use crate::interval::Interval;
use crate::keys::{Quadrant, RingKey};
use crate::merkle::{MerkleTree, NodeHash, NodeSummary};
use crate::store::{Entry, RepairKind, ResolveOutcome, Store};

use super::{Body, Config, Method, SessionId};

/// Which side of the exchange we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Why a session ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The session TTL elapsed.
    Ttl,
    /// Equal versions with differing values; never overwritten.
    Conflict,
    /// The peer is at capacity or has repair disabled. Retryable.
    Busy,
    /// The peer stayed unreachable beyond the retry budget.
    Unreachable,
    /// The peer hit a structural error in our traffic.
    Structural(FailReason),
}

/// Structural failures. Not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// A summary did not line up with the session's tree structure.
    MalformedSummary,
    /// A message referenced keys outside the session interval.
    IntervalMismatch,
    /// The peer answered with a different method than requested.
    MethodMismatch,
}

/// Terminal classification of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Completed; both sides exchanged all resolves.
    Done,
    /// Terminated early for a non-structural reason.
    Aborted(AbortReason),
    /// Terminated on a structural error.
    Failed(FailReason),
}

/// Counters of one session, reported in `session_done`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Stale entries replaced by a newer version.
    pub updated: u64,
    /// Missing entries recreated.
    pub regenerated: u64,
    /// Resolves that found nothing to do.
    pub unchanged: u64,
    /// Equal-version value conflicts detected.
    pub conflicts: u64,
    /// Resolves skipped because the local entry was write-locked.
    pub locked: u64,
    /// Resolve messages sent.
    pub resolve_sent: u64,
    /// Resolve messages received.
    pub resolve_recv: u64,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    BuildSummary,
    WaitReply,
    DiffCompute,
    WaitResolve,
    /// Waiting out a retry backoff.
    Backoff,
    Done,
    Aborted(AbortReason),
    Failed(FailReason),
}

/// Message bodies a session wants sent. The node state wraps them with
/// session id and addressing.
pub(super) type Outbox = Vec<Body>;

/// State of one reconciliation session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub method: Method,
    pub kind: RepairKind,
    /// Quadrant our replica of the reconciled arc lives in.
    pub quadrant: Quadrant,
    /// The reconciled arc in our own key space, clipped to our
    /// responsibility.
    pub local: Interval,
    /// The same arc in canonical base space (the wire representation).
    pub base: Interval,
    pub state: SessionState,
    /// Parts processed so far (a part per round when `max_items` splits the
    /// arc).
    pub round: u32,
    pub stats: SessionStats,
    directed: bool,
    /// Routing key of the remote replica (initiator side).
    remote_key: RingKey,
    parts: VecDeque<Interval>,
    /// Current part, base space.
    part: Interval,
    tree: Option<MerkleTree>,
    sent_filter: Option<BloomFilter>,
    /// Base intervals whose entries we already pushed.
    resolved: HashSet<Interval>,
    /// Pull requests awaiting an answer.
    outstanding: usize,
    retries: u32,
    pending_backoff: Option<Duration>,
    config: Config,
}

impl Session {
    /// Session opened by our own trigger.
    pub(super) fn initiator(
        id: SessionId,
        method: Method,
        kind: RepairKind,
        quadrant: Quadrant,
        local: Interval,
        remote_key: RingKey,
        config: Config,
    ) -> Self {
        let base = local.translate(quadrant, Quadrant::ZERO);
        Session {
            id,
            role: Role::Initiator,
            method,
            kind,
            quadrant,
            local,
            base,
            state: SessionState::Idle,
            round: 0,
            stats: SessionStats::default(),
            directed: false,
            remote_key,
            parts: VecDeque::new(),
            part: Interval::Empty,
            tree: None,
            sent_filter: None,
            resolved: HashSet::new(),
            outstanding: 0,
            retries: 0,
            pending_backoff: None,
            config,
        }
    }

    /// Directed single-key session: pull the peer's replica of `key`.
    pub(super) fn directed(
        id: SessionId,
        kind: RepairKind,
        quadrant: Quadrant,
        key: RingKey,
        remote_key: RingKey,
        config: Config,
    ) -> Self {
        let local = Interval::point(key);
        let mut session = Session::initiator(
            id,
            config.method,
            kind,
            quadrant,
            local,
            remote_key,
            config,
        );
        session.directed = true;
        session
    }

    /// Session opened by a peer's `request_sync`.
    pub(super) fn responder(
        id: SessionId,
        method: Method,
        kind: RepairKind,
        quadrant: Quadrant,
        local: Interval,
        base: Interval,
        config: Config,
    ) -> Self {
        Session {
            id,
            role: Role::Responder,
            method,
            kind,
            quadrant,
            local,
            base,
            state: SessionState::WaitReply,
            round: 0,
            stats: SessionStats::default(),
            directed: false,
            remote_key: RingKey::ZERO,
            parts: VecDeque::new(),
            part: Interval::Empty,
            tree: None,
            sent_filter: None,
            resolved: HashSet::new(),
            outstanding: 0,
            retries: 0,
            pending_backoff: None,
            config,
        }
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self.state {
            SessionState::Done => Some(SessionOutcome::Done),
            SessionState::Aborted(reason) => Some(SessionOutcome::Aborted(reason)),
            SessionState::Failed(reason) => Some(SessionOutcome::Failed(reason)),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// Take a requested retry delay, if the last event asked for one.
    pub(super) fn take_backoff(&mut self) -> Option<Duration> {
        self.pending_backoff.take()
    }

    /// Kick off the exchange (initiator only).
    pub(super) fn start<S: Store>(&mut self, store: &S, io: &mut Outbox) -> Result<()> {
        self.state = SessionState::BuildSummary;
        io.push(Body::RequestSync {
            method: self.method,
            kind: self.kind,
            replica_key: self.remote_key,
            interval: self.base,
        });
        if self.directed {
            let key = match self.base {
                Interval::Arc { x, .. } => x,
                _ => unreachable!("directed sessions cover a point interval"),
            };
            io.push(Body::ResolveRegen { key });
            self.outstanding = 1;
            self.state = SessionState::WaitResolve;
            return Ok(());
        }
        let count = store.count_range(&self.local)?;
        let n = count.div_ceil(self.config.max_items).max(1);
        self.parts = self
            .base
            .partition(n)
            .into_iter()
            .filter(|iv| !iv.is_empty())
            .collect();
        self.next_part_or_done(store, io)
    }

    /// Handle one incoming message body.
    pub(super) fn handle<S: Store>(
        &mut self,
        store: &S,
        body: Body,
        io: &mut Outbox,
    ) -> Result<()> {
        if self.is_terminal() {
            trace!(session = %self.id, %body, "message for terminal session dropped");
            return Ok(());
        }
        match body {
            // the node state handled session creation; a duplicate means our
            // peer retried before our reply arrived
            Body::RequestSync { .. } => Ok(()),
            Body::BloomSummary {
                interval,
                filter,
                reply,
            } => self.on_bloom_summary(store, interval, filter, reply, io),
            Body::MerkleSummary {
                level,
                nodes,
                resolve,
            } => self.on_merkle_summary(store, level, nodes, resolve, io),
            Body::ArtSummary { art, reply } => self.on_art_summary(store, art, reply, io),
            Body::ResolveUpdate { entry } => self.on_resolve_update(store, entry, io),
            Body::ResolveRegen { key } => self.on_resolve_regen(store, key, io),
            Body::SessionDone { stats } => {
                trace!(session = %self.id, ?stats, "peer finished");
                self.state = SessionState::Done;
                Ok(())
            }
            Body::SessionAbort { reason } => {
                self.on_abort(reason);
                Ok(())
            }
        }
    }

    /// TTL expiry.
    pub(super) fn on_ttl(&mut self) {
        if !self.is_terminal() {
            debug!(session = %self.id, "session ttl elapsed");
            self.state = SessionState::Aborted(AbortReason::Ttl);
        }
    }

    /// The peer became unreachable or reported itself busy.
    pub(super) fn on_transient_failure(&mut self) {
        if self.is_terminal() || self.role == Role::Responder {
            return;
        }
        if self.retries >= self.config.retry_limit {
            self.state = SessionState::Aborted(AbortReason::Unreachable);
            return;
        }
        self.retries += 1;
        let delay = self.config.backoff_base * 2u32.saturating_pow(self.retries - 1);
        debug!(session = %self.id, retry = self.retries, ?delay, "session backoff");
        self.pending_backoff = Some(delay);
        self.state = SessionState::Backoff;
    }

    /// The retry backoff elapsed; restart the exchange.
    pub(super) fn on_backoff_expired<S: Store>(
        &mut self,
        store: &S,
        io: &mut Outbox,
    ) -> Result<()> {
        if self.state != SessionState::Backoff {
            return Ok(());
        }
        self.resolved.clear();
        self.tree = None;
        self.sent_filter = None;
        self.start(store, io)
    }

    fn on_abort(&mut self, reason: AbortReason) {
        match reason {
            AbortReason::Busy => self.on_transient_failure(),
            AbortReason::Structural(fail) => {
                self.state = SessionState::Failed(fail);
            }
            reason => {
                self.state = SessionState::Aborted(reason);
            }
        }
    }

    fn fail(&mut self, reason: FailReason, io: &mut Outbox) {
        debug!(session = %self.id, ?reason, "session failed");
        io.push(Body::SessionAbort {
            reason: AbortReason::Structural(reason),
        });
        self.state = SessionState::Failed(reason);
    }

    // ---- bloom ----

    fn on_bloom_summary<S: Store>(
        &mut self,
        store: &S,
        interval: Interval,
        filter: BloomFilter,
        reply: bool,
        io: &mut Outbox,
    ) -> Result<()> {
        if self.method != Method::Bloom {
            self.fail(FailReason::MethodMismatch, io);
            return Ok(());
        }
        if !interval.difference(&self.base).is_empty() {
            self.fail(FailReason::IntervalMismatch, io);
            return Ok(());
        }
        if reply && interval != self.part {
            trace!(session = %self.id, "stale bloom reply for an earlier part dropped");
            return Ok(());
        }
        self.state = SessionState::DiffCompute;
        self.part = interval;
        let own = match &self.sent_filter {
            Some(sent) if sent.seed() == filter.seed() => sent.clone(),
            _ => self.build_filter(store, filter.seed())?,
        };
        // identical summaries mean identical item sets: skip the scan
        if own != filter {
            let entries = self.local_part_entries(store)?;
            for entry in entries {
                if !filter.contains(entry.item_hash()) {
                    self.push_entry(entry, io);
                }
            }
        }
        if reply {
            // the responder's returning filter: push what it lacks, then
            // move on to the next part or finish
            self.next_part_or_done(store, io)
        } else {
            io.push(Body::BloomSummary {
                interval,
                filter: own,
                reply: true,
            });
            self.state = SessionState::WaitResolve;
            Ok(())
        }
    }

    fn build_filter<S: Store>(&self, store: &S, seed: u64) -> Result<BloomFilter> {
        let entries = self.local_part_entries(store)?;
        let mut filter = BloomFilter::new(entries.len(), self.config.bloom_fpr, seed);
        for entry in &entries {
            filter.add(entry.item_hash());
        }
        Ok(filter)
    }

    // ---- merkle ----

    fn on_merkle_summary<S: Store>(
        &mut self,
        store: &S,
        level: u32,
        nodes: Vec<NodeSummary>,
        resolve: Vec<Interval>,
        io: &mut Outbox,
    ) -> Result<()> {
        if self.method != Method::MerkleTree {
            self.fail(FailReason::MethodMismatch, io);
            return Ok(());
        }
        self.state = SessionState::DiffCompute;
        // the root frontier names the part being reconciled
        if level == 0 {
            if let Some(root) = nodes.first() {
                if root.interval.is_empty()
                    || !root.interval.difference(&self.base).is_empty()
                {
                    self.fail(FailReason::IntervalMismatch, io);
                    return Ok(());
                }
                if self.part != root.interval {
                    self.part = root.interval;
                    self.tree = None;
                    self.resolved.clear();
                }
            }
        }
        for interval in &resolve {
            if !interval.difference(&self.part).is_empty() {
                self.fail(FailReason::IntervalMismatch, io);
                return Ok(());
            }
        }
        let empty_incoming = nodes.is_empty() && resolve.is_empty();

        // answer the peer's pushes with our own entries for those intervals
        let pending: Vec<Interval> = resolve
            .into_iter()
            .filter(|iv| !self.resolved.contains(iv))
            .collect();
        for interval in pending {
            self.push_interval_entries(store, &interval, io)?;
            self.resolved.insert(interval);
        }

        let mut reply_nodes = Vec::new();
        let mut reply_resolve = Vec::new();
        for summary in nodes {
            if !summary.interval.difference(&self.part).is_empty() {
                self.fail(FailReason::IntervalMismatch, io);
                return Ok(());
            }
            let mine = {
                let tree = self.part_tree(store)?;
                tree.summary_at(&summary.interval)
            };
            let mine = match mine {
                Ok(Some(mine)) => mine,
                Ok(None) | Err(_) => {
                    self.fail(FailReason::MalformedSummary, io);
                    return Ok(());
                }
            };
            if mine.hash == summary.hash {
                continue;
            }
            if summary.leaf || mine.leaf {
                // leaf-level difference: push our entries and ask for theirs
                if !self.resolved.contains(&summary.interval) {
                    self.push_interval_entries(store, &summary.interval, io)?;
                    self.resolved.insert(summary.interval);
                    reply_resolve.push(summary.interval);
                }
            } else {
                let children = {
                    let tree = self.part_tree(store)?;
                    tree.children_of(&summary.interval)
                };
                let children = match children {
                    Ok(Some(children)) => children,
                    _ => {
                        self.fail(FailReason::MalformedSummary, io);
                        return Ok(());
                    }
                };
                reply_nodes.extend(children);
            }
        }

        self.round = self.round.max(level);
        if reply_nodes.is_empty() && reply_resolve.is_empty() {
            // everything the peer sent matched or is resolved
            if self.role == Role::Initiator {
                return self.next_part_or_done(store, io);
            }
            if !empty_incoming {
                // tell the initiator its whole frontier matched
                io.push(Body::MerkleSummary {
                    level: level + 1,
                    nodes: Vec::new(),
                    resolve: Vec::new(),
                });
            }
            self.state = SessionState::WaitResolve;
        } else {
            io.push(Body::MerkleSummary {
                level: level + 1,
                nodes: reply_nodes,
                resolve: reply_resolve,
            });
            self.state = SessionState::WaitReply;
        }
        Ok(())
    }

    // ---- art ----

    fn on_art_summary<S: Store>(
        &mut self,
        store: &S,
        art: Art,
        reply: bool,
        io: &mut Outbox,
    ) -> Result<()> {
        if self.method != Method::Art {
            self.fail(FailReason::MethodMismatch, io);
            return Ok(());
        }
        if art.interval().is_empty() || !art.interval().difference(&self.base).is_empty() {
            self.fail(FailReason::IntervalMismatch, io);
            return Ok(());
        }
        self.state = SessionState::DiffCompute;
        if self.part != *art.interval() {
            self.part = *art.interval();
        }
        let part_items = self.part_items(store)?;
        let divergent = match art.diff_against(&self.part, &part_items) {
            Ok(divergent) => divergent,
            Err(_) => {
                self.fail(FailReason::MalformedSummary, io);
                return Ok(());
            }
        };
        for interval in divergent {
            self.push_interval_entries(store, &interval, io)?;
        }
        if reply {
            self.next_part_or_done(store, io)
        } else {
            let seed = self.id.0.rotate_left(17);
            let own = match Art::build(self.part, &part_items, self.config.art, seed) {
                Ok(own) => own,
                Err(_) => {
                    self.fail(FailReason::MalformedSummary, io);
                    return Ok(());
                }
            };
            io.push(Body::ArtSummary {
                art: own,
                reply: true,
            });
            self.state = SessionState::WaitResolve;
            Ok(())
        }
    }

    // ---- resolves ----

    fn on_resolve_update<S: Store>(
        &mut self,
        store: &S,
        entry: Entry,
        io: &mut Outbox,
    ) -> Result<()> {
        self.apply_entry(store, entry, io)?;
        if self.is_terminal() {
            return Ok(());
        }
        if self.outstanding > 0 {
            self.outstanding -= 1;
        }
        if self.directed && self.role == Role::Initiator && self.outstanding == 0 {
            io.push(Body::SessionDone { stats: self.stats });
            self.state = SessionState::Done;
        }
        Ok(())
    }

    fn on_resolve_regen<S: Store>(
        &mut self,
        store: &S,
        key: RingKey,
        io: &mut Outbox,
    ) -> Result<()> {
        let local_key = key.replica(self.quadrant);
        match store.get(local_key)? {
            Some(entry) => self.push_entry(entry, io),
            None => {
                if self.role == Role::Responder && self.is_point_session() {
                    // we lack the key too; pull the initiator's copy instead
                    io.push(Body::ResolveRegen { key });
                    self.outstanding += 1;
                    self.state = SessionState::WaitResolve;
                }
            }
        }
        // a directed pull answers the reverse request and closes the session
        if self.directed && self.role == Role::Initiator {
            io.push(Body::SessionDone { stats: self.stats });
            self.state = SessionState::Done;
        }
        Ok(())
    }

    /// Whether the session reconciles a single key (a directed pull).
    fn is_point_session(&self) -> bool {
        self.base.size() == 1
    }

    fn apply_entry<S: Store>(&mut self, store: &S, entry: Entry, io: &mut Outbox) -> Result<()> {
        let local = entry.rekeyed(self.quadrant);
        if !self.local.contains(local.key) {
            trace!(session = %self.id, key = %local.key, "resolve outside our range dropped");
            return Ok(());
        }
        self.stats.resolve_recv += 1;
        match store.apply_resolve(local, self.kind)? {
            ResolveOutcome::Regenerated => self.stats.regenerated += 1,
            ResolveOutcome::Updated => self.stats.updated += 1,
            ResolveOutcome::Unchanged => self.stats.unchanged += 1,
            ResolveOutcome::Locked => self.stats.locked += 1,
            ResolveOutcome::Conflict => {
                self.stats.conflicts += 1;
                io.push(Body::SessionAbort {
                    reason: AbortReason::Conflict,
                });
                self.state = SessionState::Aborted(AbortReason::Conflict);
            }
        }
        Ok(())
    }

    // ---- shared plumbing ----

    fn next_part_or_done<S: Store>(&mut self, store: &S, io: &mut Outbox) -> Result<()> {
        match self.parts.pop_front() {
            Some(part) => {
                self.part = part;
                self.round += 1;
                self.tree = None;
                self.sent_filter = None;
                self.resolved.clear();
                self.send_part_summary(store, io)
            }
            None => {
                io.push(Body::SessionDone { stats: self.stats });
                self.state = SessionState::Done;
                Ok(())
            }
        }
    }

    fn send_part_summary<S: Store>(&mut self, store: &S, io: &mut Outbox) -> Result<()> {
        self.state = SessionState::BuildSummary;
        match self.method {
            Method::Bloom => {
                let seed = self.id.0 ^ u64::from(self.round);
                let filter = self.build_filter(store, seed)?;
                self.sent_filter = Some(filter.clone());
                io.push(Body::BloomSummary {
                    interval: self.part,
                    filter,
                    reply: false,
                });
            }
            Method::MerkleTree => {
                let root = match self.part_tree(store)?.root_summary() {
                    Ok(root) => root,
                    Err(_) => unreachable!("part trees are always finalised"),
                };
                io.push(Body::MerkleSummary {
                    level: 0,
                    nodes: vec![root],
                    resolve: Vec::new(),
                });
            }
            Method::Art => {
                let seed = self.id.0.rotate_left(33);
                let part_items = self.part_items(store)?;
                let art = match Art::build(self.part, &part_items, self.config.art, seed) {
                    Ok(art) => art,
                    Err(_) => unreachable!("parts are never empty"),
                };
                io.push(Body::ArtSummary {
                    art,
                    reply: false,
                });
            }
        }
        self.state = SessionState::WaitReply;
        Ok(())
    }

    /// Build (or fetch the cached) finalised tree over the current part.
    fn part_tree<S: Store>(&mut self, store: &S) -> Result<&MerkleTree> {
        if self.tree.is_none() {
            let mut tree = MerkleTree::new(self.part, self.config.merkle)
                .expect("parts are never empty");
            for entry in self.local_part_entries(store)? {
                tree.insert(entry.key.base(), entry.item_hash())
                    .expect("entries lie inside the part");
            }
            self.tree = Some(tree.finalise());
        }
        Ok(self.tree.as_ref().expect("just built"))
    }

    /// Items of the current part as (base key, content hash) pairs.
    fn part_items<S: Store>(&self, store: &S) -> Result<Vec<(RingKey, NodeHash)>> {
        Ok(self
            .local_part_entries(store)?
            .into_iter()
            .map(|entry| (entry.key.base(), entry.item_hash()))
            .collect())
    }

    /// Our entries within the current part, local key space.
    fn local_part_entries<S: Store>(&self, store: &S) -> Result<Vec<Entry>> {
        let translated = self.part.translate(Quadrant::ZERO, self.quadrant);
        let mut entries = Vec::new();
        for interval in translated.intersection(&self.local) {
            entries.extend(store.get_range(&interval)?);
        }
        Ok(entries)
    }

    /// Push our entries within the base-space `interval`.
    fn push_interval_entries<S: Store>(
        &mut self,
        store: &S,
        interval: &Interval,
        io: &mut Outbox,
    ) -> Result<()> {
        let translated = interval.translate(Quadrant::ZERO, self.quadrant);
        let mut entries = Vec::new();
        for run in translated.intersection(&self.local) {
            entries.extend(store.get_range(&run)?);
        }
        for entry in entries {
            self.push_entry(entry, io);
        }
        Ok(())
    }

    fn push_entry(&mut self, entry: Entry, io: &mut Outbox) {
        // lock state is local; never shipped
        io.push(Body::ResolveUpdate {
            entry: Entry {
                write_lock: false,
                read_lock: 0,
                ..entry
            },
        });
        self.stats.resolve_sent += 1;
    }
}
