//! Node-level protocol state: the repair orchestrator.
//!
//! Owns the session table, the peer sampler and a handle to the local store,
//! and drives everything from incoming events: periodic triggers open
//! sessions toward random replicas, incoming messages are dispatched to their
//! session, and a periodic sweep collects terminal and TTL-expired sessions.
//! Like the sessions themselves this is a pure state machine; the runtime
//! executes the returned [`OutEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, trace};

#[cfg(feature = "metrics")]
use iroh_metrics::{inc, inc_by};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

use crate::interval::Interval;
use crate::keys::{Quadrant, RingKey};
use crate::sampler;
use crate::store::{RepairKind, Store};

use super::session::{Outbox, Role, Session, SessionOutcome, SessionStats};
use super::{
    Body, Command, Config, Event, InEvent, Message, Method, OutEvent, PeerId, RepairMessage,
    Routing, SessionId, SessionKey, Timer,
};

/// The repair engine state of one node.
#[derive(Debug)]
pub struct State<PA, S, RT, R> {
    me: PA,
    /// The arc of the ring this node is responsible for.
    responsible: Interval,
    config: Config,
    store: S,
    router: RT,
    sampler: sampler::State<PA, R>,
    sessions: HashMap<SessionKey<PA>, Session>,
    /// TTL deadline per session, checked by the gc sweep.
    deadlines: HashMap<SessionKey<PA>, Instant>,
    next_session_id: u64,
    outbox: VecDeque<OutEvent<PA>>,
    rng: R,
}

impl<PA, S, RT, R> State<PA, S, RT, R>
where
    PA: PeerId,
    S: Store,
    RT: Routing<PA>,
    R: Rng + Clone,
{
    pub fn new(
        me: PA,
        responsible: Interval,
        config: Config,
        store: S,
        router: RT,
        rng: R,
    ) -> Self {
        let sampler = sampler::State::new(me, config.sampler.clone(), rng.clone());
        State {
            me,
            responsible,
            config,
            store,
            router,
            sampler,
            sessions: HashMap::new(),
            deadlines: HashMap::new(),
            next_session_id: 0,
            outbox: VecDeque::new(),
            rng,
        }
    }

    /// The local peer id.
    pub fn me(&self) -> &PA {
        &self.me
    }

    /// The local store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Sessions that have not reached a terminal state.
    pub fn open_sessions(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_terminal()).count()
    }

    /// Look up a session for inspection.
    pub fn session(&self, key: &SessionKey<PA>) -> Option<&Session> {
        self.sessions.get(key)
    }

    /// Handle one event and return the outputs to execute.
    pub fn handle(
        &mut self,
        event: InEvent<PA>,
        now: Instant,
    ) -> impl Iterator<Item = OutEvent<PA>> + '_ {
        match event {
            InEvent::RecvMessage(from, Message::Sampler(message)) => {
                self.sampler_io(sampler::InEvent::RecvMessage(from, message));
            }
            InEvent::RecvMessage(from, Message::Repair(message)) => {
                self.on_repair_message(from, message, now);
            }
            InEvent::TimerExpired(timer) => self.on_timer(timer, now),
            InEvent::Command(command) => self.on_command(command, now),
            InEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
        }
        self.outbox.drain(..)
    }

    fn on_timer(&mut self, timer: Timer<PA>, now: Instant) {
        match timer {
            Timer::Trigger => {
                self.outbox.push_back(OutEvent::ScheduleTimer(
                    self.config.trigger_interval,
                    Timer::Trigger,
                ));
                self.trigger(now);
            }
            Timer::Gc => {
                self.outbox.push_back(OutEvent::ScheduleTimer(
                    self.config.gc_interval,
                    Timer::Gc,
                ));
                self.gc(now);
            }
            Timer::Backoff(key) => {
                self.with_session(key, |session, store, io| {
                    session.on_backoff_expired(store, io)
                });
            }
            Timer::Sampler(timer) => {
                self.sampler_io(sampler::InEvent::TimerExpired(timer));
            }
        }
    }

    fn on_command(&mut self, command: Command<PA>, now: Instant) {
        match command {
            Command::Start => {
                self.outbox.push_back(OutEvent::ScheduleTimer(
                    self.config.trigger_interval,
                    Timer::Trigger,
                ));
                self.outbox.push_back(OutEvent::ScheduleTimer(
                    self.config.gc_interval,
                    Timer::Gc,
                ));
                self.outbox.push_back(OutEvent::ScheduleTimer(
                    self.config.sampler.shuffle_interval,
                    Timer::Sampler(sampler::Timer::Shuffle),
                ));
            }
            Command::Trigger => self.trigger(now),
            Command::SyncWith { peer, key, target } => {
                self.open_session(peer, key, target, self.config.method, now);
            }
            Command::RepairKey { key, target } => self.repair_key(key, target, now),
            Command::Bootstrap(peers) | Command::NeighborhoodChanged(peers) => {
                self.sampler_io(sampler::InEvent::AddPeers(peers));
            }
        }
    }

    /// One repair round: pick a random local key and reconcile its arc with
    /// the replica in a random foreign quadrant.
    fn trigger(&mut self, now: Instant) {
        if !self.config.enabled {
            return;
        }
        #[cfg(feature = "metrics")]
        inc!(Metrics, triggers_fired);
        if self.rng.gen_range(0u8..100) >= self.config.trigger_probability {
            trace!("trigger skipped by probability");
            #[cfg(feature = "metrics")]
            inc!(Metrics, triggers_skipped);
            return;
        }
        if self.open_sessions() >= self.config.max_open_sessions {
            debug!("trigger skipped: session limit reached");
            #[cfg(feature = "metrics")]
            inc!(Metrics, triggers_skipped);
            return;
        }
        let Some(key) = self.responsible.random_key(&mut self.rng) else {
            return;
        };
        let source = key.quadrant();
        if self.quadrant_busy(source) {
            debug!(%source, "trigger skipped: quadrant already reconciling");
            #[cfg(feature = "metrics")]
            inc!(Metrics, triggers_skipped);
            return;
        }
        let mut targets: Vec<Quadrant> = source.others().collect();
        targets.shuffle(&mut self.rng);
        for target in targets {
            let remote_key = key.translate(source, target);
            let peer = self
                .router
                .lookup(remote_key)
                .or_else(|| self.sampler.random_peer());
            match peer {
                Some(peer) if peer != self.me => {
                    self.open_session(peer, key, target, self.config.method, now);
                    return;
                }
                _ => continue,
            }
        }
        // a one-node ring ends up here: nothing to repair against
        trace!("trigger found no foreign replica holder");
    }

    /// Open an initiator session reconciling the arc around `key` with the
    /// replica in `target`, held by `peer`.
    fn open_session(
        &mut self,
        peer: PA,
        key: RingKey,
        target: Quadrant,
        method: Method,
        now: Instant,
    ) {
        if peer == self.me {
            return;
        }
        let source = key.quadrant();
        let local = self.clip(Interval::quadrant(source), key);
        if local.is_empty() {
            trace!(%key, "not responsible for the requested arc");
            return;
        }
        let id = self.fresh_session_id();
        let session_key = SessionKey {
            peer,
            id,
            role: Role::Initiator,
        };
        let session = Session::initiator(
            id,
            method,
            self.config.kind,
            source,
            local,
            key.translate(source, target),
            self.config.clone(),
        );
        debug!(session = %id, ?peer, %source, %target, "starting reconciliation");
        self.insert_session(session_key, session, now);
        self.with_session(session_key, |session, store, io| session.start(store, io));
    }

    /// Directed repair of a single key against one of its replicas.
    fn repair_key(&mut self, key: RingKey, target: Option<Quadrant>, now: Instant) {
        let source = key.quadrant();
        if !self.responsible.contains(key) {
            trace!(%key, "repair_key outside our range");
            return;
        }
        let mut targets: Vec<Quadrant> = match target {
            Some(q) => vec![q],
            None => source.others().collect(),
        };
        if target.is_none() {
            targets.shuffle(&mut self.rng);
        }
        for target in targets {
            let remote_key = key.translate(source, target);
            let peer = self
                .router
                .lookup(remote_key)
                .or_else(|| self.sampler.random_peer());
            let Some(peer) = peer else { continue };
            if peer == self.me {
                continue;
            }
            let id = self.fresh_session_id();
            let session_key = SessionKey {
                peer,
                id,
                role: Role::Initiator,
            };
            let session = Session::directed(
                id,
                self.config.kind,
                source,
                key,
                remote_key,
                self.config.clone(),
            );
            debug!(session = %id, ?peer, %key, "directed repair");
            self.insert_session(session_key, session, now);
            self.with_session(session_key, |session, store, io| session.start(store, io));
            return;
        }
    }

    fn on_repair_message(&mut self, from: PA, message: RepairMessage, now: Instant) {
        let role = if message.from_initiator {
            Role::Responder
        } else {
            Role::Initiator
        };
        let key = SessionKey {
            peer: from,
            id: message.session,
            role,
        };
        if let Body::RequestSync {
            method,
            kind,
            replica_key,
            interval,
        } = message.body
        {
            self.on_request_sync(key, method, kind, replica_key, interval, now);
            return;
        }
        self.with_session(key, |session, store, io| {
            session.handle(store, message.body, io)
        });
    }

    fn on_request_sync(
        &mut self,
        key: SessionKey<PA>,
        method: Method,
        kind: RepairKind,
        replica_key: RingKey,
        base: Interval,
        now: Instant,
    ) {
        match self.sessions.get(&key) {
            Some(session) if !session.is_terminal() => {
                // the peer retried before our reply got through
                trace!(session = %key.id, "duplicate request_sync");
                return;
            }
            Some(_) => {
                self.remove_session(&key);
            }
            None => {}
        }
        if !self.config.enabled || self.open_sessions() >= self.config.max_open_sessions {
            self.reply_raw(
                key,
                Body::SessionAbort {
                    reason: super::AbortReason::Busy,
                },
            );
            return;
        }
        // wire intervals are expressed in the canonical quadrant-zero arc
        if !base
            .difference(&Interval::quadrant(Quadrant::ZERO))
            .is_empty()
        {
            self.reply_raw(
                key,
                Body::SessionAbort {
                    reason: super::AbortReason::Structural(super::FailReason::IntervalMismatch),
                },
            );
            return;
        }
        let quadrant = replica_key.quadrant();
        let local = self.clip(base.translate(Quadrant::ZERO, quadrant), replica_key);
        if local.is_empty() {
            // nothing of ours overlaps the requested arc
            self.reply_raw(
                key,
                Body::SessionDone {
                    stats: SessionStats::default(),
                },
            );
            return;
        }
        let session = Session::responder(
            key.id,
            method,
            kind,
            quadrant,
            local,
            base,
            self.config.clone(),
        );
        debug!(session = %key.id, peer = ?key.peer, %quadrant, "accepting reconciliation");
        self.insert_session(key, session, now);
    }

    fn on_peer_disconnected(&mut self, peer: PA) {
        self.sampler_io(sampler::InEvent::RemovePeer(peer));
        let keys: Vec<SessionKey<PA>> = self
            .sessions
            .iter()
            .filter(|(key, session)| key.peer == peer && !session.is_terminal())
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            self.with_session(key, |session, _store, _io| {
                session.on_transient_failure();
                Ok(())
            });
        }
    }

    /// Sweep terminal sessions and expire overdue ones. Resolves arriving for
    /// swept sessions are dropped silently by the message dispatch.
    fn gc(&mut self, now: Instant) {
        let expired: Vec<SessionKey<PA>> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.with_session(key, |session, _store, _io| {
                session.on_ttl();
                Ok(())
            });
        }
        let terminal: Vec<SessionKey<PA>> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_terminal())
            .map(|(key, _)| *key)
            .collect();
        for key in terminal {
            self.remove_session(&key);
        }
    }

    // ---- plumbing ----

    fn fresh_session_id(&mut self) -> SessionId {
        self.next_session_id += 1;
        SessionId(self.next_session_id)
    }

    fn insert_session(&mut self, key: SessionKey<PA>, session: Session, now: Instant) {
        #[cfg(feature = "metrics")]
        inc!(Metrics, sessions_started);
        self.deadlines.insert(key, now + self.config.session_ttl);
        self.sessions.insert(key, session);
    }

    fn remove_session(&mut self, key: &SessionKey<PA>) {
        self.sessions.remove(key);
        self.deadlines.remove(key);
    }

    /// Run `f` on the session, then flush its messages, backoff request and
    /// terminal transition.
    fn with_session(
        &mut self,
        key: SessionKey<PA>,
        f: impl FnOnce(&mut Session, &S, &mut Outbox) -> Result<()>,
    ) {
        let Some(session) = self.sessions.get_mut(&key) else {
            trace!(session = %key.id, "message for unknown session dropped");
            return;
        };
        let was_terminal = session.is_terminal();
        let mut io = Outbox::new();
        let result = f(session, &self.store, &mut io);
        let backoff = session.take_backoff();
        let outcome = session.outcome();
        let stats = session.stats;

        let from_initiator = key.role == Role::Initiator;
        for body in io {
            self.outbox.push_back(OutEvent::SendMessage(
                key.peer,
                Message::Repair(RepairMessage {
                    session: key.id,
                    from_initiator,
                    body,
                }),
            ));
        }
        if let Some(delay) = backoff {
            self.outbox
                .push_back(OutEvent::ScheduleTimer(delay, Timer::Backoff(key)));
        }
        if !was_terminal {
            if let Some(outcome) = outcome {
                self.finish(key, outcome, stats);
            }
        }
        if let Err(err) = result {
            error!(session = %key.id, "store failure during repair: {err:#}");
            self.outbox
                .push_back(OutEvent::EmitEvent(Event::StoreFailed(format!("{err:#}"))));
        }
    }

    fn finish(&mut self, key: SessionKey<PA>, outcome: SessionOutcome, stats: SessionStats) {
        debug!(session = %key.id, ?outcome, ?stats, "session finished");
        #[cfg(feature = "metrics")]
        {
            match outcome {
                SessionOutcome::Done => inc!(Metrics, sessions_completed),
                SessionOutcome::Aborted(_) => inc!(Metrics, sessions_aborted),
                SessionOutcome::Failed(_) => inc!(Metrics, sessions_failed),
            }
            inc_by!(Metrics, entries_updated, stats.updated);
            inc_by!(Metrics, entries_regenerated, stats.regenerated);
            inc_by!(Metrics, conflicts, stats.conflicts);
            inc_by!(Metrics, resolve_sent, stats.resolve_sent);
            inc_by!(Metrics, resolve_recv, stats.resolve_recv);
        }
        self.outbox.push_back(OutEvent::EmitEvent(Event::SessionFinished {
            peer: key.peer,
            id: key.id,
            role: key.role,
            outcome,
            stats,
        }));
    }

    /// Send a session-level reply without session state.
    fn reply_raw(&mut self, key: SessionKey<PA>, body: Body) {
        self.outbox.push_back(OutEvent::SendMessage(
            key.peer,
            Message::Repair(RepairMessage {
                session: key.id,
                from_initiator: key.role == Role::Initiator,
                body,
            }),
        ));
    }

    /// Intersect `arc` with our responsibility, preferring the run that
    /// contains `anchor`.
    fn clip(&self, arc: Interval, anchor: RingKey) -> Interval {
        let runs = arc.intersection(&self.responsible);
        runs.iter()
            .find(|iv| iv.contains(anchor))
            .or_else(|| runs.first())
            .copied()
            .unwrap_or(Interval::Empty)
    }

    /// Whether an open initiator session is already reconciling `quadrant`.
    fn quadrant_busy(&self, quadrant: Quadrant) -> bool {
        self.sessions.values().any(|session| {
            !session.is_terminal()
                && session.role == Role::Initiator
                && session.quadrant == quadrant
        })
    }

    fn sampler_io(&mut self, event: sampler::InEvent<PA>) {
        let mut io = VecDeque::new();
        self.sampler.handle(event, &mut io);
        for event in io {
            match event {
                sampler::OutEvent::SendMessage(to, message) => self
                    .outbox
                    .push_back(OutEvent::SendMessage(to, Message::Sampler(message))),
                sampler::OutEvent::ScheduleTimer(delay, timer) => self
                    .outbox
                    .push_back(OutEvent::ScheduleTimer(delay, Timer::Sampler(timer))),
            }
        }
    }
}
