//! Actor wrapping the protocol state behind a thread and channels.
//!
//! The protocol itself is pure (see [`crate::proto`]); this actor supplies
//! the runtime: a dedicated thread owning the [`State`], an action inbox,
//! wall-clock timers, and outgoing channels for wire messages (drained by the
//! transport) and application events. Dropping all handles closes the inbox
//! and shuts the actor down.

use std::time::Instant;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand_core::SeedableRng;
use tokio::sync::oneshot;
use tracing::{error, error_span, trace};

use crate::interval::Interval;
use crate::proto::util::TimerMap;
use crate::proto::{
    Command, Config, Event, InEvent, Message, OutEvent, PeerId, Routing, SessionKey, State, Timer,
};
use crate::store::Store;

const EVENT_CAP: usize = 1024;
const ACTION_CAP: usize = 128;

/// Channel of outgoing `(peer, message)` pairs, drained by the transport.
pub type MessageReceiver<PA> = flume::Receiver<(PA, Message<PA>)>;

/// Channel of application events.
pub type EventReceiver<PA> = flume::Receiver<Event<PA>>;

#[derive(Debug)]
enum Action<PA> {
    HandleMessage {
        from: PA,
        message: Message<PA>,
    },
    Command {
        command: Command<PA>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the repair actor thread.
#[derive(Debug, Clone)]
pub struct RepairHandle<PA> {
    tx: flume::Sender<Action<PA>>,
}

impl<PA: PeerId + Send + 'static> RepairHandle<PA> {
    /// Spawn the actor and return its handle plus the outgoing channels.
    pub fn spawn<S, RT>(
        me: PA,
        responsible: Interval,
        config: Config,
        store: S,
        router: RT,
    ) -> (Self, MessageReceiver<PA>, EventReceiver<PA>)
    where
        S: Store,
        RT: Routing<PA> + Send + 'static,
    {
        let (action_tx, action_rx) = flume::bounded(ACTION_CAP);
        let (message_tx, message_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::bounded(EVENT_CAP);
        let state = State::new(
            me,
            responsible,
            config,
            store,
            router,
            StdRng::from_entropy(),
        );
        let mut actor = Actor {
            state,
            action_rx,
            message_tx,
            event_tx,
            timers: TimerMap::new(),
        };
        std::thread::spawn(move || {
            let span = error_span!("rrepair", me = ?me);
            let _enter = span.enter();
            if let Err(err) = actor.run() {
                error!("repair actor closed with error: {err:?}");
            }
        });
        (RepairHandle { tx: action_tx }, message_rx, event_rx)
    }

    /// Feed a message received from the network.
    pub fn handle_message(&self, from: PA, message: Message<PA>) -> Result<()> {
        self.send(Action::HandleMessage { from, message })
    }

    /// Issue a command.
    pub fn command(&self, command: Command<PA>) -> Result<()> {
        self.send(Action::Command { command })
    }

    /// Stop the actor and wait until it exited.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Shutdown { reply })?;
        rx.await?;
        Ok(())
    }

    fn send(&self, action: Action<PA>) -> Result<()> {
        self.tx
            .send(action)
            .map_err(|_| anyhow!("repair actor is shut down"))
    }
}

struct Actor<PA, S, RT> {
    state: State<PA, S, RT, StdRng>,
    action_rx: flume::Receiver<Action<PA>>,
    message_tx: flume::Sender<(PA, Message<PA>)>,
    event_tx: flume::Sender<Event<PA>>,
    timers: TimerMap<Timer<PA>>,
}

impl<PA, S, RT> Actor<PA, S, RT>
where
    PA: PeerId + Send + 'static,
    S: Store,
    RT: Routing<PA>,
{
    fn run(&mut self) -> Result<()> {
        loop {
            let now = Instant::now();
            let due: Vec<(Instant, Timer<PA>)> = self.timers.drain_expired(now).collect();
            for (_, timer) in due {
                self.process(InEvent::TimerExpired(timer), now);
            }
            let action = match self.timers.next_deadline() {
                Some(deadline) => match self.action_rx.recv_deadline(deadline) {
                    Ok(action) => action,
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                },
                None => match self.action_rx.recv() {
                    Ok(action) => action,
                    Err(_) => break,
                },
            };
            match action {
                Action::HandleMessage { from, message } => {
                    self.process(InEvent::RecvMessage(from, message), Instant::now());
                }
                Action::Command { command } => {
                    self.process(InEvent::Command(command), Instant::now());
                }
                Action::Shutdown { reply } => {
                    reply.send(()).ok();
                    break;
                }
            }
        }
        trace!("repair actor loop ended");
        Ok(())
    }

    fn process(&mut self, event: InEvent<PA>, now: Instant) {
        for out in self.state.handle(event, now) {
            match out {
                OutEvent::SendMessage(to, message) => {
                    if self.message_tx.send((to, message)).is_err() {
                        trace!("transport channel closed; dropping outgoing message");
                    }
                }
                OutEvent::ScheduleTimer(delay, timer) => {
                    self.timers.insert(now + delay, timer);
                }
                OutEvent::EmitEvent(event) => {
                    if let Event::SessionFinished { peer, id, role, .. } = &event {
                        // a session that ends while backing off leaves a
                        // stale retry timer behind
                        self.timers.remove(&Timer::Backoff(SessionKey {
                            peer: *peer,
                            id: *id,
                            role: *role,
                        }));
                    }
                    if self.event_tx.send(event).is_err() {
                        trace!("event channel closed; dropping event");
                    }
                }
            }
        }
    }
}
