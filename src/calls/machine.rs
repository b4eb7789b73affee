//! Hierarchical negotiation state machine.
//!
//! ```text
//! idle
//! negotiating
//! ├── preparing
//! ├── gettingMedia
//! │   ├── approvingDeviceAccess
//! │   └── approvingContent
//! ├── offering
//! └── connecting
//! modifying
//! connected
//! terminated
//! ```
//!
//! An event is offered to the current leaf first and bubbles up through
//! its superstates until one of them has a handler. The handler's action
//! runs, then its guards are tried in order and the first one that yields a
//! [`Transition`] wins. A transition exits states innermost-first up to the
//! common ancestor of source and target, then enters states outermost-first
//! down to the target. Only leaf states emit lifecycle notifications.

use log::{debug, trace};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, watch};

use super::config::NegotiationConfig;
use super::event::{Event, EventKind};
use super::state::{Lifecycle, MediaFlags, Snapshot, StateId};
use super::timer::{TimerHandle, TimerKind, TimerService};
use super::types::{Role, SessionId};

const NOTIFICATION_CAPACITY: usize = 64;

/// Posted by a timer when it fires. Stale firings carry an old generation
/// and are dropped by [`CallStateMachine::on_timer_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Side effect applied when a transition is taken, before any exit hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    None,
    NoListener,
    RestoreRole,
    NoMedia,
    RejectedWhileConnected,
    Hangup,
    ReceiveModify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    target: StateId,
    effect: Effect,
}

impl Transition {
    const fn to(target: StateId) -> Self {
        Self {
            target,
            effect: Effect::None,
        }
    }

    const fn with(target: StateId, effect: Effect) -> Self {
        Self { target, effect }
    }
}

type Action = fn(&mut CallStateMachine, &Event);
type Guard = fn(&Event, &Snapshot) -> Option<Transition>;

struct Handler {
    action: Option<Action>,
    guards: &'static [Guard],
}

impl Handler {
    const SWALLOW: Handler = Handler {
        action: None,
        guards: &[],
    };

    const fn guarded(guards: &'static [Guard]) -> Self {
        Self {
            action: None,
            guards,
        }
    }

    const fn acting(action: Action, guards: &'static [Guard]) -> Self {
        Self {
            action: Some(action),
            guards,
        }
    }
}

const INITIATE: &[Guard] = &[initiate_accepted, initiate_unanswerable];
const HANGUP: &[Guard] = &[hang_up];
const ANSWER: &[Guard] = &[
    answer_needs_media,
    answer_previews_content,
    answer_receive_only,
];
const REJECT: &[Guard] = &[reject_to_flowing_media, reject_without_media];
const REJECT_CONNECTED: &[Guard] = &[reject_while_connected];
const LOCAL_MEDIA_READY: &[Guard] = &[local_media_ready_caller, local_media_ready_callee];
const DEVICE_APPROVED: &[Guard] = &[device_preview, device_ready_callee, device_ready_caller];
const TO_CONNECTED: &[Guard] = &[to_connected];
const TO_CONNECTING: &[Guard] = &[to_connecting];
const TO_PREPARING: &[Guard] = &[to_preparing];
const MODIFY: &[Guard] = &[modify_receive, modify_send];

fn handler_for(state: StateId, kind: EventKind) -> Option<Handler> {
    use EventKind as E;
    use StateId as S;

    let handler = match (state, kind) {
        (S::Idle, E::Initiate) => Handler::acting(adopt_role, INITIATE),
        (S::Idle | S::Negotiating | S::Modifying | S::Connected, E::Hangup) => {
            Handler::guarded(HANGUP)
        }
        (S::Negotiating | S::Modifying, E::Modify) => Handler::SWALLOW,
        (S::Preparing, E::Answer) => Handler::acting(record_answer, ANSWER),
        (
            S::Preparing | S::GettingMedia | S::Offering | S::Connecting | S::Modifying,
            E::Reject,
        ) => Handler::guarded(REJECT),
        (S::GettingMedia, E::ReceiveLocalMedia) => {
            Handler::acting(receive_local_media, LOCAL_MEDIA_READY)
        }
        (S::ApprovingDeviceAccess, E::Approve) => Handler::guarded(DEVICE_APPROVED),
        (S::ApprovingContent, E::Approve) => Handler::acting(grant_approval, LOCAL_MEDIA_READY),
        (S::Offering, E::ReceiveLocalMedia) => Handler::acting(receive_local_media, &[]),
        (S::Offering, E::SentOffer) => Handler::acting(arm_receive_answer, &[]),
        (S::Offering, E::ReceiveRemoteMedia) => Handler::acting(receive_remote_media, TO_CONNECTED),
        (S::Offering, E::ReceiveAnswer) => Handler::acting(cancel_receive_answer, TO_CONNECTING),
        (S::Connecting | S::Connected, E::ReceiveAnswer) => {
            Handler::acting(cancel_receive_answer, &[])
        }
        (S::Connecting, E::ReceiveRemoteMedia) => {
            Handler::acting(receive_remote_media, TO_CONNECTED)
        }
        (S::Modifying, E::Accept) => Handler::acting(become_caller, TO_PREPARING),
        (S::Connected, E::Reject) => Handler::guarded(REJECT_CONNECTED),
        (S::Connected, E::Modify) => Handler::guarded(MODIFY),
        _ => return None,
    };
    Some(handler)
}

// Actions.

fn adopt_role(machine: &mut CallStateMachine, event: &Event) {
    if let Event::Initiate { role, .. } = event {
        machine.set_role(*role);
    }
}

fn record_answer(machine: &mut CallStateMachine, event: &Event) {
    let Event::Answer(params) = event else {
        return;
    };
    if !params.preview {
        machine.flags.has_local_media_approval = true;
    }
    if !params.needs_media() && (!params.preview || params.receive_only) {
        if let Some(approver) = &params.approve {
            approver.approve();
        }
    }
}

fn receive_local_media(machine: &mut CallStateMachine, _: &Event) {
    machine.flags.has_local_media = true;
}

fn receive_remote_media(machine: &mut CallStateMachine, _: &Event) {
    machine.flags.has_remote_media = true;
}

fn grant_approval(machine: &mut CallStateMachine, _: &Event) {
    machine.flags.has_local_media_approval = true;
}

fn arm_receive_answer(machine: &mut CallStateMachine, _: &Event) {
    machine.arm_timer(TimerKind::ReceiveAnswer);
}

fn cancel_receive_answer(machine: &mut CallStateMachine, _: &Event) {
    machine.cancel_timer(TimerKind::ReceiveAnswer);
}

fn become_caller(machine: &mut CallStateMachine, _: &Event) {
    machine.set_role(Role::Caller);
}

// Guards.

fn initiate_accepted(event: &Event, _: &Snapshot) -> Option<Transition> {
    match event {
        Event::Initiate {
            role,
            acceptor_registered,
        } if role.is_caller() || *acceptor_registered => Some(Transition::to(StateId::Preparing)),
        _ => None,
    }
}

fn initiate_unanswerable(event: &Event, _: &Snapshot) -> Option<Transition> {
    matches!(
        event,
        Event::Initiate {
            role: Role::Callee,
            acceptor_registered: false,
        }
    )
    .then_some(Transition::with(StateId::Terminated, Effect::NoListener))
}

fn hang_up(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::with(StateId::Terminated, Effect::Hangup))
}

fn answer_needs_media(event: &Event, _: &Snapshot) -> Option<Transition> {
    match event {
        Event::Answer(params) if params.needs_media() => {
            Some(Transition::to(StateId::ApprovingDeviceAccess))
        }
        _ => None,
    }
}

fn answer_previews_content(event: &Event, _: &Snapshot) -> Option<Transition> {
    match event {
        Event::Answer(params)
            if params.preview && params.direct_connection_only && !params.receive_only =>
        {
            Some(Transition::to(StateId::ApprovingContent))
        }
        _ => None,
    }
}

fn answer_receive_only(event: &Event, _: &Snapshot) -> Option<Transition> {
    match event {
        Event::Answer(params) if params.receive_only => Some(Transition::to(StateId::Connecting)),
        _ => None,
    }
}

fn reject_to_flowing_media(_: &Event, snapshot: &Snapshot) -> Option<Transition> {
    snapshot
        .flags
        .is_media_flowing
        .then_some(Transition::with(StateId::Connected, Effect::RestoreRole))
}

fn reject_without_media(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::with(StateId::Terminated, Effect::NoMedia))
}

fn reject_while_connected(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::with(
        StateId::Terminated,
        Effect::RejectedWhileConnected,
    ))
}

fn local_media_ready_caller(_: &Event, snapshot: &Snapshot) -> Option<Transition> {
    let flags = snapshot.flags;
    (snapshot.role.is_caller() && flags.has_local_media_approval && flags.has_local_media)
        .then_some(Transition::to(StateId::Offering))
}

fn local_media_ready_callee(_: &Event, snapshot: &Snapshot) -> Option<Transition> {
    let flags = snapshot.flags;
    (!snapshot.role.is_caller() && flags.has_local_media_approval && flags.has_local_media)
        .then_some(Transition::to(StateId::Connecting))
}

fn device_preview(event: &Event, _: &Snapshot) -> Option<Transition> {
    matches!(event, Event::Approve { preview: true })
        .then_some(Transition::to(StateId::ApprovingContent))
}

fn device_ready_callee(_: &Event, snapshot: &Snapshot) -> Option<Transition> {
    (!snapshot.role.is_caller() && snapshot.flags.has_local_media)
        .then_some(Transition::to(StateId::Connecting))
}

fn device_ready_caller(_: &Event, snapshot: &Snapshot) -> Option<Transition> {
    (snapshot.role.is_caller() && snapshot.flags.has_local_media)
        .then_some(Transition::to(StateId::Offering))
}

fn to_connected(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::to(StateId::Connected))
}

fn to_connecting(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::to(StateId::Connecting))
}

fn to_preparing(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::to(StateId::Preparing))
}

fn modify_receive(event: &Event, _: &Snapshot) -> Option<Transition> {
    matches!(
        event,
        Event::Modify {
            receive: Some(true)
        }
    )
    .then_some(Transition::with(StateId::Preparing, Effect::ReceiveModify))
}

fn modify_send(_: &Event, _: &Snapshot) -> Option<Transition> {
    Some(Transition::to(StateId::Modifying))
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: TimerHandle,
}

/// Negotiation state of one call session.
///
/// The machine is owned by a single task. Timer firings arrive on the
/// receiver returned by [`new`](Self::new) and must be fed back through
/// [`on_timer_expired`](Self::on_timer_expired) by that same task.
#[derive(Debug)]
pub struct CallStateMachine {
    id: SessionId,
    state: StateId,
    role: Role,
    restore_role: Option<Role>,
    flags: MediaFlags,
    hangup_reason: Option<String>,
    signal_bye: Option<bool>,
    config: NegotiationConfig,
    timer_service: TimerService,
    timers: HashMap<TimerKind, ArmedTimer>,
    next_generation: u64,
    timer_tx: mpsc::UnboundedSender<TimerExpired>,
    notifications: broadcast::Sender<Lifecycle>,
    role_tx: watch::Sender<Role>,
}

impl CallStateMachine {
    pub fn new(
        id: SessionId,
        role: Role,
        config: NegotiationConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TimerExpired>) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (role_tx, _) = watch::channel(role);
        let machine = Self {
            id,
            state: StateId::Idle,
            role,
            restore_role: None,
            flags: MediaFlags::default(),
            hangup_reason: None,
            signal_bye: None,
            config,
            timer_service: TimerService::new(),
            timers: HashMap::new(),
            next_generation: 0,
            timer_tx,
            notifications,
            role_tx,
        };
        (machine, timer_rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn flags(&self) -> MediaFlags {
        self.flags
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            role: self.role,
            flags: self.flags,
        }
    }

    /// Compares against the current leaf state's name, e.g. `"gettingMedia"`
    /// is never current.
    pub fn is_state(&self, name: &str) -> bool {
        self.state.name() == name
    }

    /// A renegotiation is in progress on a call whose media already flows.
    pub fn is_modifying(&self) -> bool {
        matches!(self.state, StateId::Preparing | StateId::Modifying) && self.flags.is_media_flowing
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_final()
    }

    pub fn hangup_reason(&self) -> Option<&str> {
        self.hangup_reason.as_deref()
    }

    /// Whether a termination notice must be sent to the peer.
    pub fn signal_bye(&self) -> bool {
        self.signal_bye.unwrap_or(false)
    }

    /// The explicit bye preference, `None` when nobody expressed one.
    pub fn bye_preference(&self) -> Option<bool> {
        self.signal_bye
    }

    pub fn set_media_flowing(&mut self, flowing: bool) {
        self.flags.is_media_flowing = flowing;
    }

    pub fn set_received_bye(&mut self) {
        self.flags.received_bye = true;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Lifecycle> {
        self.notifications.subscribe()
    }

    /// Sender side of the notification channel, for handing out later subscriptions.
    pub fn notifier(&self) -> broadcast::Sender<Lifecycle> {
        self.notifications.clone()
    }

    /// Read-only view of the current role.
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn has_timer(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    pub fn active_timers(&self) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| self.timers.contains_key(kind))
            .collect()
    }

    /// Process one event to completion.
    ///
    /// Returns the lifecycle notifications emitted along the way, in order.
    /// Events without a handler are ignored; events after termination too.
    pub fn dispatch(&mut self, event: Event) -> Vec<Lifecycle> {
        let kind = event.kind();
        if self.is_terminated() {
            debug!(target: "Call/StateMachine", "{}: ignoring {kind}, call is terminated", self.id);
            return Vec::new();
        }

        let from = self.state;
        debug!(target: "Call/StateMachine", "{}: {kind} in {from}", self.id);

        let mut emitted = Vec::new();
        self.process(&event, &mut emitted);

        if self.state == from {
            if !kind.is_non_transition() {
                debug!(target: "Call/StateMachine", "{}: possible bad event {kind} in {from}", self.id);
            }
        } else {
            debug!(target: "Call/StateMachine", "{}: new state is {}", self.id, self.state);
        }
        emitted
    }

    /// Feed a timer firing back into the machine.
    ///
    /// A firing whose timer was cancelled or re-armed since is dropped.
    pub fn on_timer_expired(&mut self, expired: TimerExpired) -> Vec<Lifecycle> {
        match self.timers.get(&expired.kind) {
            Some(armed) if armed.generation == expired.generation => {
                self.timers.remove(&expired.kind);
            }
            _ => {
                trace!(target: "Call/Timer", "{}: dropping stale {} firing", self.id, expired.kind.name());
                return Vec::new();
            }
        }
        debug!(target: "Call/Timer", "{}: {} timer expired in {}", self.id, expired.kind.name(), self.state);
        self.dispatch(Event::Reject {
            reason: Some(expired.kind.expiry_reason()),
        })
    }

    fn process(&mut self, event: &Event, emitted: &mut Vec<Lifecycle>) {
        let kind = event.kind();
        let handler = self
            .state
            .ancestors()
            .find_map(|state| handler_for(state, kind));
        let Some(handler) = handler else {
            trace!(target: "Call/StateMachine", "{}: no handler for {kind} in {}", self.id, self.state);
            return;
        };

        if let Some(action) = handler.action {
            action(self, event);
        }
        let snapshot = self.snapshot();
        if let Some(transition) = handler.guards.iter().find_map(|guard| guard(event, &snapshot)) {
            self.transition(transition, event, emitted);
        }
    }

    fn transition(&mut self, transition: Transition, event: &Event, emitted: &mut Vec<Lifecycle>) {
        self.apply_effect(transition.effect, event);

        let source = self.state;
        let target = transition.target;
        let boundary = source.common_ancestor(target);

        let exiting: Vec<StateId> = source
            .ancestors()
            .take_while(|state| Some(*state) != boundary)
            .collect();
        for state in exiting {
            self.on_exit(state, emitted);
        }

        self.state = target;

        let mut entering: Vec<StateId> = target
            .ancestors()
            .take_while(|state| Some(*state) != boundary)
            .collect();
        entering.reverse();
        for state in entering {
            self.on_entry(state, emitted);
        }
    }

    fn apply_effect(&mut self, effect: Effect, event: &Event) {
        let given_reason = match event {
            Event::Reject { reason } | Event::Hangup { reason, .. } => reason.as_deref(),
            _ => None,
        };
        match effect {
            Effect::None => {}
            Effect::NoListener => {
                self.record_hangup_reason("no call listener");
                self.signal_bye = Some(true);
            }
            Effect::RestoreRole => {
                if let Some(role) = self.restore_role {
                    self.set_role(role);
                }
            }
            Effect::NoMedia => self.record_hangup_reason(given_reason.unwrap_or("no media")),
            Effect::RejectedWhileConnected => {
                self.record_hangup_reason(given_reason.unwrap_or("got reject while connected"))
            }
            Effect::Hangup => {
                if let Event::Hangup { signal, .. } = event {
                    self.signal_bye = *signal;
                }
                self.record_hangup_reason(given_reason.unwrap_or("none"));
            }
            Effect::ReceiveModify => {
                self.set_role(Role::Callee);
                self.arm_timer(TimerKind::Modify);
            }
        }
    }

    fn on_entry(&mut self, state: StateId, emitted: &mut Vec<Lifecycle>) {
        match state {
            StateId::Preparing => {
                self.flags.reset_for_negotiation();
                self.arm_timer(TimerKind::Answer);
            }
            StateId::Connecting => self.arm_timer(TimerKind::Connection),
            StateId::Modifying => self.arm_timer(TimerKind::Modify),
            StateId::Connected => {
                self.restore_role = Some(self.role);
                self.cancel_timer(TimerKind::Modify);
            }
            StateId::Terminated => self.cancel_all_timers(),
            _ => {}
        }
        if state.is_leaf() {
            self.emit(Lifecycle::entry(state), emitted);
        }
    }

    fn on_exit(&mut self, state: StateId, emitted: &mut Vec<Lifecycle>) {
        match state {
            StateId::Preparing => self.cancel_timer(TimerKind::Answer),
            StateId::Offering => self.cancel_timer(TimerKind::ReceiveAnswer),
            StateId::Connecting => {
                self.cancel_timer(TimerKind::Connection);
                self.cancel_timer(TimerKind::Modify);
            }
            _ => {}
        }
        if state.is_leaf() && !state.is_final() {
            self.emit(Lifecycle::exit(state), emitted);
        }
    }

    fn emit(&self, lifecycle: Lifecycle, emitted: &mut Vec<Lifecycle>) {
        trace!(target: "Call/StateMachine", "{}: {lifecycle}", self.id);
        emitted.push(lifecycle);
        let _ = self.notifications.send(lifecycle);
    }

    fn record_hangup_reason(&mut self, reason: &str) {
        if self.hangup_reason.is_none() {
            self.hangup_reason = Some(reason.to_string());
        }
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
        self.role_tx.send_replace(role);
    }

    fn arm_timer(&mut self, kind: TimerKind) {
        self.cancel_timer(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.timer_tx.clone();
        let handle = self.timer_service.schedule(
            format!("{} {}", self.id, kind.name()),
            self.config.timeout_for(kind),
            move || {
                let _ = tx.send(TimerExpired { kind, generation });
            },
        );
        self.timers.insert(kind, ArmedTimer { generation, handle });
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(armed) = self.timers.remove(&kind) {
            armed.handle.cancel();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, armed) in self.timers.drain() {
            armed.handle.cancel();
        }
    }
}

impl Drop for CallStateMachine {
    fn drop(&mut self) {
        self.cancel_all_timers();
    }
}
