//! A single call.
//!
//! Each call runs two tasks:
//!
//! - the call actor owns the [`CallStateMachine`] and processes, one at a
//!   time, application requests, inbound signals, timer firings and the
//!   results of asynchronous work;
//! - the negotiation worker owns the [`NegotiationCoordinator`] and runs its
//!   commands in order, posting results back to the actor.
//!
//! Neither task blocks the other. Lifecycle notifications from the state
//! machine are what trigger work: entering `approving-device-access`
//! acquires local media, entering `offering` creates the offer, entering
//! `connecting` as callee answers the pending offer, and entering
//! `terminated` closes the negotiation.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use super::config::NegotiationConfig;
use super::coordinator::NegotiationCoordinator;
use super::deferred::{Deferred, Settlement};
use super::error::{CallError, NegotiationError};
use super::event::{AnswerParams, Approver, Event};
use super::machine::{CallStateMachine, TimerExpired};
use super::media::{MediaConstraints, MediaError, MediaHandle, MediaProvider};
use super::report::NegotiationReport;
use super::signaling::{InboundSignal, SignalingGateway};
use super::state::{Lifecycle, MediaFlags, Phase, StateId};
use super::transport::{
    ConnectivityState, IceCandidate, SessionDescription, TransportEvent, TransportFactory,
};
use super::types::{Role, SessionId};

/// Collaborators shared by every call.
#[derive(Clone)]
pub struct CallDependencies {
    pub gateway: Arc<dyn SignalingGateway>,
    pub media: Arc<dyn MediaProvider>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub id: SessionId,
    pub role: Role,
    /// Somebody will answer incoming calls.
    pub acceptor_registered: bool,
    pub constraints: MediaConstraints,
    /// Our own connection id, used to notice calls answered elsewhere.
    pub local_connection_id: Option<String>,
    pub config: NegotiationConfig,
}

impl CallOptions {
    pub fn outgoing(id: SessionId) -> Self {
        Self {
            id,
            role: Role::Caller,
            acceptor_registered: false,
            constraints: MediaConstraints::audio_only(),
            local_connection_id: None,
            config: NegotiationConfig::default(),
        }
    }

    pub fn incoming(id: SessionId, acceptor_registered: bool) -> Self {
        Self {
            role: Role::Callee,
            acceptor_registered,
            ..Self::outgoing(id)
        }
    }

    pub fn with_config(mut self, config: NegotiationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_local_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.local_connection_id = Some(connection_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerOptions {
    /// Hold local media for approval before it is used.
    pub preview: bool,
}

/// Point-in-time view of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStatus {
    pub state: StateId,
    pub role: Role,
    pub flags: MediaFlags,
    pub modifying: bool,
    pub hangup_reason: Option<String>,
    pub connectivity: ConnectivityState,
}

impl CallStatus {
    fn of(machine: &CallStateMachine, connectivity: ConnectivityState) -> Self {
        Self {
            state: machine.state(),
            role: machine.role(),
            flags: machine.flags(),
            modifying: machine.is_modifying(),
            hangup_reason: machine.hangup_reason().map(str::to_string),
            connectivity,
        }
    }
}

enum Input {
    Dispatch(Event),
    Approve,
    Signal(InboundSignal),
    Connectivity(ConnectivityState),
    MediaFlowing(bool),
    MediaAcquired(Result<MediaHandle, MediaError>),
    OfferCreated(Result<SessionDescription, NegotiationError>),
    OfferProcessed(Result<SessionDescription, NegotiationError>),
    AnswerFailed(NegotiationError),
}

enum Command {
    CreateOffer,
    ProcessOffer {
        offer: SessionDescription,
        connection_id: Option<String>,
    },
    SetAnswer {
        answer: SessionDescription,
        connection_id: Option<String>,
    },
    LocalCandidate(Option<IceCandidate>),
    RemoteCandidate(IceCandidate),
    Approve,
    Renegotiate,
    Bye {
        reason: Option<String>,
    },
    Close {
        signal: Option<bool>,
    },
}

/// Handle to a running call.
pub struct Call {
    id: SessionId,
    config: NegotiationConfig,
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<CallStatus>,
    report: watch::Receiver<NegotiationReport>,
    notifications: broadcast::Sender<Lifecycle>,
    approved: Deferred<()>,
    closed: Deferred<bool>,
}

impl Call {
    /// Start an outgoing call, or any call whose offer arrives later.
    pub fn start(options: CallOptions, deps: CallDependencies) -> Self {
        Self::spawn(options, deps, None)
    }

    /// Start a call for an offer that has already arrived.
    pub fn incoming(
        options: CallOptions,
        offer: SessionDescription,
        connection_id: Option<String>,
        deps: CallDependencies,
    ) -> Self {
        Self::spawn(options, deps, Some((offer, connection_id)))
    }

    fn spawn(
        options: CallOptions,
        deps: CallDependencies,
        pending_offer: Option<(SessionDescription, Option<String>)>,
    ) -> Self {
        let (machine, timers) =
            CallStateMachine::new(options.id.clone(), options.role, options.config.clone());
        let role = machine.watch_role();
        let notifications = machine.notifier();

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let coordinator = NegotiationCoordinator::new(
            options.id.clone(),
            role,
            deps.gateway.clone(),
            &options.config,
        );
        let approved = coordinator.approved();
        let closed = coordinator.closed();
        let (report_tx, report_rx) = watch::channel(coordinator.report().clone());
        let worker = NegotiationWorker {
            coordinator,
            transports: deps.transports.clone(),
            commands: commands_tx.clone(),
            inputs: inputs_tx.clone(),
            report: report_tx,
        };
        tokio::spawn(worker.run(commands_rx));

        let (status_tx, status_rx) =
            watch::channel(CallStatus::of(&machine, ConnectivityState::New));
        let actor = CallActor {
            machine,
            timers,
            inputs: inputs_rx,
            inputs_tx: inputs_tx.clone(),
            commands: commands_tx,
            media: deps.media,
            constraints: options.constraints,
            local_connection_id: options.local_connection_id,
            preview: false,
            approval_forwarded: false,
            pending_offer,
            local_media: None,
            connectivity: ConnectivityState::New,
            status: status_tx,
        };
        tokio::spawn(actor.run());

        info!(target: "Call/Session", "{}: starting call as {}", options.id, options.role);
        let _ = inputs_tx.send(Input::Dispatch(Event::Initiate {
            role: options.role,
            acceptor_registered: options.acceptor_registered,
        }));

        Self {
            id: options.id,
            config: options.config,
            inputs: inputs_tx,
            status: status_rx,
            report: report_rx,
            notifications,
            approved,
            closed,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> StateId {
        self.status.borrow().state
    }

    pub fn role(&self) -> Role {
        self.status.borrow().role
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_final()
    }

    /// Latest negotiation report.
    pub fn report(&self) -> NegotiationReport {
        self.report.borrow().clone()
    }

    /// Lifecycle notifications emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Lifecycle> {
        self.notifications.subscribe()
    }

    /// Answer the call. The caller answers its own call too, which is what
    /// starts local media acquisition.
    pub fn answer(&self, options: AnswerOptions) -> Result<(), CallError> {
        let approver = {
            let inputs = self.inputs.clone();
            Approver::new(move || {
                let _ = inputs.send(Input::Approve);
            })
        };
        self.post(Input::Dispatch(Event::Answer(AnswerParams {
            preview: options.preview,
            receive_only: self.config.receive_only,
            direct_connection_only: self.config.direct_connection_only,
            approve: Some(approver),
        })))
    }

    /// Approve previewed local media.
    pub fn approve(&self) -> Result<(), CallError> {
        self.post(Input::Approve)
    }

    pub fn reject(&self, reason: Option<String>) -> Result<(), CallError> {
        self.post(Input::Dispatch(Event::Reject { reason }))
    }

    pub fn hangup(&self, reason: Option<String>) -> Result<(), CallError> {
        self.post(Input::Dispatch(Event::Hangup {
            signal: None,
            reason,
        }))
    }

    /// Start renegotiating an established call.
    pub fn modify(&self) -> Result<(), CallError> {
        self.post(Input::Dispatch(Event::Modify { receive: None }))
    }

    /// The peer asked to renegotiate; we become the callee of the new exchange.
    pub fn receive_modify(&self) -> Result<(), CallError> {
        self.post(Input::Dispatch(Event::Modify {
            receive: Some(true),
        }))
    }

    /// The peer accepted our renegotiation request.
    pub fn accept_modify(&self) -> Result<(), CallError> {
        self.post(Input::Dispatch(Event::Accept))
    }

    pub fn set_media_flowing(&self, flowing: bool) -> Result<(), CallError> {
        self.post(Input::MediaFlowing(flowing))
    }

    pub fn handle_signal(&self, signal: InboundSignal) -> Result<(), CallError> {
        self.post(Input::Signal(signal))
    }

    /// Wait until the call reaches `state`.
    ///
    /// Fails if the call terminates first, unless `state` is `Terminated`.
    pub async fn wait_for_state(&self, state: StateId) -> Result<(), CallError> {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().state;
            if current == state {
                return Ok(());
            }
            if current.is_final() {
                return Err(CallError::Terminated(self.id.clone()));
            }
            if status.changed().await.is_err() {
                return Err(CallError::Closed);
            }
        }
    }

    pub async fn terminated(&self) -> Result<(), CallError> {
        self.wait_for_state(StateId::Terminated).await
    }

    /// Whether local acceptance of the call was granted. Rejected when the
    /// call closed without it.
    pub fn approval(&self) -> Settlement<()> {
        self.approved.state()
    }

    /// Wait for the negotiation to close. Returns whether a bye was sent.
    pub async fn closed(&self) -> bool {
        self.closed.wait().await.unwrap_or(false)
    }

    fn post(&self, input: Input) -> Result<(), CallError> {
        self.inputs
            .send(input)
            .map_err(|_| CallError::Terminated(self.id.clone()))
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

struct CallActor {
    machine: CallStateMachine,
    timers: mpsc::UnboundedReceiver<TimerExpired>,
    inputs: mpsc::UnboundedReceiver<Input>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    commands: mpsc::UnboundedSender<Command>,
    media: Arc<dyn MediaProvider>,
    constraints: MediaConstraints,
    local_connection_id: Option<String>,
    preview: bool,
    approval_forwarded: bool,
    pending_offer: Option<(SessionDescription, Option<String>)>,
    local_media: Option<MediaHandle>,
    connectivity: ConnectivityState,
    status: watch::Sender<CallStatus>,
}

impl CallActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(input) = self.inputs.recv() => self.handle_input(input),
                Some(expired) = self.timers.recv() => {
                    let notifications = self.machine.on_timer_expired(expired);
                    self.react(notifications);
                }
                else => break,
            }
            self.status
                .send_replace(CallStatus::of(&self.machine, self.connectivity));
            if self.machine.is_terminated() {
                break;
            }
        }

        if let Some(handle) = self.local_media.take() {
            self.media.release(&handle).await;
        }
        debug!(target: "Call/Session", "{}: call task finished", self.machine.id());
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Dispatch(event) => {
                if let Event::Answer(params) = &event {
                    self.preview = params.preview;
                }
                self.dispatch(event);
            }
            Input::Approve => {
                self.approval_forwarded = true;
                self.command(Command::Approve);
                self.dispatch(Event::Approve { preview: false });
            }
            Input::Signal(signal) => self.handle_signal(signal),
            Input::Connectivity(state) => self.on_connectivity(state),
            Input::MediaFlowing(flowing) => self.machine.set_media_flowing(flowing),
            Input::MediaAcquired(Ok(handle)) => {
                debug!(target: "Call/Session", "{}: local media {} granted", self.machine.id(), handle.id);
                self.local_media = Some(handle);
                self.dispatch(Event::Approve {
                    preview: self.preview,
                });
                self.dispatch(Event::ReceiveLocalMedia);
            }
            Input::MediaAcquired(Err(e)) => {
                warn!(target: "Call/Session", "{}: local media unavailable: {e}", self.machine.id());
                self.dispatch(Event::hangup(format!("media error: {e}")));
            }
            Input::OfferCreated(Ok(_)) => self.dispatch(Event::SentOffer),
            Input::OfferCreated(Err(e)) => self.dispatch(Event::reject(format!("offer failed: {e}"))),
            Input::OfferProcessed(Ok(_)) => {
                debug!(target: "Call/Session", "{}: offer answered", self.machine.id());
            }
            Input::OfferProcessed(Err(NegotiationError::CallerReceivedOffer)) => {}
            Input::OfferProcessed(Err(e)) => {
                self.dispatch(Event::reject(format!("answer failed: {e}")))
            }
            Input::AnswerFailed(e) => self.dispatch(Event::Hangup {
                signal: Some(false),
                reason: Some(e.to_string()),
            }),
        }
    }

    fn handle_signal(&mut self, signal: InboundSignal) {
        debug!(target: "Call/Session", "{}: received {} in {}", self.machine.id(), signal.kind(), self.machine.state());
        match signal {
            InboundSignal::Offer {
                description,
                connection_id,
            } => {
                if self.machine.role().is_caller() || self.machine.state() == StateId::Connecting {
                    self.command(Command::ProcessOffer {
                        offer: description,
                        connection_id,
                    });
                } else {
                    self.pending_offer = Some((description, connection_id));
                }
            }
            InboundSignal::Answer {
                description,
                connection_id,
            } => {
                if matches!(
                    self.machine.state(),
                    StateId::Offering | StateId::Connecting | StateId::Connected
                ) {
                    self.dispatch(Event::ReceiveAnswer);
                    self.command(Command::SetAnswer {
                        answer: description,
                        connection_id,
                    });
                } else {
                    debug!(target: "Call/Session", "{}: ignoring answer in {}", self.machine.id(), self.machine.state());
                }
            }
            InboundSignal::Candidate { candidate, .. } => {
                self.command(Command::RemoteCandidate(candidate))
            }
            InboundSignal::Connected { connection_id } => {
                if let (Some(local), Some(winner)) = (&self.local_connection_id, &connection_id)
                    && local != winner
                {
                    info!(target: "Call/Session", "{}: answered on another connection", self.machine.id());
                    self.dispatch(Event::Hangup {
                        signal: Some(false),
                        reason: Some("answered elsewhere".to_string()),
                    });
                }
            }
            InboundSignal::Bye { reason } => {
                self.machine.set_received_bye();
                self.command(Command::Bye {
                    reason: reason.clone(),
                });
                self.dispatch(Event::Hangup {
                    signal: Some(false),
                    reason: Some(reason.unwrap_or_else(|| "Remote side hung up".to_string())),
                });
            }
        }
    }

    fn on_connectivity(&mut self, state: ConnectivityState) {
        debug!(target: "Call/Session", "{}: connectivity {state}", self.machine.id());
        self.connectivity = state;
        match state {
            ConnectivityState::Connected => {
                self.machine.set_media_flowing(true);
                self.dispatch(Event::ReceiveRemoteMedia);
            }
            ConnectivityState::Failed => {
                self.machine.set_media_flowing(false);
                self.dispatch(Event::reject("connectivity failed"));
            }
            ConnectivityState::Disconnected | ConnectivityState::Closed => {
                self.machine.set_media_flowing(false)
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, event: Event) {
        let notifications = self.machine.dispatch(event);
        if !self.approval_forwarded && self.machine.flags().has_local_media_approval {
            self.approval_forwarded = true;
            self.command(Command::Approve);
        }
        self.react(notifications);
    }

    fn react(&mut self, notifications: Vec<Lifecycle>) {
        for lifecycle in notifications {
            if lifecycle.phase != Phase::Entry {
                continue;
            }
            match lifecycle.state {
                StateId::ApprovingDeviceAccess => self.acquire_media(),
                StateId::Offering => self.command(Command::CreateOffer),
                StateId::Connecting if !self.machine.role().is_caller() => {
                    match self.pending_offer.take() {
                        Some((offer, connection_id)) => self.command(Command::ProcessOffer {
                            offer,
                            connection_id,
                        }),
                        None => {
                            debug!(target: "Call/Session", "{}: connecting, waiting for offer", self.machine.id())
                        }
                    }
                }
                StateId::Preparing if self.machine.flags().is_media_flowing => {
                    self.command(Command::Renegotiate)
                }
                StateId::Terminated => {
                    info!(
                        target: "Call/Session",
                        "{}: terminated ({})",
                        self.machine.id(),
                        self.machine.hangup_reason().unwrap_or("none")
                    );
                    self.command(Command::Close {
                        signal: self.machine.bye_preference(),
                    });
                }
                _ => {}
            }
        }
    }

    fn acquire_media(&self) {
        if let Some(handle) = &self.local_media {
            let _ = self.inputs_tx.send(Input::MediaAcquired(Ok(handle.clone())));
            return;
        }
        let media = self.media.clone();
        let constraints = self.constraints;
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(&constraints).await;
            if let Err(mpsc::error::SendError(Input::MediaAcquired(Ok(handle)))) =
                inputs.send(Input::MediaAcquired(result))
            {
                media.release(&handle).await;
            }
        });
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(target: "Call/Session", "{}: negotiation already finished", self.machine.id());
        }
    }
}

struct NegotiationWorker {
    coordinator: NegotiationCoordinator,
    transports: Arc<dyn TransportFactory>,
    commands: mpsc::UnboundedSender<Command>,
    inputs: mpsc::UnboundedSender<Input>,
    report: watch::Sender<NegotiationReport>,
}

impl NegotiationWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
            self.report.send_replace(self.coordinator.report().clone());
            if self.coordinator.is_closed() {
                break;
            }
        }
        debug!(target: "Call/Negotiation", "{}: negotiation task finished", self.coordinator.session());
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::CreateOffer => {
                let result = match self.ensure_transport().await {
                    Ok(()) => self.coordinator.create_offer().await,
                    Err(e) => Err(e),
                };
                self.post(Input::OfferCreated(result));
            }
            Command::ProcessOffer {
                offer,
                connection_id,
            } => {
                let mut result = Ok(());
                if !self.coordinator.role().is_caller() {
                    result = self.ensure_transport().await;
                }
                let result = match result {
                    Ok(()) => self.coordinator.process_offer(offer, connection_id).await,
                    Err(e) => Err(e),
                };
                self.post(Input::OfferProcessed(result));
            }
            Command::SetAnswer {
                answer,
                connection_id,
            } => {
                if let Err(e) = self.coordinator.set_answer(answer, connection_id).await {
                    self.post(Input::AnswerFailed(e));
                }
            }
            Command::LocalCandidate(candidate) => {
                self.coordinator.on_local_candidate(candidate).await
            }
            Command::RemoteCandidate(candidate) => {
                if let Err(e) = self.coordinator.add_remote_candidate(candidate).await {
                    warn!(target: "Call/Negotiation", "{}: {e}", self.coordinator.session());
                }
            }
            Command::Approve => self.coordinator.approve(),
            Command::Renegotiate => self.coordinator.begin_renegotiation(),
            Command::Bye { reason } => self.coordinator.set_bye(reason.as_deref()).await,
            Command::Close { signal } => {
                self.coordinator.close(signal).await;
            }
        }
    }

    async fn ensure_transport(&mut self) -> Result<(), NegotiationError> {
        if self.coordinator.has_session() {
            return Ok(());
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self
            .transports
            .create(self.coordinator.session(), events_tx)
            .await
            .map_err(|e| {
                warn!(target: "Call/Negotiation", "{}: could not create transport: {e:?}", self.coordinator.session());
                NegotiationError::NoSession
            })?;
        self.coordinator.init(transport);
        tokio::spawn(forward_transport_events(
            events_rx,
            self.commands.clone(),
            self.inputs.clone(),
        ));
        Ok(())
    }

    fn post(&self, input: Input) {
        let _ = self.inputs.send(input);
    }
}

async fn forward_transport_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedSender<Command>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    while let Some(event) = events.recv().await {
        let delivered = match event {
            TransportEvent::LocalCandidate(candidate) => {
                commands.send(Command::LocalCandidate(candidate)).is_ok()
            }
            TransportEvent::ConnectivityChanged(state) => {
                inputs.send(Input::Connectivity(state)).is_ok()
            }
        };
        if !delivered {
            break;
        }
    }
}
