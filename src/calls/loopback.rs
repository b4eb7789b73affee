//! In-process signaling, transport and media for demos and tests.
//!
//! [`LoopbackBus::pair`] wires two [`LoopbackGateway`]s back to back so that
//! whatever one side sends arrives in the other side's inbox as an
//! [`InboundSignal`]. [`ScriptedTransport`] stands in for a real peer
//! connection: it connects as soon as both descriptions are applied and can
//! be told to fail individual steps.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use log::{debug, trace};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::media::{MediaConstraints, MediaError, MediaHandle, MediaProvider};
use super::report::NegotiationReport;
use super::signaling::{InboundSignal, SignalingGateway};
use super::transport::{
    ConnectivityState, IceCandidate, SessionDescription, TransportEvent, TransportEvents,
    TransportFactory, TransportSession,
};
use super::types::SessionId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type SignalInbox = mpsc::UnboundedReceiver<(SessionId, InboundSignal)>;
type SignalOutbox = mpsc::UnboundedSender<(SessionId, InboundSignal)>;

/// A message recorded by a [`LoopbackGateway`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundSignal {
    Offer {
        session: SessionId,
        description: SessionDescription,
    },
    Answer {
        session: SessionId,
        description: SessionDescription,
        peer_connection_id: Option<String>,
    },
    Connected {
        session: SessionId,
        peer_connection_id: Option<String>,
    },
    Candidate {
        session: SessionId,
        candidate: IceCandidate,
        peer_connection_id: Option<String>,
    },
    Terminate {
        session: SessionId,
        peer_connection_id: Option<String>,
    },
    Report {
        session: SessionId,
    },
}

/// Gateway that records everything it sends and forwards it to a peer inbox.
#[derive(Debug)]
pub struct LoopbackGateway {
    connection_id: String,
    peer: Option<SignalOutbox>,
    sent: Mutex<Vec<OutboundSignal>>,
    reports: Mutex<Vec<(SessionId, NegotiationReport)>>,
}

impl LoopbackGateway {
    /// A gateway with no peer; messages are only recorded.
    pub fn detached(connection_id: impl Into<String>) -> Self {
        Self::with_peer(connection_id, None)
    }

    fn with_peer(connection_id: impl Into<String>, peer: Option<SignalOutbox>) -> Self {
        Self {
            connection_id: connection_id.into(),
            peer,
            sent: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        lock(&self.sent).clone()
    }

    pub fn sent_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.sent)
            .iter()
            .filter_map(|signal| match signal {
                OutboundSignal::Candidate { candidate, .. } => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn terminate_count(&self) -> usize {
        lock(&self.sent)
            .iter()
            .filter(|signal| matches!(signal, OutboundSignal::Terminate { .. }))
            .count()
    }

    pub fn reports(&self) -> Vec<(SessionId, NegotiationReport)> {
        lock(&self.reports).clone()
    }

    fn record(&self, signal: OutboundSignal) {
        trace!(target: "Call/Loopback", "{} sent {signal:?}", self.connection_id);
        lock(&self.sent).push(signal);
    }

    fn deliver(&self, session: &SessionId, signal: InboundSignal) -> anyhow::Result<()> {
        let Some(peer) = &self.peer else {
            return Ok(());
        };
        peer.send((session.clone(), signal))
            .map_err(|_| anyhow!("loopback peer is gone"))
    }

    fn own_id(&self) -> Option<String> {
        Some(self.connection_id.clone())
    }
}

#[async_trait]
impl SignalingGateway for LoopbackGateway {
    async fn send_offer(
        &self,
        session: &SessionId,
        offer: &SessionDescription,
    ) -> anyhow::Result<()> {
        self.record(OutboundSignal::Offer {
            session: session.clone(),
            description: offer.clone(),
        });
        self.deliver(
            session,
            InboundSignal::Offer {
                description: offer.clone(),
                connection_id: self.own_id(),
            },
        )
    }

    async fn send_answer(
        &self,
        session: &SessionId,
        answer: &SessionDescription,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(OutboundSignal::Answer {
            session: session.clone(),
            description: answer.clone(),
            peer_connection_id: peer_connection_id.map(str::to_string),
        });
        self.deliver(
            session,
            InboundSignal::Answer {
                description: answer.clone(),
                connection_id: self.own_id(),
            },
        )
    }

    async fn send_connected(
        &self,
        session: &SessionId,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(OutboundSignal::Connected {
            session: session.clone(),
            peer_connection_id: peer_connection_id.map(str::to_string),
        });
        self.deliver(
            session,
            InboundSignal::Connected {
                connection_id: peer_connection_id.map(str::to_string),
            },
        )
    }

    async fn send_candidate(
        &self,
        session: &SessionId,
        candidate: &IceCandidate,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(OutboundSignal::Candidate {
            session: session.clone(),
            candidate: candidate.clone(),
            peer_connection_id: peer_connection_id.map(str::to_string),
        });
        self.deliver(
            session,
            InboundSignal::Candidate {
                candidate: candidate.clone(),
                connection_id: self.own_id(),
            },
        )
    }

    async fn send_terminate(
        &self,
        session: &SessionId,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(OutboundSignal::Terminate {
            session: session.clone(),
            peer_connection_id: peer_connection_id.map(str::to_string),
        });
        self.deliver(session, InboundSignal::Bye { reason: None })
    }

    async fn send_report(
        &self,
        session: &SessionId,
        report: &NegotiationReport,
        _peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(OutboundSignal::Report {
            session: session.clone(),
        });
        lock(&self.reports).push((session.clone(), report.clone()));
        Ok(())
    }
}

/// One side of a loopback pair.
pub struct LoopbackEndpoint {
    pub gateway: Arc<LoopbackGateway>,
    pub inbox: SignalInbox,
}

/// Factory for back-to-back gateway pairs.
pub struct LoopbackBus;

impl LoopbackBus {
    pub fn pair(
        first_connection_id: &str,
        second_connection_id: &str,
    ) -> (LoopbackEndpoint, LoopbackEndpoint) {
        let (first_tx, first_inbox) = mpsc::unbounded_channel();
        let (second_tx, second_inbox) = mpsc::unbounded_channel();
        let first = LoopbackEndpoint {
            gateway: Arc::new(LoopbackGateway::with_peer(
                first_connection_id,
                Some(second_tx),
            )),
            inbox: first_inbox,
        };
        let second = LoopbackEndpoint {
            gateway: Arc::new(LoopbackGateway::with_peer(
                second_connection_id,
                Some(first_tx),
            )),
            inbox: second_inbox,
        };
        (first, second)
    }
}

/// Steps of a [`ScriptedTransport`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptStep {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

#[derive(Debug, Default)]
struct ScriptState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connectivity: ConnectivityState,
    descriptions_created: u32,
}

/// Transport session that negotiates with itself.
#[derive(Debug)]
pub struct ScriptedTransport {
    label: String,
    events: TransportEvents,
    local_candidates: Vec<IceCandidate>,
    failures: Mutex<HashSet<ScriptStep>>,
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    pub fn new(label: impl Into<String>, events: TransportEvents) -> Self {
        Self {
            label: label.into(),
            events,
            local_candidates: Vec::new(),
            failures: Mutex::new(HashSet::new()),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Candidates announced every time a local description is applied.
    pub fn with_local_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.local_candidates = candidates;
        self
    }

    pub fn fail_on(&self, step: ScriptStep) {
        lock(&self.failures).insert(step);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    fn check(&self, step: ScriptStep) -> anyhow::Result<()> {
        if lock(&self.failures).contains(&step) {
            bail!("scripted {step:?} failure");
        }
        Ok(())
    }

    fn next_sdp(&self, kind: &str) -> String {
        let mut state = lock(&self.state);
        state.descriptions_created += 1;
        format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns={kind}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.label, state.descriptions_created
        )
    }

    fn set_connectivity(&self, connectivity: ConnectivityState) {
        {
            let mut state = lock(&self.state);
            if state.connectivity == connectivity {
                return;
            }
            state.connectivity = connectivity;
        }
        debug!(target: "Call/Loopback", "{} connectivity {connectivity}", self.label);
        let _ = self
            .events
            .send(TransportEvent::ConnectivityChanged(connectivity));
    }

    fn connect_if_ready(&self) {
        let ready = {
            let state = lock(&self.state);
            state.local.is_some() && state.remote.is_some()
        };
        if ready {
            self.set_connectivity(ConnectivityState::Connected);
        }
    }
}

#[async_trait]
impl TransportSession for ScriptedTransport {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.check(ScriptStep::CreateOffer)?;
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.check(ScriptStep::CreateAnswer)?;
        if lock(&self.state).remote.is_none() {
            bail!("cannot answer without a remote offer");
        }
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> anyhow::Result<()> {
        self.check(ScriptStep::SetLocalDescription)?;
        lock(&self.state).local = Some(description.clone());
        for candidate in &self.local_candidates {
            let _ = self
                .events
                .send(TransportEvent::LocalCandidate(Some(candidate.clone())));
        }
        let _ = self.events.send(TransportEvent::LocalCandidate(None));
        self.set_connectivity(ConnectivityState::Checking);
        self.connect_if_ready();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> anyhow::Result<()> {
        self.check(ScriptStep::SetRemoteDescription)?;
        lock(&self.state).remote = Some(description.clone());
        self.connect_if_ready();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        self.check(ScriptStep::AddIceCandidate)?;
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            bail!("no remote description");
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    fn connectivity_state(&self) -> ConnectivityState {
        lock(&self.state).connectivity
    }

    async fn close(&self) {
        self.set_connectivity(ConnectivityState::Closed);
    }
}

/// Creates [`ScriptedTransport`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct ScriptedTransportFactory {
    label: String,
    local_candidates: Vec<IceCandidate>,
    failures: Vec<ScriptStep>,
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedTransportFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_local_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.local_candidates = candidates;
        self
    }

    /// Every transport created from now on fails at `step`.
    pub fn failing(mut self, step: ScriptStep) -> Self {
        self.failures.push(step);
        self
    }

    pub fn created(&self) -> Vec<Arc<ScriptedTransport>> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl TransportFactory for ScriptedTransportFactory {
    async fn create(
        &self,
        session: &SessionId,
        events: TransportEvents,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let transport = Arc::new(
            ScriptedTransport::new(format!("{}-{session}", self.label), events)
                .with_local_candidates(self.local_candidates.clone()),
        );
        for step in &self.failures {
            transport.fail_on(*step);
        }
        lock(&self.created).push(transport.clone());
        Ok(transport)
    }
}

/// Media provider that grants or denies every request immediately.
#[derive(Debug, Default)]
pub struct LoopbackMedia {
    deny: AtomicBool,
    acquired: AtomicUsize,
}

impl LoopbackMedia {
    pub fn granted() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            deny: AtomicBool::new(true),
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProvider for LoopbackMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaHandle {
            id: format!("loopback-{n}"),
            constraints: *constraints,
        })
    }
}
