//! Offer/answer exchange and ICE candidate queueing for one call.
//!
//! The coordinator owns the call's [`TransportSession`] and talks to the
//! remote side through a [`SignalingGateway`]. It never drives the state
//! machine; callers feed its results back as events.
//!
//! # Candidate queueing
//!
//! Candidates are held back while the other side could not use them yet:
//!
//! - outbound candidates queue while we are the caller and no answer has
//!   been received;
//! - inbound candidates queue while no transport session exists, or while
//!   we are the caller and no answer has been received.
//!
//! Both queues drain in arrival order as soon as the answer is applied (or,
//! for the callee, once our answer has been sent).

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

use super::config::NegotiationConfig;
use super::deferred::Deferred;
use super::error::NegotiationError;
use super::report::NegotiationReport;
use super::signaling::SignalingGateway;
use super::transport::{DescriptionKind, IceCandidate, SessionDescription, TransportSession};
use super::types::{Role, SessionId};

pub struct NegotiationCoordinator {
    session: SessionId,
    role: watch::Receiver<Role>,
    gateway: Arc<dyn SignalingGateway>,
    force_turn: bool,
    transport: Option<Arc<dyn TransportSession>>,
    /// Remote endpoint we are negotiating with.
    connection_id: Option<String>,
    outbound_queue: Vec<IceCandidate>,
    inbound_queue: Vec<IceCandidate>,
    report: NegotiationReport,
    offer: Deferred<SessionDescription>,
    answer: Deferred<SessionDescription>,
    approved: Deferred<()>,
    /// Resolved with whether a bye was sent.
    closed: Deferred<bool>,
}

impl NegotiationCoordinator {
    pub fn new(
        session: SessionId,
        role: watch::Receiver<Role>,
        gateway: Arc<dyn SignalingGateway>,
        config: &NegotiationConfig,
    ) -> Self {
        Self {
            session,
            role,
            gateway,
            force_turn: config.force_turn,
            transport: None,
            connection_id: None,
            outbound_queue: Vec::new(),
            inbound_queue: Vec::new(),
            report: NegotiationReport::default(),
            offer: Deferred::new(),
            answer: Deferred::new(),
            approved: Deferred::new(),
            closed: Deferred::new(),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn report(&self) -> &NegotiationReport {
        &self.report
    }

    pub fn offer(&self) -> Deferred<SessionDescription> {
        self.offer.clone()
    }

    pub fn answer(&self) -> Deferred<SessionDescription> {
        self.answer.clone()
    }

    pub fn approved(&self) -> Deferred<()> {
        self.approved.clone()
    }

    pub fn closed(&self) -> Deferred<bool> {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.closed.is_pending()
    }

    pub fn has_session(&self) -> bool {
        self.transport.is_some()
    }

    /// A transport session exists and its connectivity is established.
    pub fn is_active(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.connectivity_state().is_established())
    }

    pub fn queued_outbound(&self) -> &[IceCandidate] {
        &self.outbound_queue
    }

    pub fn queued_inbound(&self) -> &[IceCandidate] {
        &self.inbound_queue
    }

    /// Attach the transport session that this negotiation drives.
    pub fn init(&mut self, transport: Arc<dyn TransportSession>) {
        debug!(target: "Call/Negotiation", "{}: transport session created", self.session);
        self.transport = Some(transport);
        self.report.mark_started();
    }

    pub fn approve(&self) {
        self.approved.resolve(());
    }

    /// Prepare for a new offer/answer exchange on the same transport.
    pub fn begin_renegotiation(&mut self) {
        debug!(target: "Call/Negotiation", "{}: starting renegotiation as {}", self.session, self.role());
        self.offer.reset();
        self.answer.reset();
    }

    /// Create an offer, apply it locally and send it to the peer.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let Some(transport) = self.transport.clone() else {
            return Err(self.fail_offer("no session at offer.", NegotiationError::NoSession));
        };

        let mut offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                return Err(self.fail_offer(
                    "Error creating SDP offer.",
                    NegotiationError::DescriptionCreation(e.to_string()),
                ));
            }
        };
        offer.kind = DescriptionKind::Offer;

        if let Err(e) = transport.set_local_description(&offer).await {
            return Err(self.fail_offer(
                "setLocalDescription failed at offer.",
                NegotiationError::LocalDescription(e.to_string()),
            ));
        }

        self.report.record_sent(&offer);
        if let Err(e) = self.gateway.send_offer(&self.session, &offer).await {
            warn!(target: "Call/Negotiation", "{}: failed to send offer: {e:?}", self.session);
        }
        self.offer.resolve(offer.clone());
        info!(target: "Call/Negotiation", "{}: offer sent", self.session);
        Ok(offer)
    }

    /// Apply a remote offer and answer it.
    ///
    /// A caller never accepts an offer: the peer is told to terminate.
    pub async fn process_offer(
        &mut self,
        offer: SessionDescription,
        connection_id: Option<String>,
    ) -> Result<SessionDescription, NegotiationError> {
        if self.role().is_caller() {
            warn!(target: "Call/Negotiation", "{}: caller received an offer", self.session);
            self.report.record_stop_reason("Got offer in precall state");
            self.send_terminate().await;
            self.offer.reject(NegotiationError::CallerReceivedOffer);
            return Err(NegotiationError::CallerReceivedOffer);
        }

        if connection_id.is_some() {
            self.connection_id = connection_id;
        }
        self.report.record_received(&offer);

        let Some(transport) = self.transport.clone() else {
            return Err(self.fail_offer("no session at offer.", NegotiationError::NoSession));
        };

        if let Err(e) = transport.set_remote_description(&offer).await {
            return Err(self.fail_offer(
                "setRemoteDescription failed at offer.",
                NegotiationError::RemoteDescription(e.to_string()),
            ));
        }

        let mut answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                return Err(self.fail_offer(
                    "Error creating SDP answer.",
                    NegotiationError::DescriptionCreation(e.to_string()),
                ));
            }
        };
        answer.kind = DescriptionKind::Answer;

        if let Err(e) = transport.set_local_description(&answer).await {
            return Err(self.fail_offer(
                "setLocalDescription failed at answer.",
                NegotiationError::LocalDescription(e.to_string()),
            ));
        }

        self.report.record_sent(&answer);
        if let Err(e) = self
            .gateway
            .send_answer(&self.session, &answer, self.connection_id.as_deref())
            .await
        {
            warn!(target: "Call/Negotiation", "{}: failed to send answer: {e:?}", self.session);
        }

        self.offer.resolve(offer);
        self.answer.resolve(answer.clone());
        info!(target: "Call/Negotiation", "{}: answer sent", self.session);
        self.drain_queues().await;
        Ok(answer)
    }

    /// Apply the remote answer.
    ///
    /// Only the first answer is used; later ones are ignored. A failure to
    /// apply it closes the negotiation.
    pub async fn set_answer(
        &mut self,
        answer: SessionDescription,
        connection_id: Option<String>,
    ) -> Result<(), NegotiationError> {
        if !self.answer.is_pending() || self.is_closed() {
            debug!(target: "Call/Negotiation", "{}: Ignoring duplicate answer.", self.session);
            return Ok(());
        }

        if connection_id.is_some() {
            self.connection_id = connection_id;
        }
        self.report.record_received(&answer);

        let Some(transport) = self.transport.clone() else {
            self.report.record_stop_reason("no session at answer.");
            self.answer.reject(NegotiationError::NoSession);
            return Err(NegotiationError::NoSession);
        };

        if let Err(e) = self
            .gateway
            .send_connected(&self.session, self.connection_id.as_deref())
            .await
        {
            warn!(target: "Call/Negotiation", "{}: failed to send connected: {e:?}", self.session);
        }

        match transport.set_remote_description(&answer).await {
            Ok(()) => {
                self.answer.resolve(answer);
                info!(target: "Call/Negotiation", "{}: answer applied", self.session);
                self.drain_queues().await;
                Ok(())
            }
            Err(e) => {
                warn!(target: "Call/Negotiation", "{}: setRemoteDescription failed at answer: {e:?}", self.session);
                self.report
                    .record_stop_reason("setRemoteDescription failed at answer.");
                let error = NegotiationError::RemoteDescription(e.to_string());
                self.answer.reject(error.clone());
                self.close(None).await;
                Err(error)
            }
        }
    }

    /// Handle a candidate discovered by the local transport.
    ///
    /// `None` marks the end of gathering.
    pub async fn on_local_candidate(&mut self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            debug!(target: "Call/Negotiation", "{}: local candidate gathering complete", self.session);
            return;
        };
        if self.is_closed() {
            return;
        }
        if self.force_turn && !candidate.is_relay() {
            debug!(target: "Call/Negotiation", "{}: dropping non-relay candidate", self.session);
            return;
        }
        if self.role().is_caller() && self.answer.is_pending() {
            debug!(target: "Call/Negotiation", "{}: queueing local candidate", self.session);
            self.outbound_queue.push(candidate);
            return;
        }
        self.send_candidate(candidate).await;
    }

    /// Handle a candidate received from the peer.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        if candidate.sdp_m_line_index.is_none() {
            warn!(target: "Call/Negotiation", "{}: dropping remote candidate without m-line index", self.session);
            return Ok(());
        }
        if self.transport.is_none() || (self.role().is_caller() && self.answer.is_pending()) {
            debug!(target: "Call/Negotiation", "{}: queueing remote candidate", self.session);
            self.inbound_queue.push(candidate);
            return Ok(());
        }
        self.apply_remote_candidate(candidate).await
    }

    /// Tear down the negotiation.
    ///
    /// Only the first call has any effect. `signal` overrides whether a
    /// termination notice is sent; by default the caller sends one only if
    /// its offer went out, and the callee always does. Returns whether a
    /// notice was sent.
    pub async fn close(&mut self, signal: Option<bool>) -> bool {
        if self.is_closed() {
            debug!(target: "Call/Negotiation", "{}: close called twice", self.session);
            return false;
        }

        let send_bye = signal.unwrap_or_else(|| !self.role().is_caller() || self.offer.is_resolved());
        if !self.role().is_caller() {
            self.approved.reject(NegotiationError::HungUpBeforeApproval);
        } else {
            self.approved.reject(NegotiationError::Closed);
        }
        self.offer.reject(NegotiationError::Closed);
        self.answer.reject(NegotiationError::Closed);

        if send_bye {
            self.send_terminate().await;
        }

        let dropped = self.outbound_queue.len() + self.inbound_queue.len();
        if dropped > 0 {
            debug!(target: "Call/Negotiation", "{}: discarding {dropped} queued candidates", self.session);
        }
        self.outbound_queue.clear();
        self.inbound_queue.clear();

        self.report.mark_stopped();
        if let Err(e) = self
            .gateway
            .send_report(&self.session, &self.report, self.connection_id.as_deref())
            .await
        {
            warn!(target: "Call/Negotiation", "{}: failed to send report: {e:?}", self.session);
        }

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.closed.resolve(send_bye);
        info!(target: "Call/Negotiation", "{}: closed (bye sent: {send_bye})", self.session);
        send_bye
    }

    /// The remote side hung up; close without sending a notice back.
    pub async fn set_bye(&mut self, reason: Option<&str>) {
        self.report
            .record_stop_reason(reason.unwrap_or("Remote side hung up"));
        self.close(Some(false)).await;
    }

    fn fail_offer(&mut self, reason: &str, error: NegotiationError) -> NegotiationError {
        warn!(target: "Call/Negotiation", "{}: {reason} {error}", self.session);
        self.report.record_stop_reason(reason);
        self.offer.reject(error.clone());
        error
    }

    async fn drain_queues(&mut self) {
        let outbound = std::mem::take(&mut self.outbound_queue);
        if !outbound.is_empty() {
            debug!(target: "Call/Negotiation", "{}: sending {} queued candidates", self.session, outbound.len());
        }
        for candidate in outbound {
            self.send_candidate(candidate).await;
        }

        let inbound = std::mem::take(&mut self.inbound_queue);
        if !inbound.is_empty() {
            debug!(target: "Call/Negotiation", "{}: applying {} queued candidates", self.session, inbound.len());
        }
        for candidate in inbound {
            if let Err(e) = self.apply_remote_candidate(candidate).await {
                warn!(target: "Call/Negotiation", "{}: {e}", self.session);
            }
        }
    }

    async fn send_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self
            .gateway
            .send_candidate(&self.session, &candidate, self.connection_id.as_deref())
            .await
        {
            warn!(target: "Call/Negotiation", "{}: failed to send candidate: {e:?}", self.session);
        }
        self.report.candidates_sent.push(candidate);
    }

    async fn apply_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let Some(transport) = self.transport.clone() else {
            return Err(NegotiationError::NoSession);
        };
        match transport.add_ice_candidate(&candidate).await {
            Ok(()) => {
                self.report.candidates_received.push(candidate);
                Ok(())
            }
            Err(e) => Err(NegotiationError::CandidateRejected(e.to_string())),
        }
    }

    async fn send_terminate(&self) {
        if let Err(e) = self
            .gateway
            .send_terminate(&self.session, self.connection_id.as_deref())
            .await
        {
            warn!(target: "Call/Negotiation", "{}: failed to send terminate: {e:?}", self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::loopback::{LoopbackGateway, OutboundSignal, ScriptStep, ScriptedTransport};
    use crate::calls::transport::TransportEvent;
    use tokio::sync::mpsc;

    struct Harness {
        coordinator: NegotiationCoordinator,
        gateway: Arc<LoopbackGateway>,
        transport: Arc<ScriptedTransport>,
        _role: watch::Sender<Role>,
        _events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(role: Role, config: NegotiationConfig) -> Harness {
        let (role_tx, role_rx) = watch::channel(role);
        let gateway = Arc::new(LoopbackGateway::detached("local"));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport::new("test", events_tx));
        let coordinator =
            NegotiationCoordinator::new(SessionId::new("S1"), role_rx, gateway.clone(), &config);
        Harness {
            coordinator,
            gateway,
            transport,
            _role: role_tx,
            _events: events_rx,
        }
    }

    fn host(n: u8) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"
        ))
        .with_sdp_m_line_index(0)
    }

    fn relay(n: u8) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{n} 1 udp 41885439 203.0.113.{n} 3478 typ relay"
        ))
        .with_sdp_m_line_index(0)
    }

    fn remote_answer() -> SessionDescription {
        SessionDescription::answer("v=0 remote answer")
    }

    /// Caller candidates wait for the answer and then go out in order.
    #[tokio::test]
    async fn test_caller_queues_local_candidates_until_answer() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.coordinator.create_offer().await.unwrap();

        for n in 1..=3 {
            h.coordinator.on_local_candidate(Some(host(n))).await;
        }
        assert!(h.gateway.sent_candidates().is_empty());
        assert_eq!(h.coordinator.queued_outbound().len(), 3);

        h.coordinator
            .set_answer(remote_answer(), Some("peer".to_string()))
            .await
            .unwrap();
        assert_eq!(h.gateway.sent_candidates(), vec![host(1), host(2), host(3)]);
        assert!(h.coordinator.queued_outbound().is_empty());

        h.coordinator.on_local_candidate(Some(host(4))).await;
        assert_eq!(h.gateway.sent_candidates().len(), 4);
        assert_eq!(h.coordinator.report().candidates_sent.len(), 4);
    }

    #[tokio::test]
    async fn test_force_turn_drops_non_relay_candidates() {
        let config = NegotiationConfig {
            force_turn: true,
            ..Default::default()
        };
        let mut h = harness(Role::Callee, config);
        h.coordinator.init(h.transport.clone());

        h.coordinator.on_local_candidate(Some(host(1))).await;
        h.coordinator.on_local_candidate(Some(relay(2))).await;
        h.coordinator.on_local_candidate(None).await;

        assert_eq!(h.gateway.sent_candidates(), vec![relay(2)]);
    }

    /// Remote candidates that arrive before the transport exists are
    /// applied once the answer has been sent.
    #[tokio::test]
    async fn test_callee_applies_early_remote_candidates_after_answering() {
        let mut h = harness(Role::Callee, NegotiationConfig::default());
        h.coordinator.add_remote_candidate(host(1)).await.unwrap();
        h.coordinator.add_remote_candidate(host(2)).await.unwrap();
        assert_eq!(h.coordinator.queued_inbound().len(), 2);

        h.coordinator.init(h.transport.clone());
        let answer = h
            .coordinator
            .process_offer(SessionDescription::offer("v=0 remote offer"), Some("caller".into()))
            .await
            .unwrap();

        assert_eq!(answer.kind, DescriptionKind::Answer);
        assert_eq!(h.transport.applied_candidates(), vec![host(1), host(2)]);
        assert!(h.coordinator.queued_inbound().is_empty());
        assert_eq!(h.coordinator.connection_id(), Some("caller"));
        assert!(matches!(
            h.gateway.sent().first(),
            Some(OutboundSignal::Answer { .. })
        ));
    }

    #[tokio::test]
    async fn test_caller_queues_remote_candidates_until_answer() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.coordinator.create_offer().await.unwrap();

        h.coordinator.add_remote_candidate(host(7)).await.unwrap();
        assert!(h.transport.applied_candidates().is_empty());

        h.coordinator.set_answer(remote_answer(), None).await.unwrap();
        assert_eq!(h.transport.applied_candidates(), vec![host(7)]);
        assert_eq!(h.coordinator.report().candidates_received, vec![host(7)]);

        h.coordinator.add_remote_candidate(host(8)).await.unwrap();
        assert_eq!(h.transport.applied_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_candidate_without_mline_index_is_dropped() {
        let mut h = harness(Role::Callee, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.coordinator
            .add_remote_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"))
            .await
            .unwrap();
        assert!(h.coordinator.queued_inbound().is_empty());
        assert!(h.transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_ignored() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.coordinator.create_offer().await.unwrap();

        h.coordinator.set_answer(remote_answer(), None).await.unwrap();
        h.coordinator
            .set_answer(SessionDescription::answer("v=0 second"), None)
            .await
            .unwrap();

        let connected = h
            .gateway
            .sent()
            .into_iter()
            .filter(|signal| matches!(signal, OutboundSignal::Connected { .. }))
            .count();
        assert_eq!(connected, 1);
        assert_eq!(
            h.transport.remote_description(),
            Some(remote_answer())
        );
        assert_eq!(h.coordinator.answer().wait().await, Ok(remote_answer()));
    }

    #[tokio::test]
    async fn test_caller_rejects_incoming_offer() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());

        let err = h
            .coordinator
            .process_offer(SessionDescription::offer("v=0"), None)
            .await
            .unwrap_err();

        assert_eq!(err, NegotiationError::CallerReceivedOffer);
        assert_eq!(h.gateway.terminate_count(), 1);
        assert!(h.coordinator.offer().is_rejected());
        assert_eq!(
            h.coordinator.report().stop_reason.as_deref(),
            Some("Got offer in precall state")
        );
    }

    #[tokio::test]
    async fn test_failed_answer_closes_negotiation() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.coordinator.create_offer().await.unwrap();
        h.transport.fail_on(ScriptStep::SetRemoteDescription);

        let err = h
            .coordinator
            .set_answer(remote_answer(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::RemoteDescription(_)));
        assert!(h.coordinator.is_closed());
        assert!(!h.coordinator.has_session());
        assert_eq!(h.gateway.terminate_count(), 1);
        assert_eq!(
            h.coordinator.report().stop_reason.as_deref(),
            Some("setRemoteDescription failed at answer.")
        );
        assert_eq!(h.gateway.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_offer_is_recorded() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.transport.fail_on(ScriptStep::CreateOffer);

        let err = h.coordinator.create_offer().await.unwrap_err();
        assert!(matches!(err, NegotiationError::DescriptionCreation(_)));
        assert!(h.coordinator.offer().is_rejected());
        assert!(h.gateway.sent().is_empty());
        assert_eq!(
            h.coordinator.report().stop_reason.as_deref(),
            Some("Error creating SDP offer.")
        );
    }

    #[tokio::test]
    async fn test_offer_without_session_fails() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        assert_eq!(
            h.coordinator.create_offer().await,
            Err(NegotiationError::NoSession)
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut h = harness(Role::Callee, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());

        assert!(h.coordinator.close(None).await);
        assert!(!h.coordinator.close(None).await);

        assert_eq!(h.gateway.terminate_count(), 1);
        assert_eq!(h.gateway.reports().len(), 1);
        assert_eq!(h.coordinator.closed().wait().await, Ok(true));
    }

    #[tokio::test]
    async fn test_caller_without_offer_closes_silently() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());

        assert!(!h.coordinator.close(None).await);
        assert_eq!(h.gateway.terminate_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_signal_overrides_default() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());

        assert!(h.coordinator.close(Some(true)).await);
        assert_eq!(h.gateway.terminate_count(), 1);
    }

    #[tokio::test]
    async fn test_callee_hangup_before_approval_rejects_approval() {
        let mut h = harness(Role::Callee, NegotiationConfig::default());
        let approved = h.coordinator.approved();

        h.coordinator.close(None).await;

        assert_eq!(
            approved.wait().await,
            Err(NegotiationError::HungUpBeforeApproval)
        );
    }

    #[tokio::test]
    async fn test_remote_bye_closes_without_notice() {
        let mut h = harness(Role::Callee, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());

        h.coordinator.set_bye(None).await;

        assert!(h.coordinator.is_closed());
        assert_eq!(h.gateway.terminate_count(), 0);
        assert_eq!(
            h.coordinator.report().stop_reason.as_deref(),
            Some("Remote side hung up")
        );
        assert!(h.coordinator.report().stop_time.is_some());
    }

    #[tokio::test]
    async fn test_renegotiation_queues_again_until_new_answer() {
        let mut h = harness(Role::Caller, NegotiationConfig::default());
        h.coordinator.init(h.transport.clone());
        h.coordinator.create_offer().await.unwrap();
        h.coordinator.set_answer(remote_answer(), None).await.unwrap();

        h.coordinator.begin_renegotiation();
        assert!(h.coordinator.offer().is_pending());
        h.coordinator.on_local_candidate(Some(host(9))).await;
        assert_eq!(h.coordinator.queued_outbound().len(), 1);

        h.coordinator.create_offer().await.unwrap();
        h.coordinator
            .set_answer(SessionDescription::answer("v=0 renegotiated"), None)
            .await
            .unwrap();
        assert!(h.coordinator.queued_outbound().is_empty());
        assert_eq!(h.coordinator.report().descriptors_sent.len(), 2);
        assert_eq!(h.coordinator.report().descriptors_received.len(), 2);
    }
}
