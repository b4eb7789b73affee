use async_trait::async_trait;
use call_negotiation::calls::loopback::{
    LoopbackBus, LoopbackEndpoint, LoopbackGateway, LoopbackMedia, OutboundSignal,
    ScriptedTransportFactory,
};
use call_negotiation::calls::{
    AnswerOptions, Call, CallAcceptor, CallDependencies, CallManager, CallManagerConfig,
    IceCandidate, InboundSignal, MediaProvider, NegotiationConfig, Role, SessionDescription,
    SessionId, Settlement, StateId,
};
use std::sync::Arc;
use std::time::Duration;

struct Answerer {
    preview: bool,
}

#[async_trait]
impl CallAcceptor for Answerer {
    async fn on_incoming_call(&self, call: Arc<Call>) {
        call.answer(AnswerOptions {
            preview: self.preview,
        })
        .unwrap();
        if self.preview && call.wait_for_state(StateId::ApprovingContent).await.is_ok() {
            call.approve().unwrap();
        }
    }
}

struct Peer {
    manager: Arc<CallManager>,
    gateway: Arc<LoopbackGateway>,
    transports: Arc<ScriptedTransportFactory>,
}

fn candidates(host: &str) -> Vec<IceCandidate> {
    vec![
        IceCandidate::new(format!("candidate:1 1 udp 2130706431 {host} 50000 typ host"))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0),
        IceCandidate::new("candidate:2 1 udp 41885439 198.51.100.7 3478 typ relay")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0),
    ]
}

fn peer(
    link: LoopbackEndpoint,
    host: &str,
    negotiation: NegotiationConfig,
    media: Arc<dyn MediaProvider>,
    acceptor: Option<Arc<dyn CallAcceptor>>,
    serve: bool,
) -> Peer {
    let transports =
        Arc::new(ScriptedTransportFactory::new(host).with_local_candidates(candidates(host)));
    let manager = CallManager::new(
        CallManagerConfig {
            negotiation,
            local_connection_id: Some(link.gateway.connection_id().to_string()),
            acceptor,
            ..Default::default()
        },
        CallDependencies {
            gateway: link.gateway.clone(),
            media,
            transports: transports.clone(),
        },
    );
    if serve {
        tokio::spawn(manager.clone().serve(link.inbox));
    }
    Peer {
        manager,
        gateway: link.gateway,
        transports,
    }
}

fn pair(negotiation: NegotiationConfig, preview: bool) -> (Peer, Peer) {
    let (alice, bob) = LoopbackBus::pair("alice", "bob");
    let alice = peer(
        alice,
        "10.0.0.1",
        negotiation.clone(),
        Arc::new(LoopbackMedia::granted()),
        None,
        true,
    );
    let bob = peer(
        bob,
        "10.0.0.2",
        negotiation,
        Arc::new(LoopbackMedia::granted()),
        Some(Arc::new(Answerer { preview })),
        true,
    );
    (alice, bob)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn remote_call(peer: &Peer, id: &SessionId) -> Arc<Call> {
    for _ in 0..100 {
        if let Some(call) = peer.manager.get_call(id).await {
            return call;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("call {id} never reached the remote side");
}

#[tokio::test]
async fn test_call_connects_and_hangup_reaches_peer() {
    init_logging();
    let (alice, bob) = pair(NegotiationConfig::default(), false);

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.wait_for_state(StateId::Connected).await.unwrap();

    let remote = remote_call(&bob, call.id()).await;
    remote.wait_for_state(StateId::Connected).await.unwrap();
    assert_eq!(remote.role(), Role::Callee);
    assert!(remote.status().flags.is_media_flowing);
    assert_eq!(remote.approval(), Settlement::Resolved(()));

    call.hangup(Some("done".into())).unwrap();
    assert!(call.closed().await, "caller with a sent offer says bye");

    remote.terminated().await.unwrap();
    assert!(!remote.closed().await, "a remote bye is not answered");
    assert_eq!(
        remote.status().hangup_reason.as_deref(),
        Some("Remote side hung up")
    );
    assert!(remote.status().flags.received_bye);
    assert_eq!(
        remote.approval(),
        Settlement::Resolved(()),
        "an accepted call keeps its approval after closing"
    );

    assert_eq!(alice.gateway.sent_candidates().len(), 2);
    assert_eq!(bob.gateway.sent_candidates().len(), 2);
    assert_eq!(bob.transports.created()[0].applied_candidates().len(), 2);

    let report = call.report();
    assert_eq!(report.descriptors_sent.len(), 1);
    assert_eq!(report.descriptors_received.len(), 1);
    assert_eq!(report.candidates_sent.len(), 2);
    assert!(report.stop_time.is_some());
    assert_eq!(alice.gateway.reports().len(), 1);
}

#[tokio::test]
async fn test_force_turn_only_sends_relay_candidates() {
    init_logging();
    let config = NegotiationConfig {
        force_turn: true,
        ..Default::default()
    };
    let (alice, bob) = pair(config, false);

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.wait_for_state(StateId::Connected).await.unwrap();
    call.hangup(None).unwrap();
    call.closed().await;
    remote_call(&bob, call.id()).await.closed().await;

    for gateway in [&alice.gateway, &bob.gateway] {
        let sent = gateway.sent_candidates();
        assert_eq!(sent.len(), 1);
        assert!(sent.iter().all(IceCandidate::is_relay));
    }
}

#[tokio::test]
async fn test_previewing_callee_connects_after_approval() {
    init_logging();
    let (alice, bob) = pair(NegotiationConfig::default(), true);

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.wait_for_state(StateId::Connected).await.unwrap();

    let remote = remote_call(&bob, call.id()).await;
    remote.wait_for_state(StateId::Connected).await.unwrap();
    assert!(remote.status().flags.has_local_media_approval);
    assert_eq!(remote.approval(), Settlement::Resolved(()));
}

#[tokio::test]
async fn test_unanswerable_call_is_refused() {
    init_logging();
    let (alice_link, bob_link) = LoopbackBus::pair("alice", "bob");
    let alice = peer(
        alice_link,
        "10.0.0.1",
        NegotiationConfig::default(),
        Arc::new(LoopbackMedia::granted()),
        None,
        true,
    );
    let bob = peer(
        bob_link,
        "10.0.0.2",
        NegotiationConfig::default(),
        Arc::new(LoopbackMedia::granted()),
        None,
        true,
    );

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.terminated().await.unwrap();
    assert_eq!(
        call.status().hangup_reason.as_deref(),
        Some("Remote side hung up")
    );
    assert_eq!(bob.gateway.terminate_count(), 1);
}

#[tokio::test]
async fn test_denied_media_ends_the_call() {
    init_logging();
    let (alice_link, _bob_link) = LoopbackBus::pair("alice", "bob");
    let alice = peer(
        alice_link,
        "10.0.0.1",
        NegotiationConfig::default(),
        Arc::new(LoopbackMedia::denied()),
        None,
        false,
    );

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.terminated().await.unwrap();

    assert_eq!(
        call.status().hangup_reason.as_deref(),
        Some("media error: permission denied")
    );
    assert!(!call.closed().await, "nothing was offered, so no bye");
    assert!(
        alice
            .gateway
            .sent()
            .iter()
            .all(|signal| matches!(signal, OutboundSignal::Report { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_offer_times_out() {
    init_logging();
    let (alice_link, _bob_link) = LoopbackBus::pair("alice", "bob");
    let config = NegotiationConfig {
        receive_answer_timeout_ms: 500,
        ..Default::default()
    };
    let alice = peer(
        alice_link,
        "10.0.0.1",
        config,
        Arc::new(LoopbackMedia::granted()),
        None,
        false,
    );

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.terminated().await.unwrap();

    assert_eq!(
        call.status().hangup_reason.as_deref(),
        Some("receive answer timer")
    );
    assert!(call.closed().await);
    assert_eq!(alice.gateway.terminate_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_that_never_answers_times_out() {
    init_logging();
    let (alice_link, _bob_link) = LoopbackBus::pair("alice", "bob");
    let alice = peer(
        alice_link,
        "10.0.0.1",
        NegotiationConfig::default(),
        Arc::new(LoopbackMedia::granted()),
        None,
        false,
    );

    let call = alice.manager.start_call(None).await.unwrap();
    assert_eq!(call.role(), Role::Caller);
    call.terminated().await.unwrap();
    assert_eq!(
        call.status().hangup_reason.as_deref(),
        Some("answer own call timer")
    );
    assert!(alice.transports.created().is_empty());
}

#[tokio::test]
async fn test_call_answered_on_another_connection() {
    init_logging();
    let (_alice_link, bob_link) = LoopbackBus::pair("alice", "bob");
    let bob = peer(
        bob_link,
        "10.0.0.2",
        NegotiationConfig::default(),
        Arc::new(LoopbackMedia::granted()),
        Some(Arc::new(Answerer { preview: false })),
        false,
    );

    let session = SessionId::new("S-ELSEWHERE");
    bob.manager
        .route_signal(
            session.clone(),
            InboundSignal::Offer {
                description: SessionDescription::offer("v=0 offer"),
                connection_id: Some("alice".into()),
            },
        )
        .await
        .unwrap();
    bob.manager
        .route_signal(
            session.clone(),
            InboundSignal::Connected {
                connection_id: Some("bob-tablet".into()),
            },
        )
        .await
        .unwrap();

    let call = bob.manager.get_call(&session).await.unwrap();
    call.terminated().await.unwrap();
    assert_eq!(
        call.status().hangup_reason.as_deref(),
        Some("answered elsewhere")
    );
    assert!(!call.closed().await);
}

#[tokio::test]
async fn test_modify_round_trip_on_connected_call() {
    init_logging();
    let (alice, _bob) = pair(NegotiationConfig::default(), false);

    let call = alice.manager.start_call(None).await.unwrap();
    call.answer(AnswerOptions::default()).unwrap();
    call.wait_for_state(StateId::Connected).await.unwrap();

    call.modify().unwrap();
    call.wait_for_state(StateId::Modifying).await.unwrap();
    assert!(call.status().modifying);

    call.accept_modify().unwrap();
    call.wait_for_state(StateId::Preparing).await.unwrap();
    let status = call.status();
    assert!(status.modifying);
    assert_eq!(status.role, Role::Caller);
    assert!(!status.flags.has_local_media);
}
