use async_trait::async_trait;
use call_negotiation::calls::loopback::{LoopbackBus, LoopbackMedia, ScriptedTransportFactory};
use call_negotiation::calls::{
    AnswerOptions, Call, CallAcceptor, CallDependencies, CallManager, CallManagerConfig,
    IceCandidate, NegotiationConfig, StateId,
};
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

// Negotiates a call between two in-process peers over a loopback signaling
// channel, keeps it up for a while, hangs up and prints both reports.
//
// Usage:
//   cargo run                                   # default settings
//   cargo run -- --duration 5 --force-turn      # relay candidates only
//   cargo run -- --preview                      # callee previews media first
//   cargo run -- --config '{"answer_timeout_ms": 2000}'

#[derive(Debug, Parser)]
#[command(about = "Negotiate a call between two in-process peers")]
struct Args {
    /// Seconds to keep the call connected before hanging up.
    #[arg(short, long, default_value_t = 2)]
    duration: u64,

    /// Exchange relay candidates only.
    #[arg(long)]
    force_turn: bool,

    /// The callee previews its local media and approves it afterwards.
    #[arg(long)]
    preview: bool,

    /// Negotiation settings as a JSON object.
    #[arg(short, long)]
    config: Option<String>,
}

struct AutoAnswer {
    preview: bool,
}

#[async_trait]
impl CallAcceptor for AutoAnswer {
    async fn on_incoming_call(&self, call: Arc<Call>) {
        info!("Answering incoming call {}", call.id());
        if let Err(e) = call.answer(AnswerOptions {
            preview: self.preview,
        }) {
            warn!("Failed to answer {}: {e}", call.id());
            return;
        }
        if self.preview && call.wait_for_state(StateId::ApprovingContent).await.is_ok() {
            info!("Approving previewed media for {}", call.id());
            let _ = call.approve();
        }
    }
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let mut negotiation = match &args.config {
        Some(json) => NegotiationConfig::from_json_str(json)?,
        None => NegotiationConfig::default(),
    };
    negotiation.force_turn |= args.force_turn;

    let (alice_link, bob_link) = LoopbackBus::pair("alice", "bob");

    let alice = CallManager::new(
        CallManagerConfig {
            negotiation: negotiation.clone(),
            local_connection_id: Some("alice".into()),
            ..Default::default()
        },
        CallDependencies {
            gateway: alice_link.gateway.clone(),
            media: Arc::new(LoopbackMedia::granted()),
            transports: Arc::new(
                ScriptedTransportFactory::new("alice").with_local_candidates(candidates("10.0.0.1")),
            ),
        },
    );
    let bob = CallManager::new(
        CallManagerConfig {
            negotiation,
            local_connection_id: Some("bob".into()),
            acceptor: Some(Arc::new(AutoAnswer {
                preview: args.preview,
            })),
            ..Default::default()
        },
        CallDependencies {
            gateway: bob_link.gateway.clone(),
            media: Arc::new(LoopbackMedia::granted()),
            transports: Arc::new(
                ScriptedTransportFactory::new("bob").with_local_candidates(candidates("10.0.0.2")),
            ),
        },
    );

    tokio::spawn(alice.clone().serve(alice_link.inbox));
    tokio::spawn(bob.clone().serve(bob_link.inbox));

    let call = alice.start_call(None).await?;
    info!("Calling from alice, session {}", call.id());
    call.answer(AnswerOptions::default())?;

    tokio::select! {
        result = call.wait_for_state(StateId::Connected) => {
            if let Err(e) = result {
                error!("Call did not connect: {e}");
            } else {
                info!("Connected, hanging up in {}s", args.duration);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                }
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    alice.hangup_all("demo finished").await;
    if let Some(remote) = bob.get_call(call.id()).await {
        let _ = remote.terminated().await;
        remote.closed().await;
    }

    for (name, gateway) in [("alice", &alice_link.gateway), ("bob", &bob_link.gateway)] {
        for (session, report) in gateway.reports() {
            println!("{name} {session}: {}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
