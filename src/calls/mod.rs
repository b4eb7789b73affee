//! Peer-to-peer call negotiation.
//!
//! A call goes through a hierarchical state machine (idle, negotiating,
//! connected, terminated) while a negotiation coordinator exchanges session
//! descriptions and connectivity candidates with the remote peer over a
//! signaling channel.
//!
//! # Architecture
//!
//! - [`CallStateMachine`]: states, guarded transitions, timers and lifecycle notifications
//! - [`NegotiationCoordinator`]: offer/answer exchange and candidate queueing
//! - [`Call`]: wires both together with local media and a transport session
//! - [`CallManager`]: tracks calls and routes inbound signals to them
//! - [`SignalingGateway`], [`TransportFactory`] and [`MediaProvider`]: the
//!   seams to the signaling service, the peer connection and capture devices
//!
//! The [`loopback`] module provides in-process implementations of those seams
//! for tests and demos.

mod call;
mod config;
mod coordinator;
mod deferred;
mod error;
mod event;
pub mod loopback;
mod machine;
mod manager;
mod media;
mod report;
mod signaling;
mod state;
mod timer;
mod transport;
mod types;
#[cfg(feature = "webrtc")]
mod webrtc;

pub use call::{AnswerOptions, Call, CallDependencies, CallOptions, CallStatus};
pub use config::NegotiationConfig;
pub use coordinator::NegotiationCoordinator;
pub use deferred::{Deferred, Settlement};
pub use error::{CallError, NegotiationError};
pub use event::{AnswerParams, Approver, Event, EventKind};
pub use machine::{CallStateMachine, TimerExpired};
pub use manager::{CallAcceptor, CallManager, CallManagerConfig};
pub use media::{MediaConstraints, MediaError, MediaHandle, MediaProvider, SharedMediaProvider};
pub use report::NegotiationReport;
pub use signaling::{InboundSignal, SignalingGateway};
pub use state::{Lifecycle, MediaFlags, Phase, Snapshot, StateId};
pub use timer::{TimerHandle, TimerKind, TimerService};
pub use transport::{
    CandidateType, ConnectivityState, DescriptionKind, IceCandidate, SessionDescription,
    TransportEvent, TransportEvents, TransportFactory, TransportSession,
};
pub use types::{Role, SessionId};
#[cfg(feature = "webrtc")]
pub use webrtc::{WebRtcSession, WebRtcTransportConfig, WebRtcTransportFactory};
