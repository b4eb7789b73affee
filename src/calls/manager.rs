//! Call manager for orchestrating call lifecycle.

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use super::call::{Call, CallDependencies, CallOptions};
use super::config::NegotiationConfig;
use super::error::CallError;
use super::media::MediaConstraints;
use super::signaling::InboundSignal;
use super::types::SessionId;

/// Receives calls started by a remote peer.
///
/// Without an acceptor, incoming calls are terminated straight away and the
/// caller is told so.
#[async_trait]
pub trait CallAcceptor: Send + Sync {
    async fn on_incoming_call(&self, call: Arc<Call>);
}

/// Configuration for the call manager.
#[derive(Clone)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls allowed.
    pub max_concurrent_calls: usize,
    pub negotiation: NegotiationConfig,
    pub constraints: MediaConstraints,
    /// Our connection id, sent along with answers.
    pub local_connection_id: Option<String>,
    pub acceptor: Option<Arc<dyn CallAcceptor>>,
}

impl std::fmt::Debug for CallManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManagerConfig")
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("negotiation", &self.negotiation)
            .field("constraints", &self.constraints)
            .field("local_connection_id", &self.local_connection_id)
            .field("acceptor", &self.acceptor.is_some())
            .finish()
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            negotiation: NegotiationConfig::default(),
            constraints: MediaConstraints::audio_only(),
            local_connection_id: None,
            acceptor: None,
        }
    }
}

/// Tracks the calls of one endpoint and routes signals to them.
pub struct CallManager {
    config: CallManagerConfig,
    deps: CallDependencies,
    /// Calls indexed by session id.
    calls: RwLock<HashMap<SessionId, Arc<Call>>>,
}

impl CallManager {
    pub fn new(config: CallManagerConfig, deps: CallDependencies) -> Arc<Self> {
        Arc::new(Self {
            config,
            deps,
            calls: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    /// Start an outgoing call. A fresh session id is generated when `id` is `None`.
    pub async fn start_call(&self, id: Option<SessionId>) -> Result<Arc<Call>, CallError> {
        self.cleanup_terminated_calls().await;

        let id = id.unwrap_or_else(SessionId::generate);
        let mut calls = self.calls.write().await;
        self.check_capacity(&calls, &id)?;

        let call = Arc::new(Call::start(
            self.options(CallOptions::outgoing(id.clone())),
            self.deps.clone(),
        ));
        calls.insert(id, call.clone());
        Ok(call)
    }

    /// Route a signal to its call. An offer for an unknown session starts an
    /// incoming call.
    pub async fn route_signal(
        &self,
        session: SessionId,
        signal: InboundSignal,
    ) -> Result<(), CallError> {
        if let Some(call) = self.get_call(&session).await {
            return call.handle_signal(signal);
        }

        match signal {
            InboundSignal::Offer {
                description,
                connection_id,
            } => self.incoming_call(session, description, connection_id).await,
            other => {
                debug!(target: "Call/Session", "{session}: no call for {}", other.kind());
                Err(CallError::NotFound(session))
            }
        }
    }

    async fn incoming_call(
        &self,
        session: SessionId,
        offer: super::transport::SessionDescription,
        connection_id: Option<String>,
    ) -> Result<(), CallError> {
        self.cleanup_terminated_calls().await;

        let call = {
            let mut calls = self.calls.write().await;
            if let Err(e) = self.check_capacity(&calls, &session) {
                drop(calls);
                warn!(target: "Call/Session", "{session}: refusing incoming call: {e}");
                if let Err(send_err) = self
                    .deps
                    .gateway
                    .send_terminate(&session, connection_id.as_deref())
                    .await
                {
                    warn!(target: "Call/Session", "{session}: failed to refuse call: {send_err:?}");
                }
                return Err(e);
            }

            let options = self.options(CallOptions::incoming(
                session.clone(),
                self.config.acceptor.is_some(),
            ));
            let call = Arc::new(Call::incoming(
                options,
                offer,
                connection_id,
                self.deps.clone(),
            ));
            calls.insert(session.clone(), call.clone());
            call
        };

        info!(target: "Call/Session", "{session}: incoming call");
        if let Some(acceptor) = self.config.acceptor.clone() {
            tokio::spawn(async move { acceptor.on_incoming_call(call).await });
        }
        Ok(())
    }

    /// Route every signal from `inbox` until it closes.
    pub async fn serve(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<(SessionId, InboundSignal)>,
    ) {
        while let Some((session, signal)) = inbox.recv().await {
            if let Err(e) = self.route_signal(session, signal).await {
                debug!(target: "Call/Session", "dropping signal: {e}");
            }
        }
    }

    pub async fn get_call(&self, id: &SessionId) -> Option<Arc<Call>> {
        self.calls.read().await.get(id).cloned()
    }

    /// Calls that have not terminated yet.
    pub async fn active_calls(&self) -> Vec<Arc<Call>> {
        self.calls
            .read()
            .await
            .values()
            .filter(|c| !c.is_terminated())
            .cloned()
            .collect()
    }

    /// Forget terminated calls. Returns how many were removed.
    pub async fn cleanup_terminated_calls(&self) -> usize {
        let mut calls = self.calls.write().await;
        let before = calls.len();
        calls.retain(|_, call| !call.is_terminated());
        before - calls.len()
    }

    /// Hang up every active call and wait for their negotiations to close.
    pub async fn hangup_all(&self, reason: &str) {
        let calls = self.active_calls().await;
        join_all(calls.iter().map(|call| async move {
            if call.hangup(Some(reason.to_string())).is_ok() {
                call.closed().await;
            }
        }))
        .await;
    }

    fn check_capacity(
        &self,
        calls: &HashMap<SessionId, Arc<Call>>,
        id: &SessionId,
    ) -> Result<(), CallError> {
        if calls.contains_key(id) {
            return Err(CallError::AlreadyExists(id.clone()));
        }
        // Count only calls that are still running against the limit
        let active = calls.values().filter(|c| !c.is_terminated()).count();
        if active >= self.config.max_concurrent_calls {
            return Err(CallError::TooManyCalls(self.config.max_concurrent_calls));
        }
        Ok(())
    }

    fn options(&self, options: CallOptions) -> CallOptions {
        let options = options
            .with_config(self.config.negotiation.clone())
            .with_constraints(self.config.constraints);
        match &self.config.local_connection_id {
            Some(connection_id) => options.with_local_connection_id(connection_id.clone()),
            None => options,
        }
    }
}
