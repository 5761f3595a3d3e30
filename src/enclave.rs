//! Enclave node — the trusted side of the boundary
//!
//! `TrustBoundary` is the complete set of operations the untrusted host may
//! invoke. `Enclave` implements it over a `Platform` and one domain `Server`
//! type, with replies flowing out through a `ReplySink`.

use crate::config::NodeConfig;
use crate::dispatch::CallDispatcher;
use crate::envelope::{Envelope, MessageTag};
use crate::error::{BoundaryResult, ProtocolError};
use crate::reply::ReplySink;
use crate::server::{Server, ServerHandle, ServerRegistry};
use crate::tee::attestation::{AttestationManager, QuoteVersion};
use crate::tee::negotiation::{NegotiationRequest, NegotiationResponse, NegotiationService};
use crate::tee::platform::{Platform, Report, SimulatedPlatform, TargetInfo};
use crate::tee::session::SessionTable;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Operations exposed across the trust boundary
pub trait TrustBoundary {
    type StartArgs;
    type CallArgs;
    type StopArgs;

    /// One-time node setup; generates node keys inside the boundary
    fn node_init(&self, config: NodeConfig) -> BoundaryResult<()>;

    /// Report over the staged node key for `target`
    fn get_next_report(&self, target: &TargetInfo) -> BoundaryResult<Report>;

    /// Make `quote` the current attestation evidence
    fn commit_quote(&self, quote: &[u8]) -> BoundaryResult<QuoteVersion>;

    fn negotiate(&self, request: &NegotiationRequest) -> BoundaryResult<NegotiationResponse>;

    fn server_start(&self, args: Self::StartArgs, handle: ServerHandle) -> BoundaryResult<()>;

    /// Accept one tagged call; its result arrives later through the reply sink
    fn server_call(
        &self,
        args: &Self::CallArgs,
        envelope: &Envelope,
        tag: MessageTag,
        handle: ServerHandle,
    ) -> BoundaryResult<()>;

    /// Blocks until in-flight calls against `handle` have finished
    fn server_stop(&self, args: Self::StopArgs, handle: ServerHandle) -> BoundaryResult<()>;
}

/// Point-in-time view of the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub initialized: bool,
    pub initialized_at: Option<DateTime<Utc>>,
    pub mr_enclave: String,
    pub quote_version: Option<QuoteVersion>,
    pub quote_committed_at: Option<DateTime<Utc>>,
    pub active_sessions: usize,
    pub running_servers: Vec<ServerHandle>,
}

struct Node<S> {
    config: NodeConfig,
    initialized_at: DateTime<Utc>,
    attestation: AttestationManager,
    negotiation: NegotiationService,
    sessions: SessionTable,
    registry: ServerRegistry<S>,
    dispatcher: CallDispatcher,
}

pub struct Enclave<S: Server, P: Platform = SimulatedPlatform> {
    id: Uuid,
    platform: P,
    replies: Arc<dyn ReplySink>,
    node: OnceLock<Node<S>>,
}

impl<S: Server, P: Platform> Enclave<S, P> {
    pub fn new(platform: P, replies: Arc<dyn ReplySink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            replies,
            node: OnceLock::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Effective configuration, once initialized
    pub fn config(&self) -> Option<&NodeConfig> {
        self.node.get().map(|node| &node.config)
    }

    pub fn status(&self) -> NodeStatus {
        let node = self.node.get();
        let current = node.and_then(|n| n.attestation.current());
        NodeStatus {
            node_id: self.id.to_string(),
            initialized: node.is_some(),
            initialized_at: node.map(|n| n.initialized_at),
            mr_enclave: hex::encode(self.platform.identity().mr_enclave),
            quote_version: current.as_ref().map(|q| q.version),
            quote_committed_at: current.as_ref().map(|q| q.committed_at),
            active_sessions: node.map(|n| n.sessions.len()).unwrap_or(0),
            running_servers: node
                .map(|n| n.registry.running_handles())
                .unwrap_or_default(),
        }
    }

    /// Drop expired sessions and sessions bound to a superseded quote
    pub fn purge_sessions(&self) -> BoundaryResult<usize> {
        let node = self.node()?;
        let purged = match node.attestation.current_version() {
            Some(version) => node.sessions.purge(version),
            None => 0,
        };
        if purged > 0 {
            debug!("Purged {} sessions", purged);
        }
        Ok(purged)
    }

    fn node(&self) -> Result<&Node<S>, ProtocolError> {
        self.node.get().ok_or(ProtocolError::NotInitialized)
    }
}

impl<S: Server, P: Platform> TrustBoundary for Enclave<S, P> {
    type StartArgs = S::StartArgs;
    type CallArgs = S::CallArgs;
    type StopArgs = S::StopArgs;

    fn node_init(&self, config: NodeConfig) -> BoundaryResult<()> {
        if self.node.get().is_some() {
            return Err(ProtocolError::AlreadyInitialized.into());
        }
        config
            .validate()
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;

        let node = Node {
            attestation: AttestationManager::new(
                *self.platform.identity(),
                config.accepted_quote_versions.clone(),
            ),
            negotiation: NegotiationService::new(
                config.protocol_version,
                config.max_evidence_size,
            ),
            sessions: SessionTable::new(config.max_sessions, config.session_ttl()),
            registry: ServerRegistry::new(),
            dispatcher: CallDispatcher::new(config.max_message_size),
            initialized_at: Utc::now(),
            config,
        };
        self.node
            .set(node)
            .map_err(|_| ProtocolError::AlreadyInitialized)?;

        info!(
            "Node {} initialized (MRENCLAVE {}…)",
            &self.id.to_string()[..8],
            hex::encode(&self.platform.identity().mr_enclave[..8])
        );
        Ok(())
    }

    fn get_next_report(&self, target: &TargetInfo) -> BoundaryResult<Report> {
        let node = self.node()?;
        Ok(node.attestation.get_next_report(&self.platform, target)?)
    }

    fn commit_quote(&self, quote: &[u8]) -> BoundaryResult<QuoteVersion> {
        let node = self.node()?;
        Ok(node.attestation.commit_quote(quote)?)
    }

    fn negotiate(&self, request: &NegotiationRequest) -> BoundaryResult<NegotiationResponse> {
        let node = self.node()?;
        node.negotiation
            .negotiate(&node.attestation, &node.sessions, request)
    }

    fn server_start(&self, args: S::StartArgs, handle: ServerHandle) -> BoundaryResult<()> {
        let node = self.node()?;
        Ok(node.registry.start(handle, args)?)
    }

    fn server_call(
        &self,
        args: &S::CallArgs,
        envelope: &Envelope,
        tag: MessageTag,
        handle: ServerHandle,
    ) -> BoundaryResult<()> {
        let node = self.node()?;
        node.dispatcher.dispatch(
            &node.registry,
            &node.sessions,
            node.attestation.current_version(),
            self.replies.as_ref(),
            args,
            envelope,
            tag,
            handle,
        )
    }

    fn server_stop(&self, args: S::StopArgs, handle: ServerHandle) -> BoundaryResult<()> {
        let node = self.node()?;
        Ok(node.registry.stop(handle, args)?)
    }
}
