//! TEE (Trusted Execution Environment) — the attested half of the boundary
//!
//! - **Platform**: enclave identity, targeted reports, simulated quoting
//! - **Attestation**: staged/current node keys and the committed quote
//! - **Negotiation**: per-client key agreement bound to the current quote
//! - **Session**: negotiated keys and replay counters

pub mod attestation;
pub mod negotiation;
pub mod platform;
pub mod session;

pub use attestation::{AttestationManager, CommittedQuote, NodeKey, Quote, QuoteVersion};
pub use negotiation::{NegotiationRequest, NegotiationResponse, NegotiationService};
pub use platform::{
    EnclaveIdentity, Platform, Report, ReportBody, ReportData, SimulatedPlatform, TargetInfo,
};
pub use session::{SessionId, SessionInfo, SessionTable};
