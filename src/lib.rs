//! enclave-rpc — attested, encrypted RPC across an enclave trust boundary
//!
//! An untrusted host drives a trusted node through a narrow set of
//! operations: produce a report, commit a quote, negotiate a session, and
//! start / call / stop domain servers whose replies come back sealed through
//! a reply sink, correlated by a caller tag.

pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod ecall;
pub mod enclave;
pub mod envelope;
pub mod error;
pub mod reply;
pub mod server;
pub mod tee;

pub use client::{ClientHandshake, ClientSession};
pub use config::NodeConfig;
pub use enclave::{Enclave, NodeStatus, TrustBoundary};
pub use envelope::{Envelope, MessageTag, MsgHeader, ReplyBody};
pub use error::{BoundaryError, BoundaryResult, PlatformError, ProtocolError};
pub use reply::{ChannelReplySink, Reply, ReplySink};
pub use server::{Server, ServerHandle};
pub use tee::{NegotiationRequest, NegotiationResponse, QuoteVersion, SimulatedPlatform};
