//! Byte-level ecall bridge
//!
//! Everything crossing into the trusted side is an owned, `bincode`-encoded
//! buffer copied in; everything coming out is copied out the same way. A
//! buffer that fails to decode is a marshalling fault, and a panic inside the
//! trusted side aborts only the one invocation.

use crate::config::NodeConfig;
use crate::enclave::TrustBoundary;
use crate::envelope::{Envelope, MessageTag};
use crate::error::{BoundaryError, PlatformError};
use crate::server::ServerHandle;
use crate::tee::negotiation::NegotiationRequest;
use crate::tee::platform::TargetInfo;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Entry points of the trusted side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ecall {
    NodeInit,
    GetNextReport,
    CommitQuote,
    Negotiate,
    ServerStart,
    ServerCall,
    ServerStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest<A> {
    pub handle: ServerHandle,
    pub args: A,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest<A> {
    pub handle: ServerHandle,
    pub tag: MessageTag,
    pub args: A,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest<A> {
    pub handle: ServerHandle,
    pub args: A,
}

/// Copied-out result of an ecall that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcallOutput {
    /// Operation output: raw report bytes for `GetNextReport`, bincode for
    /// `CommitQuote` / `Negotiate`, empty otherwise
    Ok(Vec<u8>),
    /// Protocol error, as its stable code and message
    Rejected { code: u32, message: String },
}

pub struct EcallBridge<T> {
    boundary: T,
}

impl<T> EcallBridge<T>
where
    T: TrustBoundary,
    T::StartArgs: DeserializeOwned,
    T::CallArgs: DeserializeOwned,
    T::StopArgs: DeserializeOwned,
{
    pub fn new(boundary: T) -> Self {
        Self { boundary }
    }

    pub fn boundary(&self) -> &T {
        &self.boundary
    }

    /// Run one ecall over a copied-in buffer
    pub fn invoke(&self, ecall: Ecall, input: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let input = input.to_vec();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(ecall, &input)))
            .map_err(|payload| {
                let reason = panic_message(&*payload);
                warn!("Ecall {:?} aborted: {}", ecall, reason);
                PlatformError::Aborted(reason)
            })?;

        let output = match outcome {
            Ok(bytes) => EcallOutput::Ok(bytes),
            Err(BoundaryError::Protocol(e)) => EcallOutput::Rejected {
                code: e.code(),
                message: e.to_string(),
            },
            Err(BoundaryError::Platform(e)) => return Err(e),
        };
        encode(&output)
    }

    fn run(&self, ecall: Ecall, input: &[u8]) -> Result<Vec<u8>, BoundaryError> {
        match ecall {
            Ecall::NodeInit => {
                let config: NodeConfig = decode(input)?;
                self.boundary.node_init(config)?;
                Ok(Vec::new())
            }
            Ecall::GetNextReport => {
                let target: TargetInfo = decode(input)?;
                Ok(self.boundary.get_next_report(&target)?.to_bytes())
            }
            Ecall::CommitQuote => {
                let quote: Vec<u8> = decode(input)?;
                let version = self.boundary.commit_quote(&quote)?;
                Ok(encode(&version)?)
            }
            Ecall::Negotiate => {
                let request: NegotiationRequest = decode(input)?;
                let response = self.boundary.negotiate(&request)?;
                Ok(encode(&response)?)
            }
            Ecall::ServerStart => {
                let request: StartRequest<T::StartArgs> = decode(input)?;
                self.boundary.server_start(request.args, request.handle)?;
                Ok(Vec::new())
            }
            Ecall::ServerCall => {
                let request: CallRequest<T::CallArgs> = decode(input)?;
                self.boundary.server_call(
                    &request.args,
                    &request.envelope,
                    request.tag,
                    request.handle,
                )?;
                Ok(Vec::new())
            }
            Ecall::ServerStop => {
                let request: StopRequest<T::StopArgs> = decode(input)?;
                self.boundary.server_stop(request.args, request.handle)?;
                Ok(Vec::new())
            }
        }
    }
}

pub fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>, PlatformError> {
    bincode::serialize(value).map_err(|e| PlatformError::Marshalling(e.to_string()))
}

pub fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, PlatformError> {
    bincode::deserialize(bytes).map_err(|e| PlatformError::Marshalling(e.to_string()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
