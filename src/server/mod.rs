//! Server contexts: domain state behind opaque handles
//!
//! - **Arena**: generational slots backing the handle map
//! - **Registry**: handle lifecycle, call admission and the stop barrier
//! - **Directory**: a sample domain server (sealed phone → UUID directory)

pub mod arena;
pub mod directory;
pub mod registry;

pub use arena::{Arena, SlotKey};
pub use directory::{DirectoryServer, DirectoryStartArgs};
pub use registry::{CallGuard, HandleState, ServerRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-chosen identifier of a server context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerHandle(pub u64);

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The domain refused to build its state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ServerError(pub String);

/// Domain logic hosted inside the trust boundary.
///
/// `call` sees the decrypted request and returns either a result payload or a
/// domain error payload; both are sealed back to the client without being
/// interpreted. Domain errors are not protocol errors.
pub trait Server: Sized + Send + 'static {
    type StartArgs: Send;
    type CallArgs;
    type StopArgs: Send;

    fn start(args: Self::StartArgs) -> Result<Self, ServerError>;

    fn call(&mut self, args: &Self::CallArgs, request: &[u8]) -> Result<Vec<u8>, Vec<u8>>;

    fn stop(self, args: Self::StopArgs);
}
