//! Error layers of the trust boundary
//!
//! - **Platform** errors are faults of a single boundary invocation (marshalling,
//!   an aborted entry, a failing crypto backend). They are never retried here.
//! - **Protocol** errors are explicit results of an operation and are
//!   recoverable by the caller (renegotiate, restart a server, resend with a
//!   fresh counter).
//! - **Application** errors never appear here: they travel inside the
//!   encrypted reply payload.

use crate::server::ServerHandle;

/// Protocol-level failures returned by boundary operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Node has not been initialized")]
    NotInitialized,

    #[error("Node is already initialized")]
    AlreadyInitialized,

    #[error("Invalid node configuration: {0}")]
    InvalidConfig(String),

    #[error("No quote has been committed")]
    NoQuoteCommitted,

    #[error("Invalid quote: {0}")]
    InvalidQuote(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server handle {0} not found")]
    NotFound(ServerHandle),

    #[error("Server handle {0} is not running")]
    NotRunning(ServerHandle),

    #[error("Server handle {0} is already running")]
    AlreadyRunning(ServerHandle),

    #[error("Server handle {0} was stopped and cannot be reused")]
    HandleRetired(ServerHandle),

    #[error("Server start rejected: {0}")]
    StartRejected(String),

    #[error("Unknown or expired session")]
    UnknownSession,

    #[error("Session table is full")]
    SessionTableFull,

    #[error("Message authentication failed")]
    AuthenticationFailed,

    #[error("Replay detected: counter {counter} does not exceed {last}")]
    ReplayDetected { counter: u64, last: u64 },
}

impl ProtocolError {
    /// Stable numeric code reported alongside the platform status
    pub fn code(&self) -> u32 {
        match self {
            ProtocolError::NotInitialized => 1,
            ProtocolError::AlreadyInitialized => 2,
            ProtocolError::InvalidConfig(_) => 3,
            ProtocolError::NoQuoteCommitted => 10,
            ProtocolError::InvalidQuote(_) => 11,
            ProtocolError::InvalidRequest(_) => 20,
            ProtocolError::SessionTableFull => 21,
            ProtocolError::NotFound(_) => 30,
            ProtocolError::NotRunning(_) => 31,
            ProtocolError::AlreadyRunning(_) => 32,
            ProtocolError::HandleRetired(_) => 33,
            ProtocolError::StartRejected(_) => 34,
            ProtocolError::UnknownSession => 40,
            ProtocolError::AuthenticationFailed => 41,
            ProtocolError::ReplayDetected { .. } => 42,
        }
    }
}

/// Faults of the boundary invocation itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Marshalling error: {0}")]
    Marshalling(String),

    #[error("Enclave entry aborted: {0}")]
    Aborted(String),

    #[error("Report generation failed: {0}")]
    Report(String),

    #[error("Crypto backend failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result of a boundary operation: a platform status plus a protocol result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl BoundaryError {
    pub fn is_platform(&self) -> bool {
        matches!(self, BoundaryError::Platform(_))
    }

    /// The protocol error, if this is one
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            BoundaryError::Protocol(e) => Some(e),
            BoundaryError::Platform(_) => None,
        }
    }
}

impl From<CryptoError> for BoundaryError {
    fn from(e: CryptoError) -> Self {
        BoundaryError::Platform(PlatformError::Crypto(e))
    }
}

pub type BoundaryResult<T> = Result<T, BoundaryError>;

/// Primitive-level crypto failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("AEAD seal failed")]
    Seal,

    #[error("AEAD open failed")]
    Open,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid MAC key")]
    MacKey,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures on the remote-client side of the protocol
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Quote rejected: {0}")]
    Quote(String),

    #[error("Negotiation response is not bound to the supplied quote")]
    QuoteMismatch,

    #[error("Node static key does not match the quote report data")]
    StaticKeyMismatch,

    #[error("Key agreement produced a non-contributory secret")]
    WeakKey,

    #[error("Handshake authenticator mismatch")]
    HandshakeAuthentication,

    #[error("Reply authentication failed")]
    ReplyAuthentication,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_codes_are_distinct() {
        let h = ServerHandle(1);
        let all = vec![
            ProtocolError::NotInitialized,
            ProtocolError::AlreadyInitialized,
            ProtocolError::InvalidConfig(String::new()),
            ProtocolError::NoQuoteCommitted,
            ProtocolError::InvalidQuote(String::new()),
            ProtocolError::InvalidRequest(String::new()),
            ProtocolError::NotFound(h),
            ProtocolError::NotRunning(h),
            ProtocolError::AlreadyRunning(h),
            ProtocolError::HandleRetired(h),
            ProtocolError::StartRejected(String::new()),
            ProtocolError::UnknownSession,
            ProtocolError::SessionTableFull,
            ProtocolError::AuthenticationFailed,
            ProtocolError::ReplayDetected { counter: 1, last: 1 },
        ];
        let mut codes: Vec<u32> = all.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_boundary_layers() {
        let protocol: BoundaryError = ProtocolError::UnknownSession.into();
        assert!(!protocol.is_platform());
        assert_eq!(protocol.protocol(), Some(&ProtocolError::UnknownSession));

        let platform: BoundaryError = CryptoError::Seal.into();
        assert!(platform.is_platform());
        assert!(platform.protocol().is_none());
    }
}
