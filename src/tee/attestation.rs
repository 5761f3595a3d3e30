//! Attestation — targeted reports and the committed "current" quote
//!
//! The node keeps two X25519 keys:
//! - a **staged** key, whose public half is placed in the report data of every
//!   report handed out by `get_next_report`;
//! - the **current** key, promoted from the staged key when a quote over such
//!   a report is committed.
//!
//! A client that verifies the quote therefore learns the static key that
//! terminates its negotiation. Committing rotates the staged key, so each
//! quote can be committed at most once.

use super::platform::{
    EnclaveIdentity, Platform, Report, ReportBody, ReportData, TargetInfo, REPORT_BODY_LEN,
    REPORT_DATA_LEN, SIGN_TYPE_LINKABLE, SIGN_TYPE_UNLINKABLE,
};
use crate::crypto::{self, DIGEST_LEN};
use crate::error::{PlatformError, ProtocolError};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Fixed quote header: version, sign type, EPID group, QE svn, PCE svn, basename
pub const QUOTE_PREFIX_LEN: usize = 2 + 2 + 4 + 2 + 2 + 32;
pub const QUOTE_MIN_LEN: usize = QUOTE_PREFIX_LEN + REPORT_BODY_LEN + 4;

/// Monotonic version of the committed quote; 1 is the first commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuoteVersion(pub u64);

impl fmt::Display for QuoteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A parsed attestation quote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub version: u16,
    pub sign_type: u16,
    pub epid_group_id: [u8; 4],
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub basename: [u8; 32],
    pub report_body: ReportBody,
    pub signature: Vec<u8>,
}

impl Quote {
    /// Parse the quote layout; signature verification is left to the
    /// attestation service
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < QUOTE_MIN_LEN {
            return Err(ProtocolError::InvalidQuote(format!(
                "quote too short: {} bytes",
                bytes.len()
            )));
        }
        let truncated = |e: std::io::Error| ProtocolError::InvalidQuote(e.to_string());

        let mut input = bytes;
        let version = input.read_u16::<LittleEndian>().map_err(truncated)?;
        let sign_type = input.read_u16::<LittleEndian>().map_err(truncated)?;
        let mut epid_group_id = [0u8; 4];
        input.read_exact(&mut epid_group_id).map_err(truncated)?;
        let qe_svn = input.read_u16::<LittleEndian>().map_err(truncated)?;
        let pce_svn = input.read_u16::<LittleEndian>().map_err(truncated)?;
        let mut basename = [0u8; 32];
        input.read_exact(&mut basename).map_err(truncated)?;
        let report_body = ReportBody::read_from(&mut input).map_err(truncated)?;
        let signature_len = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;

        if signature_len == 0 {
            return Err(ProtocolError::InvalidQuote("empty signature".into()));
        }
        if signature_len != input.len() {
            return Err(ProtocolError::InvalidQuote(format!(
                "signature length {} does not match {} trailing bytes",
                signature_len,
                input.len()
            )));
        }
        if sign_type != SIGN_TYPE_UNLINKABLE && sign_type != SIGN_TYPE_LINKABLE {
            return Err(ProtocolError::InvalidQuote(format!(
                "unknown sign type {}",
                sign_type
            )));
        }

        Ok(Self {
            version,
            sign_type,
            epid_group_id,
            qe_svn,
            pce_svn,
            basename,
            report_body,
            signature: input.to_vec(),
        })
    }

    /// Node static public key carried in the report data
    pub fn node_public_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.report_body.report_data[..32]);
        key
    }
}

/// A node X25519 key pair; the secret half never leaves this module's owners
pub struct NodeKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn report_data(&self) -> ReportData {
        let mut data = [0u8; REPORT_DATA_LEN];
        data[..32].copy_from_slice(self.public.as_bytes());
        data
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

/// The committed quote together with the node key it vouches for
pub struct CommittedQuote {
    pub version: QuoteVersion,
    /// SHA-256 of the raw quote bytes
    pub digest: [u8; DIGEST_LEN],
    pub quote: Quote,
    pub committed_at: DateTime<Utc>,
    node_key: NodeKey,
}

impl CommittedQuote {
    pub fn node_key(&self) -> &NodeKey {
        &self.node_key
    }
}

/// Produces reports and holds the single current quote
pub struct AttestationManager {
    identity: EnclaveIdentity,
    accepted_versions: Vec<u16>,
    staged: Mutex<NodeKey>,
    current: RwLock<Option<Arc<CommittedQuote>>>,
    version: AtomicU64,
}

impl AttestationManager {
    pub fn new(identity: EnclaveIdentity, accepted_versions: Vec<u16>) -> Self {
        Self {
            identity,
            accepted_versions,
            staged: Mutex::new(NodeKey::generate()),
            current: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }

    /// Report over the staged node key, verifiable by `target`.
    /// Does not touch the committed quote.
    pub fn get_next_report<P: Platform>(
        &self,
        platform: &P,
        target: &TargetInfo,
    ) -> Result<Report, PlatformError> {
        let report_data = self.staged.lock().report_data();
        platform.create_report(target, &report_data)
    }

    /// Validate `bytes` and make it the current quote
    pub fn commit_quote(&self, bytes: &[u8]) -> Result<QuoteVersion, ProtocolError> {
        let quote = Quote::parse(bytes)?;
        if !self.accepted_versions.contains(&quote.version) {
            return Err(ProtocolError::InvalidQuote(format!(
                "unsupported quote version {}",
                quote.version
            )));
        }
        if !quote.report_body.matches_identity(&self.identity) {
            return Err(ProtocolError::InvalidQuote(
                "report body does not match this enclave".into(),
            ));
        }

        let mut staged = self.staged.lock();
        if !crypto::ct_eq(&quote.report_body.report_data, &staged.report_data()) {
            return Err(ProtocolError::InvalidQuote(
                "report data is not bound to the staged node key".into(),
            ));
        }

        let mut current = self.current.write();
        let version = QuoteVersion(self.version.load(Ordering::Acquire) + 1);
        let node_key = std::mem::replace(&mut *staged, NodeKey::generate());
        let committed = CommittedQuote {
            version,
            digest: crypto::sha256(bytes),
            quote,
            committed_at: Utc::now(),
            node_key,
        };
        info!(
            "Committed quote {} (digest {}…, node key {}…)",
            version,
            hex::encode(&committed.digest[..4]),
            hex::encode(&committed.node_key.public_bytes()[..4])
        );
        *current = Some(Arc::new(committed));
        self.version.store(version.0, Ordering::Release);
        Ok(version)
    }

    pub fn current_version(&self) -> Option<QuoteVersion> {
        match self.version.load(Ordering::Acquire) {
            0 => None,
            v => Some(QuoteVersion(v)),
        }
    }

    /// Snapshot of the current quote
    pub fn current(&self) -> Option<Arc<CommittedQuote>> {
        self.current.read().clone()
    }

    /// Run `f` against the current quote while holding off rotation, so the
    /// whole operation observes one consistent quote
    pub fn with_current<R, E: From<ProtocolError>>(
        &self,
        f: impl FnOnce(&CommittedQuote) -> Result<R, E>,
    ) -> Result<R, E> {
        let current = self.current.read();
        match current.as_deref() {
            Some(quote) => f(quote),
            None => Err(ProtocolError::NoQuoteCommitted.into()),
        }
    }

    pub fn identity(&self) -> &EnclaveIdentity {
        &self.identity
    }
}
