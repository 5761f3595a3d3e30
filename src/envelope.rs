//! Encrypted wire unit for requests and replies
//!
//! Header: session id, replay counter, AES-GCM nonce and detached tag. The
//! session id, counter and direction are authenticated as associated data, so
//! a request can't be replayed as a reply, moved to another session or given
//! a different counter.

use crate::crypto::{self, MAC_LEN, NONCE_LEN};
use crate::error::CryptoError;
use crate::tee::session::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

const ENVELOPE_LABEL: &[u8] = b"enclave-rpc-envelope-v1";

/// Caller-chosen correlation value, threaded unchanged into the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTag(pub u64);

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Request = 1,
    Reply = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeader {
    pub session_id: SessionId,
    /// Replay counter; replies echo the counter of their request
    pub counter: u64,
    pub iv: [u8; NONCE_LEN],
    pub mac: [u8; MAC_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: MsgHeader,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encrypt `plaintext` under `key` with a fresh random nonce
    pub fn seal(
        direction: Direction,
        session_id: SessionId,
        counter: u64,
        key: &[u8; crypto::KEY_LEN],
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        let iv = crypto::random_nonce();
        let aad = associated_data(direction, &session_id, counter);
        let (ciphertext, mac) = crypto::seal(key, &iv, &aad, plaintext)?;
        Ok(Self {
            header: MsgHeader {
                session_id,
                counter,
                iv,
                mac,
            },
            ciphertext,
        })
    }

    pub fn open(
        &self,
        direction: Direction,
        key: &[u8; crypto::KEY_LEN],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let aad = associated_data(direction, &self.header.session_id, self.header.counter);
        crypto::open(key, &self.header.iv, &aad, &self.ciphertext, &self.header.mac)
    }
}

fn associated_data(direction: Direction, session_id: &SessionId, counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(ENVELOPE_LABEL.len() + 1 + 16 + 8);
    aad.extend_from_slice(ENVELOPE_LABEL);
    aad.push(direction as u8);
    aad.extend_from_slice(&session_id.0);
    aad.extend_from_slice(&counter.to_le_bytes());
    aad
}

const STATUS_OK: u8 = 0;
const STATUS_FAILED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

/// Framed reply plaintext. The payloads belong to the domain server and are
/// carried without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// Successful result
    Ok(Vec<u8>),
    /// Domain-level error payload
    Failed(Vec<u8>),
    /// The domain callback panicked; no payload
    Aborted,
}

impl ReplyBody {
    pub fn encode(&self) -> Vec<u8> {
        let (status, payload): (u8, &[u8]) = match self {
            ReplyBody::Ok(p) => (STATUS_OK, p.as_slice()),
            ReplyBody::Failed(p) => (STATUS_FAILED, p.as_slice()),
            ReplyBody::Aborted => (STATUS_ABORTED, &[][..]),
        };
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(status);
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (status, payload) = bytes.split_first()?;
        match *status {
            STATUS_OK => Some(ReplyBody::Ok(payload.to_vec())),
            STATUS_FAILED => Some(ReplyBody::Failed(payload.to_vec())),
            STATUS_ABORTED if payload.is_empty() => Some(ReplyBody::Aborted),
            _ => None,
        }
    }
}

impl From<Result<Vec<u8>, Vec<u8>>> for ReplyBody {
    fn from(result: Result<Vec<u8>, Vec<u8>>) -> Self {
        match result {
            Ok(p) => ReplyBody::Ok(p),
            Err(p) => ReplyBody::Failed(p),
        }
    }
}
