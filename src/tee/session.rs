//! Negotiated sessions and their replay counters
//!
//! Entries live in a `DashMap`; the per-entry lock is held only while a
//! request is authenticated and its counter advanced, never while the domain
//! callback runs. Inserts are serialized so the table never grows past its
//! capacity; removals need no such lock.

use super::attestation::QuoteVersion;
use crate::crypto::SymmetricKey;
use crate::envelope::{Direction, Envelope};
use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Random 128-bit session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Directional keys derived by negotiation
pub struct SessionKeys {
    /// Opens client requests
    pub client_to_server: SymmetricKey,
    /// Seals replies
    pub server_to_client: SymmetricKey,
}

/// One negotiated session
pub struct Session {
    keys: SessionKeys,
    /// Highest accepted request counter; starts at zero
    last_counter: u64,
    quote_version: QuoteVersion,
    /// `None` when the lifetime runs past what `Instant` can represent
    expires_at: Option<Instant>,
    established_at: DateTime<Utc>,
    calls: u64,
}

impl Session {
    pub fn new(keys: SessionKeys, quote_version: QuoteVersion, ttl: Duration) -> Self {
        Self {
            keys,
            last_counter: 0,
            quote_version,
            expires_at: Instant::now().checked_add(ttl),
            established_at: Utc::now(),
            calls: 0,
        }
    }

    fn is_live(&self, now: Instant, current: QuoteVersion) -> bool {
        let unexpired = match self.expires_at {
            Some(at) => now < at,
            None => true,
        };
        unexpired && self.quote_version == current
    }
}

/// Public view of a session, without key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub last_counter: u64,
    pub quote_version: QuoteVersion,
    pub established_at: DateTime<Utc>,
    pub calls: u64,
}

/// An authenticated, counter-checked request ready for dispatch
pub struct OpenedRequest {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub reply_key: SymmetricKey,
}

pub struct SessionTable {
    sessions: DashMap<SessionId, Session>,
    insert_lock: Mutex<()>,
    capacity: usize,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            insert_lock: Mutex::new(()),
            capacity,
            ttl,
        }
    }

    /// Insert a freshly negotiated session under a new id
    pub fn insert(
        &self,
        keys: SessionKeys,
        quote_version: QuoteVersion,
    ) -> Result<SessionId, ProtocolError> {
        let _inserting = self.insert_lock.lock();
        if self.sessions.len() >= self.capacity {
            self.purge(quote_version);
            if self.sessions.len() >= self.capacity {
                return Err(ProtocolError::SessionTableFull);
            }
        }
        let session = Session::new(keys, quote_version, self.ttl);
        loop {
            let id = SessionId::generate();
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.sessions.entry(id) {
                slot.insert(session);
                return Ok(id);
            }
        }
    }

    /// Authenticate `envelope`, enforce the replay counter and advance it.
    /// On any failure the session is left untouched.
    pub fn open_request(
        &self,
        envelope: &Envelope,
        current: Option<QuoteVersion>,
    ) -> Result<OpenedRequest, ProtocolError> {
        let id = envelope.header.session_id;
        let current = current.ok_or(ProtocolError::UnknownSession)?;
        let now = Instant::now();

        let mut session = match self.sessions.get_mut(&id) {
            Some(session) if session.is_live(now, current) => session,
            Some(session) => {
                drop(session);
                self.sessions.remove_if(&id, |_, s| !s.is_live(now, current));
                return Err(ProtocolError::UnknownSession);
            }
            None => return Err(ProtocolError::UnknownSession),
        };

        let plaintext = envelope
            .open(Direction::Request, &session.keys.client_to_server)
            .map_err(|_| ProtocolError::AuthenticationFailed)?;

        let counter = envelope.header.counter;
        if counter <= session.last_counter {
            return Err(ProtocolError::ReplayDetected {
                counter,
                last: session.last_counter,
            });
        }
        session.last_counter = counter;
        session.calls += 1;

        Ok(OpenedRequest {
            plaintext,
            reply_key: session.keys.server_to_client.clone(),
        })
    }

    /// Drop expired sessions and sessions bound to a superseded quote
    pub fn purge(&self, current: QuoteVersion) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.is_live(now, current));
        before.saturating_sub(self.sessions.len())
    }

    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| SessionInfo {
            session_id: id.to_string(),
            last_counter: s.last_counter,
            quote_version: s.quote_version,
            established_at: s.established_at,
            calls: s.calls,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
