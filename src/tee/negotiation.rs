//! Negotiation — per-client X25519 handshake bound to the current quote
//!
//! ```text
//! client                                   node
//!   client_pub  ─────────────────────────►
//!                                          eph = fresh X25519
//!                                          ikm = DH(eph, client) ‖ DH(static, client)
//!                                          keys = HKDF(sha256(quote), ikm, transcript)
//!            ◄───────────────────────────  eph_pub, static_pub, quote version + digest,
//!                                          session id, HMAC(confirm, transcript ‖ id)
//! ```
//!
//! The static key is the one committed with the current quote, so a client
//! that checks the quote's report data knows who holds the session keys.

use super::attestation::{AttestationManager, QuoteVersion};
use super::session::{SessionId, SessionKeys, SessionTable};
use crate::crypto::{self, SymmetricKey, DIGEST_LEN, KEY_LEN};
use crate::error::{BoundaryResult, CryptoError, ProtocolError};
use log::debug;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

const HANDSHAKE_LABEL: &[u8] = b"enclave-rpc-handshake-v1";
const AUTHENTICATOR_LABEL: &[u8] = b"enclave-rpc-authenticator-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationRequest {
    /// Client ephemeral X25519 public key
    pub client_public: [u8; 32],
    /// Optional supporting evidence from the client, opaque to the node
    pub evidence: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub server_ephemeral_public: [u8; 32],
    pub server_static_public: [u8; 32],
    pub quote_version: QuoteVersion,
    /// SHA-256 of the quote the handshake is bound to
    pub quote_digest: [u8; DIGEST_LEN],
    pub session_id: SessionId,
    pub authenticator: [u8; DIGEST_LEN],
}

/// Public inputs of one handshake, fed into key derivation and the
/// authenticator on both sides
pub(crate) struct Transcript<'a> {
    pub protocol_version: u16,
    pub quote_version: QuoteVersion,
    pub quote_digest: &'a [u8; DIGEST_LEN],
    pub client_public: &'a [u8; 32],
    pub ephemeral_public: &'a [u8; 32],
    pub static_public: &'a [u8; 32],
}

pub(crate) struct KeySchedule {
    pub client_to_server: SymmetricKey,
    pub server_to_client: SymmetricKey,
    pub confirm: SymmetricKey,
}

impl Transcript<'_> {
    fn info(&self) -> Vec<u8> {
        let mut info = Vec::with_capacity(HANDSHAKE_LABEL.len() + 2 + 3 * 32);
        info.extend_from_slice(HANDSHAKE_LABEL);
        info.extend_from_slice(&self.protocol_version.to_le_bytes());
        info.extend_from_slice(self.client_public);
        info.extend_from_slice(self.ephemeral_public);
        info.extend_from_slice(self.static_public);
        info
    }

    /// Expand the two DH outputs into directional keys plus a confirm key
    pub fn derive(&self, ikm: &[u8]) -> Result<KeySchedule, CryptoError> {
        let block = crypto::hkdf_expand::<{ 3 * KEY_LEN }>(self.quote_digest, ikm, &self.info())?;
        Ok(KeySchedule {
            client_to_server: crypto::split_key(&block[..], 0),
            server_to_client: crypto::split_key(&block[..], 1),
            confirm: crypto::split_key(&block[..], 2),
        })
    }

    fn authenticator_parts(&self) -> [Vec<u8>; 2] {
        let mut head = Vec::with_capacity(AUTHENTICATOR_LABEL.len() + DIGEST_LEN + 8);
        head.extend_from_slice(AUTHENTICATOR_LABEL);
        head.extend_from_slice(self.quote_digest);
        head.extend_from_slice(&self.quote_version.0.to_le_bytes());
        let mut keys = Vec::with_capacity(3 * 32);
        keys.extend_from_slice(self.client_public);
        keys.extend_from_slice(self.ephemeral_public);
        keys.extend_from_slice(self.static_public);
        [head, keys]
    }

    pub fn authenticator(
        &self,
        confirm: &[u8; KEY_LEN],
        session_id: &SessionId,
    ) -> Result<[u8; DIGEST_LEN], CryptoError> {
        let [head, keys] = self.authenticator_parts();
        crypto::hmac_sha256(&confirm[..], &[head.as_slice(), keys.as_slice(), &session_id.0[..]])
    }

    pub fn verify_authenticator(
        &self,
        confirm: &[u8; KEY_LEN],
        session_id: &SessionId,
        expected: &[u8],
    ) -> bool {
        let [head, keys] = self.authenticator_parts();
        crypto::hmac_verify(
            &confirm[..],
            &[head.as_slice(), keys.as_slice(), &session_id.0[..]],
            expected,
        )
    }
}

/// Runs the node half of the handshake
pub struct NegotiationService {
    protocol_version: u16,
    max_evidence_size: usize,
}

impl NegotiationService {
    pub fn new(protocol_version: u16, max_evidence_size: usize) -> Self {
        Self {
            protocol_version,
            max_evidence_size,
        }
    }

    /// Negotiate a new session against the current quote.
    ///
    /// The current-quote read guard is held for the whole handshake, so a
    /// concurrent `commit_quote` waits and the response never mixes two quotes.
    pub fn negotiate(
        &self,
        attestation: &AttestationManager,
        sessions: &SessionTable,
        request: &NegotiationRequest,
    ) -> BoundaryResult<NegotiationResponse> {
        if let Some(evidence) = &request.evidence {
            if evidence.len() > self.max_evidence_size {
                return Err(ProtocolError::InvalidRequest(format!(
                    "evidence of {} bytes exceeds limit {}",
                    evidence.len(),
                    self.max_evidence_size
                ))
                .into());
            }
        }

        let client = PublicKey::from(request.client_public);
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let ephemeral_shared = ephemeral.diffie_hellman(&client);
        if !ephemeral_shared.was_contributory() {
            return Err(ProtocolError::InvalidRequest("low-order client key".into()).into());
        }

        attestation.with_current(|current| -> BoundaryResult<NegotiationResponse> {
            let static_shared = current.node_key().diffie_hellman(&client);
            if !static_shared.was_contributory() {
                return Err(ProtocolError::InvalidRequest("low-order client key".into()).into());
            }

            let mut ikm = Zeroizing::new([0u8; 64]);
            ikm[..32].copy_from_slice(ephemeral_shared.as_bytes());
            ikm[32..].copy_from_slice(static_shared.as_bytes());

            let static_public = current.node_key().public_bytes();
            let transcript = Transcript {
                protocol_version: self.protocol_version,
                quote_version: current.version,
                quote_digest: &current.digest,
                client_public: &request.client_public,
                ephemeral_public: &ephemeral_public,
                static_public: &static_public,
            };
            let schedule = transcript.derive(&ikm[..])?;
            let authenticator_key = schedule.confirm;

            let session_id = sessions.insert(
                SessionKeys {
                    client_to_server: schedule.client_to_server,
                    server_to_client: schedule.server_to_client,
                },
                current.version,
            )?;
            let authenticator = transcript.authenticator(&authenticator_key, &session_id)?;

            debug!(
                "Negotiated session {} against quote {}",
                session_id.short(),
                current.version
            );

            Ok(NegotiationResponse {
                server_ephemeral_public: ephemeral_public,
                server_static_public: static_public,
                quote_version: current.version,
                quote_digest: current.digest,
                session_id,
                authenticator,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientHandshake, DEFAULT_PROTOCOL_VERSION};
    use crate::error::BoundaryError;
    use crate::tee::attestation::tests::quote_for;
    use crate::tee::platform::{Platform, SimulatedPlatform};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use x25519_dalek::StaticSecret;

    struct Fixture {
        platform: SimulatedPlatform,
        attestation: AttestationManager,
        sessions: SessionTable,
        service: NegotiationService,
    }

    fn fixture() -> Fixture {
        let platform = SimulatedPlatform::development();
        let attestation = AttestationManager::new(*platform.identity(), vec![2, 3]);
        Fixture {
            platform,
            attestation,
            sessions: SessionTable::new(16, Duration::from_secs(60)),
            service: NegotiationService::new(1, 64),
        }
    }

    fn commit(f: &Fixture) -> Vec<u8> {
        let quote = quote_for(&f.attestation, &f.platform);
        f.attestation.commit_quote(&quote).unwrap();
        quote
    }

    fn client_request() -> (StaticSecret, NegotiationRequest) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let request = NegotiationRequest {
            client_public: PublicKey::from(&secret).to_bytes(),
            evidence: None,
        };
        (secret, request)
    }

    #[test]
    fn test_negotiate_requires_quote() {
        let f = fixture();
        let (_, request) = client_request();
        let err = f
            .service
            .negotiate(&f.attestation, &f.sessions, &request)
            .unwrap_err();
        assert_eq!(err, BoundaryError::Protocol(ProtocolError::NoQuoteCommitted));
        assert!(f.sessions.is_empty());
    }

    #[test]
    fn test_negotiate_binds_current_quote() {
        let f = fixture();
        let quote = commit(&f);
        let (secret, request) = client_request();

        let response = f
            .service
            .negotiate(&f.attestation, &f.sessions, &request)
            .unwrap();
        assert_eq!(response.quote_version, QuoteVersion(1));
        assert_eq!(response.quote_digest, crypto::sha256(&quote));
        assert_eq!(
            response.server_static_public,
            f.attestation.current().unwrap().quote.node_public_key()
        );
        assert_eq!(f.sessions.info(&response.session_id).unwrap().last_counter, 0);

        // The client derives the same confirm key and accepts the authenticator
        let eph = PublicKey::from(response.server_ephemeral_public);
        let stat = PublicKey::from(response.server_static_public);
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(secret.diffie_hellman(&eph).as_bytes());
        ikm[32..].copy_from_slice(secret.diffie_hellman(&stat).as_bytes());
        let transcript = Transcript {
            protocol_version: 1,
            quote_version: response.quote_version,
            quote_digest: &response.quote_digest,
            client_public: &request.client_public,
            ephemeral_public: &response.server_ephemeral_public,
            static_public: &response.server_static_public,
        };
        let schedule = transcript.derive(&ikm).unwrap();
        assert!(transcript.verify_authenticator(
            &schedule.confirm,
            &response.session_id,
            &response.authenticator
        ));
        assert!(!transcript.verify_authenticator(
            &schedule.confirm,
            &SessionId::generate(),
            &response.authenticator
        ));
    }

    #[test]
    fn test_every_negotiation_is_a_new_session() {
        let f = fixture();
        commit(&f);
        let (_, request) = client_request();
        let a = f.service.negotiate(&f.attestation, &f.sessions, &request).unwrap();
        let b = f.service.negotiate(&f.attestation, &f.sessions, &request).unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.server_ephemeral_public, b.server_ephemeral_public);
        assert_eq!(f.sessions.len(), 2);
    }

    #[test]
    fn test_rejects_low_order_key() {
        let f = fixture();
        commit(&f);
        let request = NegotiationRequest {
            client_public: [0u8; 32],
            evidence: None,
        };
        assert!(matches!(
            f.service.negotiate(&f.attestation, &f.sessions, &request),
            Err(BoundaryError::Protocol(ProtocolError::InvalidRequest(_)))
        ));
        assert!(f.sessions.is_empty());
    }

    #[test]
    fn test_rejects_oversized_evidence() {
        let f = fixture();
        commit(&f);
        let (_, mut request) = client_request();
        request.evidence = Some(vec![0u8; 65]);
        assert!(matches!(
            f.service.negotiate(&f.attestation, &f.sessions, &request),
            Err(BoundaryError::Protocol(ProtocolError::InvalidRequest(_)))
        ));

        request.evidence = Some(vec![0u8; 64]);
        assert!(f.service.negotiate(&f.attestation, &f.sessions, &request).is_ok());
    }

    #[test]
    fn test_rotation_changes_binding() {
        let f = fixture();
        commit(&f);
        let (_, request) = client_request();
        let before = f.service.negotiate(&f.attestation, &f.sessions, &request).unwrap();

        let q2 = commit(&f);
        let after = f.service.negotiate(&f.attestation, &f.sessions, &request).unwrap();
        assert_eq!(after.quote_version, QuoteVersion(2));
        assert_eq!(after.quote_digest, crypto::sha256(&q2));
        assert_ne!(before.server_static_public, after.server_static_public);
    }

    #[test]
    fn test_negotiation_during_rotation_binds_one_quote() {
        let platform = SimulatedPlatform::development();
        let attestation = AttestationManager::new(*platform.identity(), vec![2, 3]);
        let sessions = SessionTable::new(1 << 16, Duration::from_secs(60));
        let service = NegotiationService::new(DEFAULT_PROTOCOL_VERSION, 64);
        let first = quote_for(&attestation, &platform);
        attestation.commit_quote(&first).unwrap();
        let rotating = AtomicBool::new(true);

        let (committed, handshakes) = thread::scope(|scope| {
            let committer = scope.spawn(|| {
                let mut committed = vec![(QuoteVersion(1), first.clone())];
                for _ in 0..20 {
                    let quote = quote_for(&attestation, &platform);
                    let version = attestation.commit_quote(&quote).unwrap();
                    committed.push((version, quote));
                    thread::yield_now();
                }
                rotating.store(false, Ordering::SeqCst);
                committed
            });
            let negotiator = scope.spawn(|| {
                let mut handshakes = Vec::new();
                while rotating.load(Ordering::SeqCst) || handshakes.is_empty() {
                    let (handshake, request) = ClientHandshake::initiate();
                    let response = service
                        .negotiate(&attestation, &sessions, &request)
                        .unwrap();
                    handshakes.push((handshake, response));
                }
                handshakes
            });
            (committer.join().unwrap(), negotiator.join().unwrap())
        });

        assert_eq!(committed.len(), 21);
        for (handshake, response) in handshakes {
            let (_, quote) = committed
                .iter()
                .find(|(version, _)| *version == response.quote_version)
                .unwrap();
            assert_eq!(crypto::sha256(quote), response.quote_digest);
            let session = handshake.finish(&response, quote).unwrap();
            assert_eq!(session.quote_version(), response.quote_version);
        }
    }
}
