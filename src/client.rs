//! Remote client half of the protocol
//!
//! The client verifies that a negotiation response is bound to the quote it
//! was given (digest and static key), checks the handshake authenticator, and
//! then seals requests with strictly increasing counters.

use crate::crypto::{self, SymmetricKey};
use crate::envelope::{Direction, Envelope, ReplyBody};
use crate::error::ClientError;
use crate::reply::Reply;
use crate::tee::attestation::{Quote, QuoteVersion};
use crate::tee::negotiation::{NegotiationRequest, NegotiationResponse, Transcript};
use crate::tee::platform::EnclaveIdentity;
use crate::tee::session::SessionId;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const DEFAULT_PROTOCOL_VERSION: u16 = 1;

/// A pending handshake; consumed by `finish`
pub struct ClientHandshake {
    secret: StaticSecret,
    public: [u8; 32],
    protocol_version: u16,
    expected_identity: Option<EnclaveIdentity>,
}

impl ClientHandshake {
    /// Fresh client key pair and the request to send to the node
    pub fn initiate() -> (Self, NegotiationRequest) {
        Self::with_protocol_version(DEFAULT_PROTOCOL_VERSION)
    }

    pub fn with_protocol_version(protocol_version: u16) -> (Self, NegotiationRequest) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let request = NegotiationRequest {
            client_public: public,
            evidence: None,
        };
        (
            Self {
                secret,
                public,
                protocol_version,
                expected_identity: None,
            },
            request,
        )
    }

    /// Also require the quote to come from this enclave
    pub fn expect_identity(mut self, identity: EnclaveIdentity) -> Self {
        self.expected_identity = Some(identity);
        self
    }

    /// Verify `response` against the raw quote and derive session keys
    pub fn finish(
        self,
        response: &NegotiationResponse,
        quote_bytes: &[u8],
    ) -> Result<ClientSession, ClientError> {
        let quote = Quote::parse(quote_bytes).map_err(|e| ClientError::Quote(e.to_string()))?;
        if let Some(identity) = &self.expected_identity {
            if !quote.report_body.matches_identity(identity) {
                return Err(ClientError::Quote("unexpected enclave identity".into()));
            }
        }
        if !crypto::ct_eq(&crypto::sha256(quote_bytes), &response.quote_digest) {
            return Err(ClientError::QuoteMismatch);
        }
        if quote.node_public_key() != response.server_static_public {
            return Err(ClientError::StaticKeyMismatch);
        }

        let ephemeral_shared = self
            .secret
            .diffie_hellman(&PublicKey::from(response.server_ephemeral_public));
        let static_shared = self
            .secret
            .diffie_hellman(&PublicKey::from(response.server_static_public));
        if !ephemeral_shared.was_contributory() || !static_shared.was_contributory() {
            return Err(ClientError::WeakKey);
        }
        let mut ikm = Zeroizing::new([0u8; 64]);
        ikm[..32].copy_from_slice(ephemeral_shared.as_bytes());
        ikm[32..].copy_from_slice(static_shared.as_bytes());

        let transcript = Transcript {
            protocol_version: self.protocol_version,
            quote_version: response.quote_version,
            quote_digest: &response.quote_digest,
            client_public: &self.public,
            ephemeral_public: &response.server_ephemeral_public,
            static_public: &response.server_static_public,
        };
        let schedule = transcript.derive(&ikm[..])?;
        if !transcript.verify_authenticator(
            &schedule.confirm,
            &response.session_id,
            &response.authenticator,
        ) {
            return Err(ClientError::HandshakeAuthentication);
        }

        Ok(ClientSession {
            session_id: response.session_id,
            quote_version: response.quote_version,
            client_to_server: schedule.client_to_server,
            server_to_client: schedule.server_to_client,
            counter: 0,
        })
    }
}

/// An established client session
pub struct ClientSession {
    session_id: SessionId,
    quote_version: QuoteVersion,
    client_to_server: SymmetricKey,
    server_to_client: SymmetricKey,
    counter: u64,
}

impl ClientSession {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn quote_version(&self) -> QuoteVersion {
        self.quote_version
    }

    /// Counter of the last sealed request
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Seal the next request under a fresh counter
    pub fn seal_request(&mut self, plaintext: &[u8]) -> Result<Envelope, ClientError> {
        self.counter += 1;
        Ok(Envelope::seal(
            Direction::Request,
            self.session_id,
            self.counter,
            &self.client_to_server,
            plaintext,
        )?)
    }

    /// Open the reply to the request sealed with `expected_counter`
    pub fn open_reply(&self, reply: &Reply, expected_counter: u64) -> Result<ReplyBody, ClientError> {
        if reply.header.session_id != self.session_id {
            return Err(ClientError::UnexpectedReply(format!(
                "reply for session {}",
                reply.header.session_id.short()
            )));
        }
        if reply.header.counter != expected_counter {
            return Err(ClientError::UnexpectedReply(format!(
                "reply counter {} does not match request {}",
                reply.header.counter, expected_counter
            )));
        }
        let plaintext = reply
            .envelope()
            .open(Direction::Reply, &self.server_to_client)
            .map_err(|_| ClientError::ReplyAuthentication)?;
        ReplyBody::decode(&plaintext)
            .ok_or_else(|| ClientError::UnexpectedReply("bad reply framing".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::attestation::tests::quote_for;
    use crate::tee::attestation::AttestationManager;
    use crate::tee::negotiation::NegotiationService;
    use crate::tee::platform::{Platform, SimulatedPlatform};
    use crate::tee::session::SessionTable;
    use std::time::Duration;

    struct Node {
        platform: SimulatedPlatform,
        attestation: AttestationManager,
        sessions: SessionTable,
        service: NegotiationService,
    }

    fn node() -> (Node, Vec<u8>) {
        let platform = SimulatedPlatform::development();
        let attestation = AttestationManager::new(*platform.identity(), vec![2]);
        let quote = quote_for(&attestation, &platform);
        attestation.commit_quote(&quote).unwrap();
        let node = Node {
            platform,
            attestation,
            sessions: SessionTable::new(8, Duration::from_secs(60)),
            service: NegotiationService::new(DEFAULT_PROTOCOL_VERSION, 0),
        };
        (node, quote)
    }

    fn respond(node: &Node, request: &NegotiationRequest) -> NegotiationResponse {
        node.service
            .negotiate(&node.attestation, &node.sessions, request)
            .unwrap()
    }

    #[test]
    fn test_handshake_completes() {
        let (node, quote) = node();
        let (handshake, request) = ClientHandshake::initiate();
        let response = respond(&node, &request);

        let mut session = handshake
            .expect_identity(*node.platform.identity())
            .finish(&response, &quote)
            .unwrap();
        assert_eq!(session.session_id(), response.session_id);
        assert_eq!(session.quote_version(), QuoteVersion(1));

        let envelope = session.seal_request(b"hi").unwrap();
        assert_eq!(envelope.header.counter, 1);
        let opened = node.sessions.open_request(&envelope, Some(QuoteVersion(1)));
        assert_eq!(opened.unwrap().plaintext.as_slice(), b"hi");
    }

    #[test]
    fn test_rejects_other_quote() {
        let (node, _) = node();
        let (handshake, request) = ClientHandshake::initiate();
        let response = respond(&node, &request);

        // A quote over the next staged key is valid but not the one negotiated
        let other = quote_for(&node.attestation, &node.platform);
        assert!(matches!(
            handshake.finish(&response, &other),
            Err(ClientError::QuoteMismatch)
        ));
    }

    #[test]
    fn test_rejects_substituted_static_key() {
        let (node, quote) = node();
        let (handshake, request) = ClientHandshake::initiate();
        let mut response = respond(&node, &request);
        response.server_static_public = response.server_ephemeral_public;
        assert!(matches!(
            handshake.finish(&response, &quote),
            Err(ClientError::StaticKeyMismatch)
        ));
    }

    #[test]
    fn test_rejects_forged_authenticator() {
        let (node, quote) = node();
        let (handshake, request) = ClientHandshake::initiate();
        let mut response = respond(&node, &request);
        response.authenticator[0] ^= 1;
        assert!(matches!(
            handshake.finish(&response, &quote),
            Err(ClientError::HandshakeAuthentication)
        ));
    }

    #[test]
    fn test_protocol_version_mismatch() {
        let (node, quote) = node();
        let (handshake, request) = ClientHandshake::with_protocol_version(2);
        let response = respond(&node, &request);
        assert!(matches!(
            handshake.finish(&response, &quote),
            Err(ClientError::HandshakeAuthentication)
        ));
    }

    #[test]
    fn test_rejects_unexpected_identity() {
        let (node, quote) = node();
        let (handshake, request) = ClientHandshake::initiate();
        let response = respond(&node, &request);
        let other = EnclaveIdentity::compute("other", "other", 1, 1);
        assert!(matches!(
            handshake.expect_identity(other).finish(&response, &quote),
            Err(ClientError::Quote(_))
        ));
    }

    #[test]
    fn test_counter_increases() {
        let (node, quote) = node();
        let (handshake, request) = ClientHandshake::initiate();
        let response = respond(&node, &request);
        let mut session = handshake.finish(&response, &quote).unwrap();
        let a = session.seal_request(b"a").unwrap();
        let b = session.seal_request(b"b").unwrap();
        assert!(b.header.counter > a.header.counter);
        assert_eq!(session.counter(), 2);
    }
}
