//! Call dispatch: admit, open, run and answer one tagged call
//!
//! Nothing is emitted for a rejected call. An accepted call (admitted by the
//! registry, authenticated and counter-checked by the session table) always
//! produces exactly one sealed reply, even when the domain callback panics.

use crate::envelope::{Direction, Envelope, MessageTag, ReplyBody};
use crate::error::{BoundaryResult, ProtocolError};
use crate::reply::{ReplySink, ReplyTicket};
use crate::server::{Server, ServerHandle, ServerRegistry};
use crate::tee::attestation::QuoteVersion;
use crate::tee::session::SessionTable;
use log::{debug, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use zeroize::Zeroizing;

pub struct CallDispatcher {
    max_message_size: usize,
}

impl CallDispatcher {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<S: Server>(
        &self,
        registry: &ServerRegistry<S>,
        sessions: &SessionTable,
        current: Option<QuoteVersion>,
        sink: &dyn ReplySink,
        args: &S::CallArgs,
        envelope: &Envelope,
        tag: MessageTag,
        handle: ServerHandle,
    ) -> BoundaryResult<()> {
        let guard = registry.enter(handle).map_err(|e| {
            warn!("Call {} rejected: {}", tag, e);
            e
        })?;

        if envelope.ciphertext.len() > self.max_message_size {
            warn!(
                "Call {} rejected: {} byte message exceeds {}",
                tag,
                envelope.ciphertext.len(),
                self.max_message_size
            );
            return Err(ProtocolError::InvalidRequest(format!(
                "message of {} bytes exceeds limit {}",
                envelope.ciphertext.len(),
                self.max_message_size
            ))
            .into());
        }

        let opened = sessions.open_request(envelope, current).map_err(|e| {
            warn!(
                "Call {} on session {} rejected: {}",
                tag,
                envelope.header.session_id.short(),
                e
            );
            e
        })?;
        let ticket = ReplyTicket::new(tag);

        let body = match catch_unwind(AssertUnwindSafe(|| {
            guard.call(args, opened.plaintext.as_slice())
        })) {
            Ok(result) => ReplyBody::from(result),
            Err(_) => {
                warn!("Call {} on server {} panicked; replying Aborted", tag, handle);
                ReplyBody::Aborted
            }
        };

        let plaintext = Zeroizing::new(body.encode());
        let reply = Envelope::seal(
            Direction::Reply,
            envelope.header.session_id,
            envelope.header.counter,
            &opened.reply_key,
            &plaintext,
        )?;
        ticket.send(sink, reply);
        debug!(
            "Call {} on server {} answered (counter {})",
            tag, handle, envelope.header.counter
        );

        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{ChannelReplySink, Reply};
    use crate::server::ServerError;
    use crate::tee::session::{SessionId, SessionKeys};
    use std::time::Duration;

    const V1: QuoteVersion = QuoteVersion(1);
    const C2S: [u8; 32] = [4u8; 32];
    const S2C: [u8; 32] = [5u8; 32];

    /// Echoes the request; "fail" is a domain error, "panic" panics
    struct Echo;

    impl Server for Echo {
        type StartArgs = ();
        type CallArgs = ();
        type StopArgs = ();

        fn start(_: ()) -> Result<Self, ServerError> {
            Ok(Echo)
        }

        fn call(&mut self, _: &(), request: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
            match request {
                b"fail" => Err(b"domain error".to_vec()),
                b"panic" => panic!("callback failure"),
                other => Ok(other.to_vec()),
            }
        }

        fn stop(self, _: ()) {}
    }

    struct Fixture {
        registry: ServerRegistry<Echo>,
        sessions: SessionTable,
        dispatcher: CallDispatcher,
        session: SessionId,
        sink: ChannelReplySink,
        rx: tokio::sync::mpsc::UnboundedReceiver<Reply>,
    }

    fn fixture() -> Fixture {
        let registry = ServerRegistry::new();
        registry.start(ServerHandle(1), ()).unwrap();
        let sessions = SessionTable::new(8, Duration::from_secs(60));
        let session = sessions
            .insert(
                SessionKeys {
                    client_to_server: Zeroizing::new(C2S),
                    server_to_client: Zeroizing::new(S2C),
                },
                V1,
            )
            .unwrap();
        let (sink, rx) = ChannelReplySink::channel();
        Fixture {
            registry,
            sessions,
            dispatcher: CallDispatcher::new(64),
            session,
            sink,
            rx,
        }
    }

    impl Fixture {
        fn call(&self, counter: u64, payload: &[u8], tag: u64) -> BoundaryResult<()> {
            let env =
                Envelope::seal(Direction::Request, self.session, counter, &C2S, payload).unwrap();
            self.dispatcher.dispatch(
                &self.registry,
                &self.sessions,
                Some(V1),
                &self.sink,
                &(),
                &env,
                MessageTag(tag),
                ServerHandle(1),
            )
        }

        fn reply_body(&mut self) -> (MessageTag, u64, ReplyBody) {
            let reply = self.rx.try_recv().unwrap();
            let plain = reply.envelope().open(Direction::Reply, &S2C).unwrap();
            (
                reply.tag,
                reply.header.counter,
                ReplyBody::decode(&plain).unwrap(),
            )
        }
    }

    #[test]
    fn test_call_produces_one_tagged_reply() {
        let mut f = fixture();
        f.call(1, b"hello", 42).unwrap();
        let (tag, counter, body) = f.reply_body();
        assert_eq!(tag, MessageTag(42));
        assert_eq!(counter, 1);
        assert_eq!(body, ReplyBody::Ok(b"hello".to_vec()));
        assert!(f.rx.try_recv().is_err());
    }

    #[test]
    fn test_domain_error_is_a_reply() {
        let mut f = fixture();
        f.call(1, b"fail", 7).unwrap();
        let (tag, _, body) = f.reply_body();
        assert_eq!(tag, MessageTag(7));
        assert_eq!(body, ReplyBody::Failed(b"domain error".to_vec()));
    }

    #[test]
    fn test_panicking_callback_replies_aborted() {
        let mut f = fixture();
        f.call(1, b"panic", 9).unwrap();
        let (tag, _, body) = f.reply_body();
        assert_eq!(tag, MessageTag(9));
        assert_eq!(body, ReplyBody::Aborted);

        // The server keeps serving
        f.call(2, b"again", 10).unwrap();
        assert_eq!(f.reply_body().2, ReplyBody::Ok(b"again".to_vec()));
    }

    #[test]
    fn test_replay_emits_nothing() {
        let mut f = fixture();
        f.call(1, b"q", 1).unwrap();
        f.reply_body();

        let err = f.call(1, b"q", 2).unwrap_err();
        assert!(matches!(
            err.protocol(),
            Some(ProtocolError::ReplayDetected { counter: 1, last: 1 })
        ));
        assert!(f.rx.try_recv().is_err());
    }

    #[test]
    fn test_rejections_before_decrypt() {
        let mut f = fixture();
        let err = f.call(1, &[0u8; 65], 1).unwrap_err();
        assert!(matches!(
            err.protocol(),
            Some(ProtocolError::InvalidRequest(_))
        ));

        let env = Envelope::seal(Direction::Request, f.session, 1, &C2S, b"x").unwrap();
        let err = f
            .dispatcher
            .dispatch(
                &f.registry,
                &f.sessions,
                Some(V1),
                &f.sink,
                &(),
                &env,
                MessageTag(1),
                ServerHandle(99),
            )
            .unwrap_err();
        assert_eq!(
            err.protocol(),
            Some(&ProtocolError::NotFound(ServerHandle(99)))
        );
        assert!(f.rx.try_recv().is_err());

        // Nothing above consumed counter 1
        f.call(1, b"x", 3).unwrap();
        assert_eq!(f.reply_body().0, MessageTag(3));
    }

    #[test]
    fn test_tampered_request_emits_nothing() {
        let mut f = fixture();
        let mut env = Envelope::seal(Direction::Request, f.session, 1, &C2S, b"q").unwrap();
        env.header.mac[0] ^= 0x01;
        let err = f
            .dispatcher
            .dispatch(
                &f.registry,
                &f.sessions,
                Some(V1),
                &f.sink,
                &(),
                &env,
                MessageTag(1),
                ServerHandle(1),
            )
            .unwrap_err();
        assert_eq!(err.protocol(), Some(&ProtocolError::AuthenticationFailed));
        assert!(f.rx.try_recv().is_err());

        // The forgery did not consume counter 1
        f.call(1, b"q", 2).unwrap();
        let (tag, counter, body) = f.reply_body();
        assert_eq!((tag, counter), (MessageTag(2), 1));
        assert_eq!(body, ReplyBody::Ok(b"q".to_vec()));
    }

    #[test]
    fn test_stale_session_rejected() {
        let f = fixture();
        let env = Envelope::seal(Direction::Request, f.session, 1, &C2S, b"x").unwrap();
        let err = f
            .dispatcher
            .dispatch(
                &f.registry,
                &f.sessions,
                Some(QuoteVersion(2)),
                &f.sink,
                &(),
                &env,
                MessageTag(1),
                ServerHandle(1),
            )
            .unwrap_err();
        assert_eq!(err.protocol(), Some(&ProtocolError::UnknownSession));
    }
}
