//! Untrusted-side reply sink
//!
//! The trusted side never returns a call's result directly; it hands a sealed
//! `Reply` plus the caller's tag to a `ReplySink`. A `ReplyTicket` is issued
//! per accepted call and is consumed by value when the reply is sent, so one
//! call cannot produce two replies.

use crate::envelope::{Envelope, MessageTag, MsgHeader};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A sealed reply plus the tag of the call it answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub header: MsgHeader,
    pub ciphertext: Vec<u8>,
    pub tag: MessageTag,
}

impl Reply {
    pub fn envelope(&self) -> Envelope {
        Envelope {
            header: self.header.clone(),
            ciphertext: self.ciphertext.clone(),
        }
    }
}

/// Receives sealed replies on the untrusted side
pub trait ReplySink: Send + Sync {
    fn deliver(&self, reply: Reply);
}

impl<F> ReplySink for F
where
    F: Fn(Reply) + Send + Sync,
{
    fn deliver(&self, reply: Reply) {
        self(reply)
    }
}

/// One-shot right to reply to an accepted call
#[must_use = "an accepted call must be answered"]
pub struct ReplyTicket {
    tag: MessageTag,
}

impl ReplyTicket {
    pub(crate) fn new(tag: MessageTag) -> Self {
        Self { tag }
    }

    pub fn tag(&self) -> MessageTag {
        self.tag
    }

    /// Deliver `envelope` as the reply for this ticket's call
    pub fn send(self, sink: &dyn ReplySink, envelope: Envelope) {
        sink.deliver(Reply {
            header: envelope.header,
            ciphertext: envelope.ciphertext,
            tag: self.tag,
        });
    }
}

/// Sink forwarding replies into a tokio channel
#[derive(Clone)]
pub struct ChannelReplySink {
    tx: mpsc::UnboundedSender<Reply>,
}

impl ChannelReplySink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReplySink for ChannelReplySink {
    fn deliver(&self, reply: Reply) {
        if self.tx.send(reply).is_err() {
            log::warn!("Reply receiver dropped; reply discarded");
        }
    }
}
