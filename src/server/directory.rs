//! Sample domain server: a sealed phone-number → UUID directory
//!
//! Requests are batches of little-endian `u64` phone numbers; the reply holds
//! one 16-byte UUID per number, nil when the number is not registered.

use super::{Server, ServerError};
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const MALFORMED_QUERY: &[u8] = b"malformed query";
pub const QUERY_TOO_LARGE: &[u8] = b"query too large";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStartArgs {
    pub entries: Vec<(u64, Uuid)>,
    /// Max phone numbers per query
    pub max_query: usize,
}

/// Host-supplied framing hint, checked against the decrypted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCallArgs {
    pub query_count: u32,
}

pub struct DirectoryServer {
    directory: HashMap<u64, Uuid>,
    max_query: usize,
    queries: u64,
}

impl DirectoryServer {
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }
}

impl Server for DirectoryServer {
    type StartArgs = DirectoryStartArgs;
    type CallArgs = DirectoryCallArgs;
    type StopArgs = ();

    fn start(args: DirectoryStartArgs) -> Result<Self, ServerError> {
        if args.max_query == 0 {
            return Err(ServerError("max_query must be > 0".into()));
        }
        let mut directory = HashMap::with_capacity(args.entries.len());
        for (phone, uuid) in args.entries {
            if phone == 0 {
                return Err(ServerError("phone number 0 is reserved".into()));
            }
            directory.insert(phone, uuid);
        }
        Ok(Self {
            directory,
            max_query: args.max_query,
            queries: 0,
        })
    }

    fn call(&mut self, args: &DirectoryCallArgs, request: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
        if request.len() % 8 != 0 || request.len() / 8 != args.query_count as usize {
            return Err(MALFORMED_QUERY.to_vec());
        }
        let count = request.len() / 8;
        if count > self.max_query {
            return Err(QUERY_TOO_LARGE.to_vec());
        }

        let mut reply = Vec::with_capacity(count * 16);
        for chunk in request.chunks_exact(8) {
            let phone = LittleEndian::read_u64(chunk);
            let uuid = self.directory.get(&phone).copied().unwrap_or(Uuid::nil());
            reply.extend_from_slice(uuid.as_bytes());
        }
        self.queries += 1;
        Ok(reply)
    }

    fn stop(self, _: ()) {
        info!(
            "Directory of {} entries released after {} queries",
            self.directory.len(),
            self.queries
        );
    }
}

/// Encode a batch of phone numbers as a directory query
pub fn encode_query(phones: &[u64]) -> Vec<u8> {
    let mut out = vec![0u8; phones.len() * 8];
    LittleEndian::write_u64_into(phones, &mut out);
    out
}

/// Decode a directory reply into one UUID per queried number
pub fn decode_reply(reply: &[u8]) -> Option<Vec<Uuid>> {
    if reply.len() % 16 != 0 {
        return None;
    }
    reply
        .chunks_exact(16)
        .map(|chunk| Uuid::from_slice(chunk).ok())
        .collect()
}
