use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// 2010-11-04T01:42:54.657Z, the customary snowflake epoch
const ID_EPOCH_MS: u64 = 1_288_834_974_657;
const NODE_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Time-ordered identifier assigned to a message when it is published.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 16 {
            return Err(Error::InvalidMessage(format!("bad message id {:?}", s)));
        }
        u64::from_str_radix(s, 16)
            .map(MessageId)
            .map_err(|_| Error::InvalidMessage(format!("bad message id {:?}", s)))
    }
}

/// Snowflake-style id source: millisecond timestamp, node id, sequence.
///
/// Ids only move forward. If the wall clock steps back, the generator keeps
/// counting from the last timestamp it issued, and a sequence overflow borrows
/// the next millisecond.
pub struct IdGenerator {
    node_id: u64,
    state: Mutex<IdState>,
}

#[derive(Default)]
struct IdState {
    last_ms: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id: node_id & ((1 << NODE_ID_BITS) - 1),
            state: Mutex::new(IdState::default()),
        }
    }

    pub fn next_id(&self) -> MessageId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(ID_EPOCH_MS);

        let mut state = self.state.lock();
        let mut ms = now.max(state.last_ms);
        if ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                ms += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = ms;

        MessageId(
            (ms << (NODE_ID_BITS + SEQUENCE_BITS))
                | (self.node_id << SEQUENCE_BITS)
                | state.sequence,
        )
    }
}

/// A message as it moves through topics and channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identity assigned at publish time
    pub id: MessageId,
    /// Publish time, nanoseconds since the Unix epoch
    pub timestamp: u64,
    /// Number of times this message has been handed to a consumer
    pub attempts: u16,
    /// The message payload
    pub body: Bytes,
    /// Delay to apply when a topic-buffered message reaches its channels
    pub(crate) deferred: Duration,
}

impl Message {
    /// Create a new message
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            timestamp: now_nanos(),
            attempts: 0,
            body: body.into(),
            deferred: Duration::ZERO,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
