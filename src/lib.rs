//! A single-node message queue engine.
//!
//! Publishers write to named [`Topic`]s. Every topic fans its messages out to
//! its [`Channel`]s, and each channel is an independent at-least-once queue
//! that consumers subscribe to. Queues live in a bounded memory ring that
//! spills to an append-only segment store on disk; delivered messages are
//! tracked until acknowledged, and a sampling scan loop requeues the ones
//! whose consumers went quiet.
//!
//! The [`Broker`] owns the topic registry and the process lifecycle, and
//! [`server::serve`] runs the TCP accept loop that hands connections to a
//! protocol [`server::ConnectionHandler`].

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod diskqueue;
pub mod error;
pub mod message;
pub mod server;
pub mod topic;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use broker::{Broker, BrokerStats};
pub use channel::{Channel, ChannelStats};
pub use client::{Publisher, Subscriber};
pub use config::Options;
pub use error::{Error, Result};
pub use message::{Message, MessageId};
pub use topic::{Topic, TopicStats};

/// Maximum length for topic and channel names, including any suffix
pub const MAX_NAME_LENGTH: usize = 64;

/// Names ending in this are ephemeral: never written to disk, and removed
/// once nothing references them.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Unique identifier for a client
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the string representation of the client ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

/// Whether `name` is a legal topic or channel name.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub fn is_ephemeral(name: &str) -> bool {
    name.ends_with(EPHEMERAL_SUFFIX)
}
