use crate::message::MessageId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Message size {size} exceeds maximum {max}")]
    SizeExceeded { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Message {0} is already in flight")]
    AlreadyInFlight(MessageId),

    #[error("Message {0} is not in flight")]
    NotInFlight(MessageId),

    #[error("Message {0} is owned by another client")]
    WrongClient(MessageId),

    #[error("Exiting")]
    Exiting,

    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Client limit exceeded: {0}")]
    ClientLimitExceeded(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Listener accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the error is local to one client's request and leaves the
    /// connection usable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::SizeExceeded { .. }
                | Error::InvalidMessage(_)
                | Error::AlreadyInFlight(_)
                | Error::NotInFlight(_)
                | Error::WrongClient(_)
                | Error::InvalidTopic(_)
                | Error::InvalidChannel(_)
                | Error::ClientLimitExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
