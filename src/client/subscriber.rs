use crate::channel::Channel;
use crate::error::Result;
use crate::message::{Message, MessageId};
use crate::{Broker, ClientId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A client consuming from one channel.
///
/// Registered with the channel for as long as it lives. Messages it has
/// received stay owned by it until finished, requeued or timed out; only
/// this subscriber can acknowledge them.
pub struct Subscriber {
    channel: Arc<Channel>,
    client_id: ClientId,
    timeout: Duration,
}

impl Subscriber {
    /// Subscribe to `channel` on `topic`, creating both if needed
    pub fn new(broker: &Broker, topic: &str, channel: &str) -> Result<Self> {
        let channel = broker.get_topic(topic)?.get_channel(channel)?;
        Self::for_channel(channel)
    }

    pub fn for_channel(channel: Arc<Channel>) -> Result<Self> {
        let client_id = ClientId::new();
        channel.add_client(&client_id)?;
        info!(
            topic = %channel.topic_name(),
            channel = %channel.name(),
            client = %client_id.as_str(),
            "subscribed"
        );
        Ok(Self {
            channel,
            client_id,
            timeout: Duration::ZERO,
        })
    }

    /// Use `timeout` instead of the channel's default for messages this
    /// subscriber receives.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Wait for the next message; it is in flight to this subscriber when
    /// returned.
    pub async fn receive(&self) -> Result<Message> {
        self.channel.deliver(&self.client_id, self.timeout).await
    }

    /// Like [`Subscriber::receive`], giving up after `wait`.
    pub async fn receive_timeout(&self, wait: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(wait, self.receive()).await {
            Ok(received) => received.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn finish(&self, id: &MessageId) -> Result<()> {
        self.channel.finish_message(&self.client_id, id)
    }

    /// Hand a message back for redelivery after `delay`
    pub fn requeue(&self, id: &MessageId, delay: Duration) -> Result<()> {
        self.channel.requeue_message(&self.client_id, id, delay)
    }

    /// Ask for more time on a message
    pub fn touch(&self, id: &MessageId) -> Result<()> {
        self.channel.touch_message(&self.client_id, id)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.channel.remove_client(&self.client_id) {
            debug!(
                topic = %self.channel.topic_name(),
                channel = %self.channel.name(),
                client = %self.client_id.as_str(),
                "unsubscribed"
            );
        }
    }
}
