use crate::error::Result;
use crate::message::MessageId;
use crate::topic::Topic;
use crate::{Broker, ClientId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A client that publishes to one topic
#[derive(Clone)]
pub struct Publisher {
    topic: Arc<Topic>,
    client_id: ClientId,
}

impl Publisher {
    /// Create a publisher for `topic`, creating the topic if needed
    pub fn new(broker: &Broker, topic: &str) -> Result<Self> {
        Ok(Self::for_topic(broker.get_topic(topic)?))
    }

    pub fn for_topic(topic: Arc<Topic>) -> Self {
        let client_id = ClientId::new();
        debug!(topic = %topic.name(), client = %client_id.as_str(), "creating publisher");
        Self { topic, client_id }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// Publish one message
    pub fn publish(&self, payload: impl Into<Bytes>) -> Result<MessageId> {
        self.topic.publish(payload)
    }

    /// Publish one message that becomes deliverable after `delay`
    pub fn publish_deferred(&self, payload: impl Into<Bytes>, delay: Duration) -> Result<MessageId> {
        self.topic.publish_deferred(payload, delay)
    }

    /// Publish multiple messages in batch
    pub fn publish_batch<I, B>(&self, payloads: I) -> Result<Vec<MessageId>>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let ids = self.topic.publish_multiple(payloads)?;
        debug!(topic = %self.topic.name(), count = ids.len(), "published batch");
        Ok(ids)
    }
}
