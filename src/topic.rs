//! A topic: the publish side of the engine.
//!
//! Publishes to one topic are serialized by `publish_lock`, so every channel
//! sees the topic's messages in the same order. While the topic has no
//! channels, or is paused, published messages wait in the topic's own memory
//! ring and backing store; they are handed to the channels, oldest first, as
//! soon as there is somewhere to send them.

use crate::broker::ring_buffer::RingBuffer;
use crate::channel::{Channel, ChannelStats};
use crate::config::Options;
use crate::diskqueue::{BackendQueue, DiskQueue, DiskQueueOptions};
use crate::error::{Error, Result};
use crate::message::{IdGenerator, Message, MessageId};
use crate::{is_ephemeral, is_valid_name};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Called after a structural change (channel created or deleted, pause
/// state flipped) so the owner can persist metadata.
pub(crate) type ChangeHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Counters {
    message_count: AtomicU64,
    message_bytes: AtomicU64,
}

/// Point-in-time view of a topic and its channels.
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub name: String,
    pub depth: u64,
    pub backend_depth: u64,
    pub message_count: u64,
    pub message_bytes: u64,
    pub paused: bool,
    pub ephemeral: bool,
    pub channels: Vec<ChannelStats>,
}

pub struct Topic {
    name: String,
    ephemeral: bool,
    opts: Arc<Options>,
    ids: Arc<IdGenerator>,

    publish_lock: Mutex<()>,
    memory: Mutex<RingBuffer<Message>>,
    backend: BackendQueue,
    channels: RwLock<HashMap<String, Arc<Channel>>>,

    idle_since: Mutex<Instant>,
    paused: AtomicBool,
    exiting: AtomicBool,
    on_change: Option<ChangeHook>,
    counters: Counters,
}

impl Topic {
    pub fn new(name: &str, opts: Arc<Options>, ids: Arc<IdGenerator>) -> Result<Self> {
        Self::with_hook(name, opts, ids, None)
    }

    pub(crate) fn with_hook(
        name: &str,
        opts: Arc<Options>,
        ids: Arc<IdGenerator>,
        on_change: Option<ChangeHook>,
    ) -> Result<Self> {
        if !is_valid_name(name) {
            return Err(Error::InvalidTopic(name.to_string()));
        }

        let ephemeral = is_ephemeral(name);
        let backend = if ephemeral {
            BackendQueue::Discard
        } else {
            BackendQueue::Disk(DiskQueue::open(
                name,
                &opts.data_path,
                DiskQueueOptions::from_options(&opts),
            )?)
        };

        info!(topic = %name, "created topic");

        Ok(Self {
            name: name.to_string(),
            ephemeral,
            publish_lock: Mutex::new(()),
            memory: Mutex::new(RingBuffer::new(opts.mem_queue_size)),
            backend,
            channels: RwLock::new(HashMap::new()),
            idle_since: Mutex::new(Instant::now()),
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            on_change,
            counters: Counters::default(),
            opts,
            ids,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Messages held by the topic itself, waiting for a channel.
    pub fn depth(&self) -> u64 {
        self.memory.lock().len() as u64 + self.backend.depth()
    }

    fn check_body(&self, body: &[u8]) -> Result<()> {
        if body.is_empty() {
            return Err(Error::InvalidMessage("empty message body".into()));
        }
        if body.len() > self.opts.max_msg_size {
            return Err(Error::SizeExceeded {
                size: body.len(),
                max: self.opts.max_msg_size,
            });
        }
        Ok(())
    }

    /// Publish one message to every current channel.
    pub fn publish(&self, body: impl Into<Bytes>) -> Result<MessageId> {
        self.publish_with_delay(body.into(), Duration::ZERO)
    }

    /// Publish one message that each channel holds back for `delay`
    /// (clamped to `max_req_timeout`).
    pub fn publish_deferred(&self, body: impl Into<Bytes>, delay: Duration) -> Result<MessageId> {
        self.publish_with_delay(body.into(), delay.min(self.opts.max_req_timeout))
    }

    fn publish_with_delay(&self, body: Bytes, delay: Duration) -> Result<MessageId> {
        self.check_body(&body)?;

        let _publish = self.publish_lock.lock();
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let mut msg = Message::new(self.ids.next_id(), body);
        msg.deferred = delay;
        let id = msg.id;
        let len = msg.body.len() as u64;

        self.put_locked(msg)?;
        self.counters.message_count.fetch_add(1, Ordering::Relaxed);
        self.counters.message_bytes.fetch_add(len, Ordering::Relaxed);
        Ok(id)
    }

    /// Publish a batch. No other publish to this topic lands between the
    /// batch's messages in any channel.
    pub fn publish_multiple<I, B>(&self, bodies: I) -> Result<Vec<MessageId>>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let bodies: Vec<Bytes> = bodies.into_iter().map(Into::into).collect();
        if bodies.is_empty() {
            return Err(Error::InvalidMessage("empty batch".into()));
        }
        let mut total = 0;
        for body in &bodies {
            self.check_body(body)?;
            total += body.len();
        }
        if total > self.opts.max_body_size {
            return Err(Error::SizeExceeded {
                size: total,
                max: self.opts.max_body_size,
            });
        }

        let _publish = self.publish_lock.lock();
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            let msg = Message::new(self.ids.next_id(), body);
            ids.push(msg.id);
            self.put_locked(msg)?;
        }
        self.counters
            .message_count
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        self.counters
            .message_bytes
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(ids)
    }

    fn channel_list(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    fn put_locked(&self, msg: Message) -> Result<()> {
        let channels = self.channel_list();
        if channels.is_empty() || self.is_paused() {
            return self.buffer(msg);
        }
        if self.depth() > 0 {
            self.drain_locked(&channels)?;
        }
        self.fan_out(&channels, &msg)
    }

    fn buffer(&self, msg: Message) -> Result<()> {
        let spilled = {
            let mut memory = self.memory.lock();
            if self.backend.depth() == 0 {
                memory.push(msg).err()
            } else {
                Some(msg)
            }
        };
        if let Some(msg) = spilled {
            if let Err(e) = self.backend.put(&msg.encode()?) {
                error!(topic = %self.name, error = %e, "failed to write message to backing store");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Copy `msg` into every channel. A channel that cannot take it drops
    /// its copy; the put only fails when no channel took the message.
    fn fan_out(&self, channels: &[Arc<Channel>], msg: &Message) -> Result<()> {
        let mut accepted = 0usize;
        let mut rejected = Vec::new();
        for channel in channels {
            let copy = msg.clone();
            let put = if copy.deferred.is_zero() {
                channel.put_message(copy)
            } else {
                let delay = copy.deferred;
                channel.put_deferred(copy, delay)
            };
            match put {
                Ok(()) => accepted += 1,
                // deleted or closing under us
                Err(Error::Exiting) => {}
                Err(e) => rejected.push((channel, e)),
            }
        }

        let mut first = None;
        for (channel, e) in rejected {
            if accepted == 0 {
                error!(topic = %self.name, channel = %channel.name(), error = %e, "failed to put message to channel");
                first.get_or_insert(e);
                continue;
            }
            channel.count_dropped();
            if channel.is_ephemeral() {
                warn!(topic = %self.name, channel = %channel.name(), id = %msg.id, error = %e, "channel full, dropping message");
            } else {
                error!(topic = %self.name, channel = %channel.name(), id = %msg.id, error = %e, "failed to put message to channel, dropping it");
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand everything the topic is holding to `channels`, oldest first.
    /// A message no channel would take goes back to the head of the buffer.
    fn drain_locked(&self, channels: &[Arc<Channel>]) -> Result<()> {
        let mut drained = 0usize;
        let result = loop {
            let msg = match self.memory.lock().pop() {
                Some(msg) => msg,
                None => match self.backend.read_one()? {
                    Some(buf) => Message::decode(&buf)?,
                    None => break Ok(()),
                },
            };
            if let Err(e) = self.fan_out(channels, &msg) {
                self.memory.lock().push_front(msg);
                break Err(e);
            }
            drained += 1;
        };
        if drained > 0 {
            debug!(topic = %self.name, drained, "released buffered messages to channels");
        }
        result
    }

    /// Look up a channel, creating it on first reference.
    pub fn get_channel(&self, name: &str) -> Result<Arc<Channel>> {
        if let Some(channel) = self.channels.read().get(name) {
            return Ok(channel.clone());
        }
        if !is_valid_name(name) {
            return Err(Error::InvalidChannel(name.to_string()));
        }

        let publish = self.publish_lock.lock();
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let channel = {
            let mut channels = self.channels.write();
            if let Some(channel) = channels.get(name) {
                return Ok(channel.clone());
            }
            let channel = Arc::new(Channel::new(&self.name, name, self.opts.clone())?);
            channels.insert(name.to_string(), channel.clone());
            channel
        };
        if !self.is_paused() && self.depth() > 0 {
            self.drain_locked(&self.channel_list())?;
        }
        drop(publish);

        self.changed();
        Ok(channel)
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channel_list()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Remove a channel and discard its messages.
    pub fn delete_channel(&self, name: &str) -> Result<()> {
        let channel = {
            let mut channels = self.channels.write();
            let channel = channels
                .remove(name)
                .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
            if channels.is_empty() {
                *self.idle_since.lock() = Instant::now();
            }
            channel
        };
        info!(topic = %self.name, channel = %name, "deleting channel");
        let deleted = channel.delete();
        self.changed();
        deleted
    }

    /// Stop fanning out; publishes keep being accepted and are held by the
    /// topic until it is unpaused.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!(topic = %self.name, "paused topic");
            self.changed();
        }
    }

    pub fn unpause(&self) -> Result<()> {
        {
            let _publish = self.publish_lock.lock();
            if !self.paused.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            info!(topic = %self.name, "unpaused topic");
            let channels = self.channel_list();
            if !channels.is_empty() {
                self.drain_locked(&channels)?;
            }
        }
        self.changed();
        Ok(())
    }

    /// Discard the messages the topic itself is holding.
    pub fn empty(&self) -> Result<()> {
        let _publish = self.publish_lock.lock();
        self.memory.lock().clear();
        self.backend.empty()
    }

    /// Ephemeral, channel-less and empty for at least `grace`.
    pub(crate) fn is_idle_for(&self, grace: Duration) -> bool {
        self.ephemeral
            && self.channels.read().is_empty()
            && self.depth() == 0
            && self.idle_since.lock().elapsed() >= grace
    }

    pub(crate) fn flush_if_stale(&self) -> Result<bool> {
        let mut flushed = self.backend.flush_if_stale()?;
        for channel in self.channel_list() {
            flushed |= channel.flush_if_stale()?;
        }
        Ok(flushed)
    }

    /// Close every channel and persist what the topic is holding.
    pub fn close(&self) -> Result<()> {
        self.shutdown(false)
    }

    /// Delete every channel and the topic's own backing store.
    pub fn delete(&self) -> Result<()> {
        self.shutdown(true)
    }

    fn shutdown(&self, deleted: bool) -> Result<()> {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if deleted {
            info!(topic = %self.name, "deleting topic");
        } else {
            info!(topic = %self.name, "closing topic");
        }

        let _publish = self.publish_lock.lock();
        let channels: Vec<Arc<Channel>> = if deleted {
            self.channels.write().drain().map(|(_, c)| c).collect()
        } else {
            self.channel_list()
        };

        let mut result = Ok(());
        for channel in channels {
            let closed = if deleted { channel.delete() } else { channel.close() };
            if let Err(e) = closed {
                error!(topic = %self.name, channel = %channel.name(), error = %e, "failed to stop channel");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let pending: Vec<Message> = self.memory.lock().drain().collect();
        let stopped = if deleted {
            self.backend.delete()
        } else {
            self.flush(pending).and_then(|()| self.backend.close())
        };
        result.and(stopped)
    }

    fn flush(&self, pending: Vec<Message>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        if let BackendQueue::Discard = self.backend {
            warn!(topic = %self.name, dropped = pending.len(), "ephemeral topic dropped messages on close");
            return Ok(());
        }
        for msg in &pending {
            self.backend.put(&msg.encode()?)?;
        }
        debug!(topic = %self.name, flushed = pending.len(), "flushed topic");
        Ok(())
    }

    fn changed(&self) {
        if let Some(hook) = &self.on_change {
            hook();
        }
    }

    pub fn stats(&self) -> TopicStats {
        let mut channels: Vec<ChannelStats> =
            self.channel_list().iter().map(|c| c.stats()).collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        TopicStats {
            name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            message_count: self.counters.message_count.load(Ordering::Relaxed),
            message_bytes: self.counters.message_bytes.load(Ordering::Relaxed),
            paused: self.is_paused(),
            ephemeral: self.ephemeral,
            channels,
        }
    }
}
