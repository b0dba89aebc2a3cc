//! A channel: one independent, at-least-once queue fed by its topic.
//!
//! Queued messages live in a bounded memory ring that spills to a backing
//! store. Once anything has spilled, later puts also go to disk until it
//! drains, so the ring always holds the oldest messages and delivery stays
//! FIFO. Delivered messages sit in the in-flight tracker until they are
//! finished, requeued or expire; delayed messages sit in the deferred
//! tracker until their time comes.
//!
//! Lock order: `delivery_gate`, `put_lock`, `in_flight`, `deferred`,
//! `memory`. Backing store I/O never happens while a tracker lock is held.

mod tracker;

use crate::broker::ring_buffer::RingBuffer;
use crate::config::Options;
use crate::diskqueue::{BackendQueue, DiskQueue, DiskQueueOptions};
use crate::error::{Error, Result};
use crate::message::{Message, MessageId};
use crate::{is_ephemeral, ClientId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tracker::{DeferredTracker, InFlight, InFlightTracker};

/// Statistics counters for a channel
#[derive(Default)]
struct Counters {
    message_count: AtomicU64,
    finish_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,
    drop_count: AtomicU64,
}

struct ClientInfo {
    connected_at: Instant,
}

/// Point-in-time view of a channel for the admin layer.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub depth: u64,
    pub backend_depth: u64,
    pub in_flight_count: usize,
    pub deferred_count: usize,
    /// Share of the memory ring in use; can pass 1.0 after requeues
    pub memory_usage: f32,
    pub message_count: u64,
    pub finish_count: u64,
    pub requeue_count: u64,
    pub timeout_count: u64,
    /// Copies the topic could not hand to this channel
    pub drop_count: u64,
    pub client_count: usize,
    /// Seconds since the longest-connected client subscribed
    pub oldest_client_secs: u64,
    pub paused: bool,
    pub ephemeral: bool,
}

pub struct Channel {
    topic_name: String,
    name: String,
    ephemeral: bool,
    opts: Arc<Options>,

    delivery_gate: RwLock<()>,
    put_lock: Mutex<()>,
    in_flight: Mutex<InFlightTracker>,
    deferred: Mutex<DeferredTracker>,
    memory: Mutex<RingBuffer<Message>>,
    backend: BackendQueue,

    clients: RwLock<HashMap<ClientId, ClientInfo>>,
    idle_since: Mutex<Instant>,
    paused: AtomicBool,
    exiting: AtomicBool,
    notify: Notify,
    counters: Counters,
}

impl Channel {
    pub fn new(topic_name: &str, name: &str, opts: Arc<Options>) -> Result<Self> {
        let ephemeral = is_ephemeral(name);
        let backend = if ephemeral {
            BackendQueue::Discard
        } else {
            BackendQueue::Disk(DiskQueue::open(
                &format!("{}:{}", topic_name, name),
                &opts.data_path,
                DiskQueueOptions::from_options(&opts),
            )?)
        };

        info!(topic = %topic_name, channel = %name, "created channel");

        Ok(Self {
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            ephemeral,
            delivery_gate: RwLock::new(()),
            put_lock: Mutex::new(()),
            in_flight: Mutex::new(InFlightTracker::new()),
            deferred: Mutex::new(DeferredTracker::new()),
            memory: Mutex::new(RingBuffer::new(opts.mem_queue_size)),
            backend,
            clients: RwLock::new(HashMap::new()),
            idle_since: Mutex::new(Instant::now()),
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            notify: Notify::new(),
            counters: Counters::default(),
            opts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Messages waiting in memory and on disk.
    pub fn depth(&self) -> u64 {
        self.memory.lock().len() as u64 + self.backend.depth()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Enqueue a message for delivery.
    pub fn put_message(&self, msg: Message) -> Result<()> {
        let _put = self.put_lock.lock();
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        self.put_locked(msg)?;
        self.counters.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a message that becomes deliverable after `delay`.
    pub fn put_deferred(&self, msg: Message, delay: Duration) -> Result<()> {
        let _put = self.put_lock.lock();
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let at = Instant::now() + delay.min(self.opts.max_req_timeout);
        self.deferred.lock().defer(msg, at)?;
        self.counters.message_count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }

    fn put_locked(&self, msg: Message) -> Result<()> {
        let spilled = {
            let mut memory = self.memory.lock();
            if self.backend.depth() == 0 {
                memory.push(msg).err()
            } else {
                Some(msg)
            }
        };

        if let Some(msg) = spilled {
            let buf = msg.encode()?;
            if let Err(e) = self.backend.put(&buf) {
                error!(
                    topic = %self.topic_name,
                    channel = %self.name,
                    error = %e,
                    "failed to write message to backing store"
                );
                return Err(e);
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next deliverable message.
    ///
    /// Due deferred messages come first, then the memory ring, then the
    /// backing store. Suspends while the channel is empty or paused and
    /// fails with [`Error::Exiting`] once the channel closes. The caller is
    /// expected to hand the message to [`Channel::start_in_flight`]; use
    /// [`Channel::deliver`] to do both in one step.
    pub async fn recv(&self) -> Result<Message> {
        self.next_with(Ok).await
    }

    /// Wait for the next deliverable message and start it in flight for
    /// `client`. A concurrent close either sees the message in flight or
    /// never sees it leave the queue.
    pub async fn deliver(&self, client: &ClientId, timeout: Duration) -> Result<Message> {
        self.next_with(|msg| self.track_in_flight(msg, client, timeout))
            .await
    }

    async fn next_with<T>(&self, mut take: impl FnMut(Message) -> Result<T>) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let _gate = self.delivery_gate.read();
                if self.is_exiting() {
                    return Err(Error::Exiting);
                }
                if !self.is_paused() {
                    if let Some(msg) = self.next_message()? {
                        return take(msg);
                    }
                }
            }

            self.wait(notified).await;
        }
    }

    async fn wait(&self, notified: Pin<&mut Notified<'_>>) {
        let wake_at = if self.is_paused() {
            None
        } else {
            self.deferred.lock().next_ready_at()
        };

        match wake_at {
            Some(at) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                }
            }
            None => notified.await,
        }
    }

    fn next_message(&self) -> Result<Option<Message>> {
        if let Some(msg) = self.deferred.lock().pop_ready(Instant::now()) {
            return Ok(Some(msg));
        }
        if let Some(msg) = self.memory.lock().pop() {
            return Ok(Some(msg));
        }
        match self.backend.read_one()? {
            Some(buf) => Message::decode(&buf).map(Some),
            None => Ok(None),
        }
    }

    /// Record `msg` as delivered to `client`, due back by now + `timeout`
    /// (clamped to `max_msg_timeout`; zero means the default `msg_timeout`).
    /// Counts one delivery attempt and returns the message as delivered.
    pub fn start_in_flight(&self, msg: Message, client: &ClientId, timeout: Duration) -> Result<Message> {
        let _gate = self.delivery_gate.read();
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        self.track_in_flight(msg, client, timeout)
    }

    /// Caller holds the delivery gate, so a close has not drained yet even
    /// if it has started.
    fn track_in_flight(&self, mut msg: Message, client: &ClientId, timeout: Duration) -> Result<Message> {
        let timeout = if timeout.is_zero() {
            self.opts.msg_timeout
        } else {
            timeout.min(self.opts.max_msg_timeout)
        };
        msg.attempts = msg.attempts.saturating_add(1);
        let now = Instant::now();

        self.in_flight.lock().start(
            InFlight {
                message: msg.clone(),
                client: client.clone(),
                delivered_at: now,
            },
            now + timeout,
        )?;
        Ok(msg)
    }

    /// Acknowledge a message owned by `client`.
    pub fn finish_message(&self, client: &ClientId, id: &MessageId) -> Result<()> {
        self.in_flight.lock().remove_owned(client, id)?;
        self.counters.finish_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return a message owned by `client` to the queue: straight to the
    /// front when `delay` is zero, otherwise after `delay` (clamped to
    /// `max_req_timeout`).
    pub fn requeue_message(&self, client: &ClientId, id: &MessageId, delay: Duration) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock();
            let (deadline, entry) = in_flight.remove_owned(client, id)?;
            if delay.is_zero() {
                self.memory.lock().push_front(entry.message);
            } else {
                let at = Instant::now() + delay.min(self.opts.max_req_timeout);
                if let Err(e) = self.deferred.lock().defer(entry.message.clone(), at) {
                    in_flight.start(entry, deadline)?;
                    return Err(e);
                }
            }
        }
        self.counters.requeue_count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Push back the deadline of a message owned by `client` by the
    /// channel's `msg_timeout`, never past delivery time + `max_msg_timeout`.
    pub fn touch_message(&self, client: &ClientId, id: &MessageId) -> Result<()> {
        let now = Instant::now();
        let (timeout, max) = (self.opts.msg_timeout, self.opts.max_msg_timeout);
        self.in_flight
            .lock()
            .touch(client, id, |delivered_at| (now + timeout).min(delivered_at + max))?;
        Ok(())
    }

    /// Requeue every in-flight message whose deadline has passed. Returns
    /// whether anything expired.
    pub fn process_in_flight_queue(&self, now: Instant) -> bool {
        if self.is_exiting() {
            return false;
        }

        let expired = {
            let mut in_flight = self.in_flight.lock();
            let mut expired = Vec::new();
            while let Some(entry) = in_flight.pop_expired(now) {
                expired.push(entry.message);
            }
            if !expired.is_empty() {
                let mut memory = self.memory.lock();
                for msg in expired.iter().rev() {
                    memory.push_front(msg.clone());
                }
            }
            expired.len()
        };

        if expired == 0 {
            return false;
        }
        self.counters
            .timeout_count
            .fetch_add(expired as u64, Ordering::Relaxed);
        debug!(topic = %self.topic_name, channel = %self.name, expired, "requeued timed out messages");
        self.notify.notify_waiters();
        true
    }

    /// Move every due deferred message into the queue. Returns whether
    /// anything was due.
    pub fn process_deferred_queue(&self, now: Instant) -> Result<bool> {
        let _put = self.put_lock.lock();
        if self.is_exiting() {
            return Ok(false);
        }

        let ready = {
            let mut deferred = self.deferred.lock();
            let mut ready = Vec::new();
            while let Some(msg) = deferred.pop_ready(now) {
                ready.push(msg);
            }
            ready
        };
        if ready.is_empty() {
            return Ok(false);
        }

        let mut ready = ready.into_iter();
        while let Some(msg) = ready.next() {
            if let Err(e) = self.put_locked(msg.clone()) {
                let mut deferred = self.deferred.lock();
                for msg in std::iter::once(msg).chain(ready) {
                    let id = msg.id;
                    if let Err(e) = deferred.defer(msg, now) {
                        error!(
                            topic = %self.topic_name,
                            channel = %self.name,
                            id = %id,
                            error = %e,
                            "failed to hold back deferred message"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(true)
    }

    /// One scan-loop visit: expire in-flight messages and release deferred
    /// ones. Returns whether the channel was dirty.
    pub fn process_queues(&self, now: Instant) -> Result<bool> {
        let expired = self.process_in_flight_queue(now);
        let released = self.process_deferred_queue(now)?;
        Ok(expired || released)
    }

    pub(crate) fn count_dropped(&self) {
        self.counters.drop_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop delivery without dropping anything.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!(topic = %self.topic_name, channel = %self.name, "paused channel");
        }
    }

    pub fn unpause(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!(topic = %self.topic_name, channel = %self.name, "unpaused channel");
            self.notify.notify_waiters();
        }
    }

    pub fn add_client(&self, client: &ClientId) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let mut clients = self.clients.write();
        let max = self.opts.max_channel_consumers;
        if max > 0 && clients.len() >= max && !clients.contains_key(client) {
            warn!(topic = %self.topic_name, channel = %self.name, max, "consumer limit reached");
            return Err(Error::ClientLimitExceeded(max));
        }
        clients.insert(client.clone(), ClientInfo { connected_at: Instant::now() });
        debug!(topic = %self.topic_name, channel = %self.name, client = %client.as_str(), "client subscribed");
        Ok(())
    }

    /// Deregister a client. Messages it still holds stay in flight until
    /// they expire.
    pub fn remove_client(&self, client: &ClientId) -> bool {
        let mut clients = self.clients.write();
        let removed = clients.remove(client).is_some();
        if removed && clients.is_empty() {
            *self.idle_since.lock() = Instant::now();
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// No clients for at least `grace`.
    pub(crate) fn is_idle_for(&self, grace: Duration) -> bool {
        let clients = self.clients.read();
        clients.is_empty() && self.idle_since.lock().elapsed() >= grace
    }

    /// Discard everything queued, in flight or deferred.
    pub fn empty(&self) -> Result<()> {
        let _put = self.put_lock.lock();
        {
            let mut in_flight = self.in_flight.lock();
            let mut deferred = self.deferred.lock();
            let mut memory = self.memory.lock();
            in_flight.drain();
            deferred.drain();
            memory.clear();
        }
        self.backend.empty()
    }

    /// Sync the backing store if it has stale unsynced writes.
    pub(crate) fn flush_if_stale(&self) -> Result<bool> {
        self.backend.flush_if_stale()
    }

    /// Stop the channel, writing in-flight, queued and deferred messages to
    /// the backing store so a restart resumes them.
    pub fn close(&self) -> Result<()> {
        self.shutdown(false)
    }

    /// Stop the channel and discard its messages and backing store.
    pub fn delete(&self) -> Result<()> {
        self.shutdown(true)
    }

    fn shutdown(&self, deleted: bool) -> Result<()> {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if deleted {
            info!(topic = %self.topic_name, channel = %self.name, "deleting channel");
        } else {
            info!(topic = %self.topic_name, channel = %self.name, "closing channel");
        }
        self.notify.notify_waiters();

        let _gate = self.delivery_gate.write();
        let _put = self.put_lock.lock();
        self.clients.write().clear();

        let pending = {
            let mut in_flight = self.in_flight.lock();
            let mut deferred = self.deferred.lock();
            let mut memory = self.memory.lock();
            let mut pending = in_flight.drain();
            pending.extend(memory.drain());
            pending.extend(deferred.drain());
            pending
        };

        if deleted {
            return self.backend.delete();
        }

        if !pending.is_empty() {
            if let BackendQueue::Discard = self.backend {
                warn!(
                    topic = %self.topic_name,
                    channel = %self.name,
                    dropped = pending.len(),
                    "ephemeral channel dropped messages on close"
                );
            } else {
                for msg in &pending {
                    self.backend.put(&msg.encode()?)?;
                }
                debug!(topic = %self.topic_name, channel = %self.name, flushed = pending.len(), "flushed channel");
            }
        }
        self.backend.close()
    }

    pub fn stats(&self) -> ChannelStats {
        let (client_count, oldest_client_secs) = {
            let clients = self.clients.read();
            let oldest = clients
                .values()
                .map(|c| c.connected_at.elapsed().as_secs())
                .max()
                .unwrap_or(0);
            (clients.len(), oldest)
        };

        ChannelStats {
            name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            in_flight_count: self.in_flight_count(),
            deferred_count: self.deferred_count(),
            memory_usage: self.memory.lock().usage(),
            message_count: self.counters.message_count.load(Ordering::Relaxed),
            finish_count: self.counters.finish_count.load(Ordering::Relaxed),
            requeue_count: self.counters.requeue_count.load(Ordering::Relaxed),
            timeout_count: self.counters.timeout_count.load(Ordering::Relaxed),
            drop_count: self.counters.drop_count.load(Ordering::Relaxed),
            client_count,
            oldest_client_secs,
            paused: self.is_paused(),
            ephemeral: self.ephemeral,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IdGenerator;
    use tempfile::TempDir;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn options(dir: &TempDir, mem_queue_size: usize) -> Arc<Options> {
        Arc::new(Options {
            data_path: dir.path().to_path_buf(),
            mem_queue_size,
            msg_timeout: Duration::from_millis(50),
            ..Options::default()
        })
    }

    fn messages(n: usize) -> Vec<Message> {
        let ids = IdGenerator::new(0);
        (0..n)
            .map(|i| Message::new(ids.next_id(), format!("m{}", i)))
            .collect()
    }

    fn body(msg: &Message) -> String {
        String::from_utf8(msg.body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_spill_keeps_fifo_order() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 2)).unwrap();

        for msg in messages(5) {
            channel.put_message(msg).unwrap();
        }
        assert_eq!(channel.depth(), 5);

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(body(&channel.recv().await.unwrap()));
        }
        // the ring has room again, but disk is not drained yet
        channel
            .put_message(Message::new(MessageId::from_u64(u64::MAX), "late"))
            .unwrap();
        for _ in 0..3 {
            got.push(body(&channel.recv().await.unwrap()));
        }
        assert_eq!(got, vec!["m0", "m1", "m2", "m3", "m4", "late"]);
        assert_eq!(channel.depth(), 0);
    }

    #[tokio::test]
    async fn test_finish_only_by_owner() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let (owner, other) = (ClientId::new(), ClientId::new());
        channel.put_message(messages(1).remove(0)).unwrap();

        let msg = channel.deliver(&owner, Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg.attempts, 1);
        assert_eq!(channel.in_flight_count(), 1);

        assert!(matches!(channel.finish_message(&other, &msg.id), Err(Error::WrongClient(_))));
        channel.finish_message(&owner, &msg.id).unwrap();
        assert!(matches!(channel.finish_message(&owner, &msg.id), Err(Error::NotInFlight(_))));
        assert!(matches!(
            channel.touch_message(&owner, &msg.id),
            Err(Error::NotInFlight(_))
        ));
        assert_eq!(channel.stats().finish_count, 1);
    }

    #[tokio::test]
    async fn test_start_in_flight_twice_fails() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let client = ClientId::new();
        let msg = messages(1).remove(0);

        channel.start_in_flight(msg.clone(), &client, Duration::ZERO).unwrap();
        assert!(matches!(
            channel.start_in_flight(msg, &client, Duration::ZERO),
            Err(Error::AlreadyInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front_and_counts_attempts() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let client = ClientId::new();
        for msg in messages(2) {
            channel.put_message(msg).unwrap();
        }

        let first = channel.deliver(&client, Duration::from_secs(5)).await.unwrap();
        channel.requeue_message(&client, &first.id, Duration::ZERO).unwrap();
        assert_eq!(channel.in_flight_count(), 0);

        let again = channel.deliver(&client, Duration::from_secs(5)).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
        assert_eq!(channel.stats().requeue_count, 1);
    }

    #[tokio::test]
    async fn test_delayed_requeue_is_not_early() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let client = ClientId::new();
        channel.put_message(messages(1).remove(0)).unwrap();

        let msg = channel.deliver(&client, Duration::from_secs(5)).await.unwrap();
        let requeued_at = Instant::now();
        channel
            .requeue_message(&client, &msg.id, Duration::from_millis(80))
            .unwrap();
        assert_eq!(channel.deferred_count(), 1);
        assert!(channel.process_deferred_queue(Instant::now()).is_ok_and(|dirty| !dirty));

        let again = channel.recv().await.unwrap();
        assert!(requeued_at.elapsed() >= Duration::from_millis(80));
        assert_eq!(again.id, msg.id);
    }

    #[tokio::test]
    async fn test_expired_in_flight_is_requeued_once() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let client = ClientId::new();
        channel.put_message(messages(1).remove(0)).unwrap();

        let msg = channel.deliver(&client, Duration::from_millis(10)).await.unwrap();
        assert!(!channel.process_in_flight_queue(Instant::now()));

        let later = Instant::now() + Duration::from_millis(20);
        assert!(channel.process_in_flight_queue(later));
        assert!(!channel.process_in_flight_queue(later));
        assert!(matches!(channel.finish_message(&client, &msg.id), Err(Error::NotInFlight(_))));

        assert_eq!(channel.depth(), 1);
        assert_eq!(channel.stats().timeout_count, 1);
    }

    #[tokio::test]
    async fn test_touch_extends_deadline() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let client = ClientId::new();
        channel.put_message(messages(1).remove(0)).unwrap();

        let msg = channel.deliver(&client, Duration::from_millis(1)).await.unwrap();
        channel.touch_message(&client, &msg.id).unwrap();
        // msg_timeout is 50ms, so the message survives a 1ms-later scan
        assert!(!channel.process_in_flight_queue(Instant::now() + Duration::from_millis(5)));
        assert!(channel.process_in_flight_queue(Instant::now() + Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_recv_suspends_until_put() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();

        let mut recv = task::spawn(channel.recv());
        assert_pending!(recv.poll());

        channel.put_message(messages(1).remove(0)).unwrap();
        assert!(recv.is_woken());
        let msg = assert_ready_ok!(recv.poll());
        assert_eq!(body(&msg), "m0");
    }

    #[tokio::test]
    async fn test_pause_holds_delivery() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        channel.put_message(messages(1).remove(0)).unwrap();
        channel.pause();

        let mut recv = task::spawn(channel.recv());
        assert_pending!(recv.poll());
        assert_eq!(channel.depth(), 1);

        channel.unpause();
        assert!(recv.is_woken());
        assert_ready_ok!(recv.poll());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();

        let mut recv = task::spawn(channel.recv());
        assert_pending!(recv.poll());
        channel.close().unwrap();
        assert!(recv.is_woken());
        assert!(matches!(recv.poll(), std::task::Poll::Ready(Err(Error::Exiting))));
        assert!(matches!(channel.put_message(messages(1).remove(0)), Err(Error::Exiting)));
    }

    #[tokio::test]
    async fn test_close_persists_in_flight_and_queued() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir, 10);
        let client = ClientId::new();
        {
            let channel = Channel::new("t", "c", opts.clone()).unwrap();
            for msg in messages(3) {
                channel.put_message(msg).unwrap();
            }
            let first = channel.deliver(&client, Duration::from_secs(5)).await.unwrap();
            assert_eq!(body(&first), "m0");
            channel.close().unwrap();
        }

        let channel = Channel::new("t", "c", opts).unwrap();
        assert_eq!(channel.depth(), 3);
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(body(&channel.recv().await.unwrap()));
        }
        assert_eq!(got, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_close_mid_delivery_keeps_message() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir, 10);
        let client = ClientId::new();
        let channel = Arc::new(Channel::new("t", "c", opts.clone()).unwrap());
        channel.put_message(messages(1).remove(0)).unwrap();

        // a deliverer holds the gate and has already seen the channel open
        let gate = channel.delivery_gate.read();
        let closer = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.close())
        };
        while !channel.is_exiting() {
            std::thread::yield_now();
        }
        let msg = channel.next_message().unwrap().unwrap();
        let delivered = channel.track_in_flight(msg, &client, Duration::ZERO).unwrap();
        drop(gate);
        closer.join().unwrap().unwrap();
        assert_eq!(delivered.attempts, 1);
        drop(channel);

        let channel = Channel::new("t", "c", opts).unwrap();
        assert_eq!(channel.depth(), 1);
    }

    #[tokio::test]
    async fn test_failed_delayed_requeue_stays_in_flight() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 10)).unwrap();
        let client = ClientId::new();
        channel.put_message(messages(1).remove(0)).unwrap();

        let msg = channel.deliver(&client, Duration::from_secs(5)).await.unwrap();
        channel
            .deferred
            .lock()
            .defer(msg.clone(), Instant::now() + Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            channel.requeue_message(&client, &msg.id, Duration::from_secs(1)),
            Err(Error::AlreadyInFlight(_))
        ));
        assert_eq!(channel.in_flight_count(), 1);
        channel.finish_message(&client, &msg.id).unwrap();
    }

    #[tokio::test]
    async fn test_delete_discards_backing_store() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir, 1);
        {
            let channel = Channel::new("t", "c", opts.clone()).unwrap();
            for msg in messages(4) {
                channel.put_message(msg).unwrap();
            }
            channel.delete().unwrap();
        }
        let channel = Channel::new("t", "c", opts).unwrap();
        assert_eq!(channel.depth(), 0);
    }

    #[tokio::test]
    async fn test_ephemeral_overflow_is_queue_full() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c#ephemeral", options(&dir, 1)).unwrap();
        assert!(channel.is_ephemeral());

        let mut batch = messages(2).into_iter();
        channel.put_message(batch.next().unwrap()).unwrap();
        assert!(matches!(
            channel.put_message(batch.next().unwrap()),
            Err(Error::QueueFull(_))
        ));
    }

    #[test]
    fn test_consumer_limit() {
        let dir = TempDir::new().unwrap();
        let opts = Arc::new(Options {
            data_path: dir.path().to_path_buf(),
            max_channel_consumers: 1,
            ..Options::default()
        });
        let channel = Channel::new("t", "c", opts).unwrap();
        let (a, b) = (ClientId::new(), ClientId::new());

        channel.add_client(&a).unwrap();
        channel.add_client(&a).unwrap();
        assert!(matches!(channel.add_client(&b), Err(Error::ClientLimitExceeded(1))));
        assert!(channel.remove_client(&a));
        assert!(!channel.remove_client(&a));
        channel.add_client(&b).unwrap();
        assert_eq!(channel.client_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_clears_everything() {
        let dir = TempDir::new().unwrap();
        let channel = Channel::new("t", "c", options(&dir, 1)).unwrap();
        let client = ClientId::new();
        for msg in messages(3) {
            channel.put_message(msg).unwrap();
        }
        channel.deliver(&client, Duration::from_secs(5)).await.unwrap();

        channel.empty().unwrap();
        assert_eq!(channel.depth(), 0);
        assert_eq!(channel.in_flight_count(), 0);
    }
}
