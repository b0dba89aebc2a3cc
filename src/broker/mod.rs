//! The broker: topic registry and process lifecycle.
//!
//! One [`Broker`] exists per daemon. It creates topics on first reference,
//! keeps the metadata snapshot on disk in step with the registry, runs the
//! queue scan loop and the maintenance task, and owns the shutdown sequence.

pub mod metadata;
pub(crate) mod ring_buffer;
mod scanner;

use crate::channel::Channel;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::message::IdGenerator;
use crate::server::{self, ConnectionHandler, Listener};
use crate::topic::{ChangeHook, Topic, TopicStats};
use crate::is_valid_name;
use metadata::{ChannelMetadata, Metadata, TopicMetadata};
use parking_lot::{Mutex, RwLock};
use scanner::QueueScanner;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Statistics about the broker's operation
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub version: String,
    pub uptime_secs: u64,
    /// Number of topics, ephemeral ones included
    pub topic_count: usize,
    /// Number of channels across every topic
    pub channel_count: usize,
    /// Number of clients subscribed across every channel
    pub client_count: usize,
    pub topics: Vec<TopicStats>,
}

/// The broker owns every topic and the daemon's background work
pub struct Broker {
    opts: Arc<Options>,
    ids: Arc<IdGenerator>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,

    metadata_lock: Mutex<()>,
    loading: AtomicBool,

    started_at: Instant,
    local_addr: Mutex<Option<SocketAddr>>,
    scanner: Mutex<Option<QueueScanner>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    exiting: AtomicBool,
    shutdown: CancellationToken,
    exited: CancellationToken,
    this: Weak<Broker>,
}

impl Broker {
    /// Create a new broker instance
    pub fn new(opts: Options) -> Result<Arc<Self>> {
        opts.validate()?;
        fs::create_dir_all(&opts.data_path)?;
        info!(data_path = %opts.data_path.display(), node_id = opts.node_id, "creating broker");

        let ids = Arc::new(IdGenerator::new(opts.node_id));
        Ok(Arc::new_cyclic(|this| Self {
            opts: Arc::new(opts),
            ids,
            topics: RwLock::new(HashMap::new()),
            metadata_lock: Mutex::new(()),
            loading: AtomicBool::new(false),
            started_at: Instant::now(),
            local_addr: Mutex::new(None),
            scanner: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            exiting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            exited: CancellationToken::new(),
            this: this.clone(),
        }))
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Cancelled as soon as shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Address the acceptor is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn change_hook(&self) -> ChangeHook {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(broker) = this.upgrade() {
                broker.metadata_changed();
            }
        })
    }

    fn metadata_changed(&self) {
        if self.loading.load(Ordering::Acquire) || self.is_exiting() {
            return;
        }
        if let Err(e) = self.persist_metadata() {
            error!(error = %e, "failed to persist metadata");
        }
    }

    /// Look up a topic, creating it on first reference.
    pub fn get_topic(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(topic.clone());
        }
        if self.is_exiting() {
            return Err(Error::Exiting);
        }

        let topic = {
            let mut topics = self.topics.write();
            if let Some(topic) = topics.get(name) {
                return Ok(topic.clone());
            }
            let topic = Arc::new(Topic::with_hook(
                name,
                self.opts.clone(),
                self.ids.clone(),
                Some(self.change_hook()),
            )?);
            topics.insert(name.to_string(), topic.clone());
            topic
        };

        self.metadata_changed();
        Ok(topic)
    }

    /// Look up a topic without creating it.
    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    pub fn existing_topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topic(name)
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))
    }

    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// Remove a topic with all of its channels and messages.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let topic = self
            .topics
            .write()
            .remove(name)
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))?;
        let deleted = topic.delete();
        self.metadata_changed();
        deleted
    }

    fn channels(&self) -> Vec<Arc<Channel>> {
        self.topics()
            .iter()
            .flat_map(|topic| topic.channels())
            .collect()
    }

    /// Every topic and channel, sorted by name, ephemeral ones included.
    pub fn snapshot(&self) -> Metadata {
        let mut topics: Vec<TopicMetadata> = self
            .topics()
            .iter()
            .map(|topic| {
                let mut channels: Vec<ChannelMetadata> = topic
                    .channels()
                    .iter()
                    .map(|channel| ChannelMetadata {
                        name: channel.name().to_string(),
                        paused: channel.is_paused(),
                        ephemeral: channel.is_ephemeral(),
                    })
                    .collect();
                channels.sort_by(|a, b| a.name.cmp(&b.name));
                TopicMetadata {
                    name: topic.name().to_string(),
                    paused: topic.is_paused(),
                    ephemeral: topic.is_ephemeral(),
                    channels,
                }
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        Metadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            topics,
        }
    }

    /// Write the durable part of the snapshot to the data directory.
    pub fn persist_metadata(&self) -> Result<()> {
        let _guard = self.metadata_lock.lock();
        let path = metadata::metadata_path(&self.opts.data_path);
        let snapshot = self.snapshot().durable();
        debug!(path = %path.display(), topics = snapshot.topics.len(), "persisting metadata");
        metadata::persist(&path, &snapshot)
    }

    /// Recreate the topics and channels recorded in the data directory.
    pub fn load_metadata(&self) -> Result<()> {
        self.loading.store(true, Ordering::Release);
        let loaded = self.load_metadata_inner();
        self.loading.store(false, Ordering::Release);
        loaded
    }

    fn load_metadata_inner(&self) -> Result<()> {
        let path = metadata::metadata_path(&self.opts.data_path);
        let snapshot = metadata::load(&path)?;
        info!(path = %path.display(), topics = snapshot.topics.len(), "loading metadata");

        for entry in snapshot.topics {
            if !is_valid_name(&entry.name) {
                warn!(topic = %entry.name, "skipping topic with invalid name");
                continue;
            }
            let topic = self.get_topic(&entry.name)?;
            if entry.paused {
                topic.pause();
            }
            for channel_entry in entry.channels {
                if !is_valid_name(&channel_entry.name) {
                    warn!(topic = %entry.name, channel = %channel_entry.name, "skipping channel with invalid name");
                    continue;
                }
                let channel = topic.get_channel(&channel_entry.name)?;
                if channel_entry.paused {
                    channel.pause();
                }
            }
        }
        Ok(())
    }

    /// Start the queue scan loop, the maintenance task and the acceptor.
    ///
    /// Must be called from within a tokio runtime. A fatal accept error
    /// triggers [`Broker::exit`].
    pub fn start<L, H>(&self, listener: L, handler: Arc<H>) -> Result<()>
    where
        L: Listener,
        H: ConnectionHandler<L::Conn>,
    {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        *self.local_addr.lock() = listener.local_addr().ok();

        let this = self.this.clone();
        let scanner = QueueScanner::start(
            &self.opts,
            Arc::new(move || {
                this.upgrade()
                    .map(|broker| broker.channels())
                    .unwrap_or_default()
            }),
        )?;
        *self.scanner.lock() = Some(scanner);

        let this = self.this.clone();
        let shutdown = self.shutdown.clone();
        let serving = tokio::spawn(async move {
            if let Err(e) = server::serve(listener, handler, shutdown).await {
                error!(error = %e, "acceptor failed");
                if let Some(broker) = this.upgrade() {
                    tokio::spawn(async move { broker.exit().await });
                }
            }
        });

        let maintenance = tokio::spawn(maintenance_loop(
            self.this.clone(),
            self.opts.queue_scan_refresh_interval,
            self.opts.sync_timeout,
            self.shutdown.clone(),
        ));

        self.tasks.lock().extend([serving, maintenance]);
        info!(addr = ?self.local_addr(), "broker started");
        Ok(())
    }

    /// Shut the daemon down.
    ///
    /// Safe to call any number of times from anywhere. The first call runs
    /// the shutdown sequence and every other call waits for it to finish.
    pub async fn exit(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            self.exited.cancelled().await;
            return;
        }
        info!("broker exiting");
        self.shutdown.cancel();

        if let Err(e) = self.persist_metadata() {
            error!(error = %e, "failed to persist metadata");
        }

        let topics = self.topics();
        let closed = tokio::task::spawn_blocking(move || {
            for topic in topics {
                if let Err(e) = topic.close() {
                    error!(topic = %topic.name(), error = %e, "failed to close topic");
                }
            }
        });
        if closed.await.is_err() {
            error!("failed to close topics");
        }

        let scanner = self.scanner.lock().take();
        if let Some(scanner) = scanner {
            if tokio::task::spawn_blocking(move || scanner.stop()).await.is_err() {
                error!("failed to stop queue scan loop");
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        info!("broker exited");
        self.exited.cancel();
    }

    /// Wait until a shutdown sequence has completed.
    pub async fn wait_exited(&self) {
        self.exited.cancelled().await;
    }

    /// Remove ephemeral channels that have had no clients, and ephemeral
    /// topics that have had no channels and no messages, for at least
    /// `grace`. Returns how many were removed.
    pub fn sweep_ephemeral(&self, grace: Duration) -> usize {
        let mut removed = 0;
        for topic in self.topics() {
            for channel in topic.channels() {
                if channel.is_ephemeral() && channel.is_idle_for(grace) {
                    match topic.delete_channel(channel.name()) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            warn!(topic = %topic.name(), channel = %channel.name(), error = %e, "failed to remove ephemeral channel")
                        }
                    }
                }
            }

            if topic.is_idle_for(grace) {
                let taken = {
                    let mut topics = self.topics.write();
                    match topics.get(topic.name()) {
                        Some(current) if Arc::ptr_eq(current, &topic) => topics.remove(topic.name()),
                        _ => None,
                    }
                };
                if let Some(topic) = taken {
                    info!(topic = %topic.name(), "removing idle ephemeral topic");
                    if let Err(e) = topic.delete() {
                        warn!(topic = %topic.name(), error = %e, "failed to remove ephemeral topic");
                    }
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.metadata_changed();
        }
        removed
    }

    /// Sync every backing store with stale unsynced writes.
    fn flush_stale(&self) {
        for topic in self.topics() {
            if let Err(e) = topic.flush_if_stale() {
                error!(topic = %topic.name(), error = %e, "failed to sync backing store");
            }
        }
    }

    /// Get broker statistics
    pub fn stats(&self) -> BrokerStats {
        let mut topics: Vec<TopicStats> = self.topics().iter().map(|t| t.stats()).collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        let channel_count = topics.iter().map(|t| t.channels.len()).sum();
        let client_count = topics
            .iter()
            .flat_map(|t| t.channels.iter())
            .map(|c| c.client_count)
            .sum();

        BrokerStats {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            topic_count: topics.len(),
            channel_count,
            client_count,
            topics,
        }
    }
}

async fn maintenance_loop(
    broker: Weak<Broker>,
    refresh_interval: Duration,
    sync_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut sweep = tokio::time::interval(refresh_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sync = tokio::time::interval(sync_timeout);
    sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sweep.tick() => {
                let Some(broker) = broker.upgrade() else { break };
                let removed = broker.sweep_ephemeral(refresh_interval);
                if removed > 0 {
                    debug!(removed, "swept ephemeral topics and channels");
                }
            }
            _ = sync.tick() => {
                let Some(broker) = broker.upgrade() else { break };
                if tokio::task::spawn_blocking(move || broker.flush_stale()).await.is_err() {
                    error!("backing store sync task failed");
                }
            }
        }
    }
    debug!("maintenance loop stopped");
}
