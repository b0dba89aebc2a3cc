//! The queue scan loop.
//!
//! Every `queue_scan_interval` a random sample of channels is handed to a
//! small worker pool, which expires in-flight messages and releases due
//! deferred ones. If more than `queue_scan_dirty_percent` of the sample had
//! work, the next pass starts right away instead of waiting for the tick.
//! The channel list and the pool size are refreshed every
//! `queue_scan_refresh_interval`.
//!
//! Processing a channel can block on disk, so the loop and its workers are
//! plain threads talking over crossbeam channels.

use crate::channel::Channel;
use crate::config::Options;
use crate::error::{Error, Result};
use crossbeam::channel::{bounded, select, tick, unbounded, Receiver, Sender};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Produces the current set of channels to scan.
pub(crate) type ChannelSource = Arc<dyn Fn() -> Vec<Arc<Channel>> + Send + Sync>;

#[derive(Debug, Clone)]
struct ScanSettings {
    interval: Duration,
    refresh_interval: Duration,
    selection_count: usize,
    worker_pool_max: usize,
    dirty_percent: f64,
}

impl ScanSettings {
    fn from_options(opts: &Options) -> Self {
        Self {
            interval: opts.queue_scan_interval,
            refresh_interval: opts.queue_scan_refresh_interval,
            selection_count: opts.queue_scan_selection_count,
            worker_pool_max: opts.queue_scan_worker_pool_max,
            dirty_percent: opts.queue_scan_dirty_percent,
        }
    }
}

/// Handle to a running scan loop.
pub struct QueueScanner {
    close_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl QueueScanner {
    pub(crate) fn start(opts: &Options, source: ChannelSource) -> Result<Self> {
        let settings = ScanSettings::from_options(opts);
        let (close_tx, close_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("queue-scan".into())
            .spawn(move || scan_loop(settings, source, close_rx))
            .map_err(Error::Io)?;
        Ok(Self { close_tx, handle })
    }

    /// Stop the loop and wait for it and its workers to exit.
    pub(crate) fn stop(self) {
        let _ = self.close_tx.send(());
        if self.handle.join().is_err() {
            error!("queue scan loop panicked");
        }
    }
}

/// Workers to run for `num_channels`: a quarter of the channels, at least
/// one, at most `max`.
pub(crate) fn pool_size(num_channels: usize, max: usize) -> usize {
    (num_channels / 4).clamp(1, max.max(1))
}

pub(crate) fn should_rescan(dirty: usize, sampled: usize, dirty_percent: f64) -> bool {
    sampled > 0 && dirty as f64 / sampled as f64 > dirty_percent
}

fn sample(channels: &[Arc<Channel>], count: usize) -> Vec<Arc<Channel>> {
    if channels.len() <= count {
        return channels.to_vec();
    }
    channels
        .choose_multiple(&mut rand::thread_rng(), count)
        .cloned()
        .collect()
}

struct WorkerPool {
    work_rx: Receiver<Arc<Channel>>,
    resp_tx: Sender<bool>,
    exit_tx: Sender<()>,
    exit_rx: Receiver<()>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    fn resize(&mut self, ideal: usize) {
        self.workers.retain(|h| !h.is_finished());
        // workers that panicked are gone without being asked to exit
        self.size = self.size.min(self.workers.len());
        if ideal == self.size {
            return;
        }
        info!(from = self.size, to = ideal, "resizing queue scan worker pool");
        while self.size > ideal {
            if self.exit_tx.send(()).is_err() {
                break;
            }
            self.size -= 1;
        }
        while self.size < ideal {
            let work_rx = self.work_rx.clone();
            let resp_tx = self.resp_tx.clone();
            let exit_rx = self.exit_rx.clone();
            match thread::Builder::new()
                .name("queue-scan-worker".into())
                .spawn(move || scan_worker(work_rx, resp_tx, exit_rx))
            {
                Ok(handle) => {
                    self.workers.push(handle);
                    self.size += 1;
                }
                Err(e) => {
                    error!(error = %e, "failed to spawn queue scan worker");
                    break;
                }
            }
        }
    }

    fn join(self) {
        let WorkerPool { workers, .. } = self;
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn scan_worker(work_rx: Receiver<Arc<Channel>>, resp_tx: Sender<bool>, exit_rx: Receiver<()>) {
    loop {
        select! {
            recv(work_rx) -> channel => {
                let channel = match channel {
                    Ok(channel) => channel,
                    Err(_) => return,
                };
                let dirty = match channel.process_queues(Instant::now()) {
                    Ok(dirty) => dirty,
                    Err(e) => {
                        error!(
                            topic = %channel.topic_name(),
                            channel = %channel.name(),
                            error = %e,
                            "failed to process channel queues"
                        );
                        false
                    }
                };
                if resp_tx.send(dirty).is_err() {
                    return;
                }
            }
            recv(exit_rx) -> _ => return,
        }
    }
}

fn scan_loop(settings: ScanSettings, source: ChannelSource, close_rx: Receiver<()>) {
    let (work_tx, work_rx) = bounded(settings.selection_count.max(1));
    let (resp_tx, resp_rx) = bounded(settings.selection_count.max(1));
    let (exit_tx, exit_rx) = unbounded();
    let mut pool = WorkerPool {
        work_rx,
        resp_tx,
        exit_tx,
        exit_rx,
        workers: Vec::new(),
        size: 0,
    };

    let ticker = tick(settings.interval);
    let refresh = tick(settings.refresh_interval);
    let mut channels = source();
    pool.resize(pool_size(channels.len(), settings.worker_pool_max));

    'scan: loop {
        select! {
            recv(ticker) -> _ => {
                if channels.is_empty() {
                    continue;
                }
                if pool.size == 0 {
                    pool.resize(pool_size(channels.len(), settings.worker_pool_max));
                    if pool.size == 0 {
                        continue;
                    }
                }
            }
            recv(refresh) -> _ => {
                channels = source();
                pool.resize(pool_size(channels.len(), settings.worker_pool_max));
                continue;
            }
            recv(close_rx) -> _ => break,
        }

        loop {
            let picked = sample(&channels, settings.selection_count);
            let mut sent = 0;
            for channel in picked {
                select! {
                    send(work_tx, channel) -> res => {
                        if res.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                    recv(close_rx) -> _ => break 'scan,
                }
            }

            let mut dirty = 0;
            for _ in 0..sent {
                select! {
                    recv(resp_rx) -> res => {
                        if let Ok(true) = res {
                            dirty += 1;
                        }
                    }
                    recv(close_rx) -> _ => break 'scan,
                }
            }

            if !should_rescan(dirty, sent, settings.dirty_percent) {
                break;
            }
            debug!(dirty, sampled = sent, "dirty channels over threshold, rescanning");
        }
    }

    drop(work_tx);
    pool.join();
    debug!("queue scan loop stopped");
}
