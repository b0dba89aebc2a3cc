use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Highest node id that still fits in a message id.
pub const MAX_NODE_ID: u64 = 1023;

/// Configuration for the daemon and every queue it owns.
///
/// Built once, checked with [`Options::validate`], then shared by reference
/// with every topic, channel and background loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Node identifier mixed into generated message ids
    pub node_id: u64,
    /// Directory for segment files and the metadata snapshot
    pub data_path: PathBuf,
    /// Address the TCP acceptor binds to
    pub tcp_address: String,

    /// Number of messages each topic/channel keeps in memory before spilling
    pub mem_queue_size: usize,
    /// Segment file size at which the backing store rolls to a new file
    pub max_bytes_per_file: u64,
    /// Number of backing store operations between fsyncs
    pub sync_every: u64,
    /// Longest time a backing store write may stay unsynced
    pub sync_timeout: Duration,

    /// How often the scan loop samples channels
    pub queue_scan_interval: Duration,
    /// How often the scan loop refreshes its channel set and pool size
    pub queue_scan_refresh_interval: Duration,
    /// Number of channels sampled per scan pass
    pub queue_scan_selection_count: usize,
    /// Upper bound on scan workers
    pub queue_scan_worker_pool_max: usize,
    /// Dirty fraction above which a scan pass repeats immediately
    pub queue_scan_dirty_percent: f64,

    /// Default in-flight timeout
    pub msg_timeout: Duration,
    /// Upper bound on any in-flight timeout
    pub max_msg_timeout: Duration,
    /// Largest accepted single payload
    pub max_msg_size: usize,
    /// Largest accepted batch, summed over payloads
    pub max_body_size: usize,
    /// Upper bound on requeue and deferred-publish delays
    pub max_req_timeout: Duration,
    /// Consumers allowed per channel, 0 for unlimited
    pub max_channel_consumers: usize,

    pub tls_required: bool,
    pub deflate_enabled: bool,
    pub max_deflate_level: u32,
    pub snappy_enabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_path: PathBuf::from("."),
            tcp_address: "0.0.0.0:4150".to_string(),

            mem_queue_size: 10_000,
            max_bytes_per_file: 100 * 1024 * 1024, // 100MB
            sync_every: 2500,
            sync_timeout: Duration::from_secs(2),

            queue_scan_interval: Duration::from_millis(100),
            queue_scan_refresh_interval: Duration::from_secs(5),
            queue_scan_selection_count: 20,
            queue_scan_worker_pool_max: 4,
            queue_scan_dirty_percent: 0.25,

            msg_timeout: Duration::from_secs(60),
            max_msg_timeout: Duration::from_secs(15 * 60),
            max_msg_size: 1024 * 1024,  // 1MB
            max_body_size: 5 * 1024 * 1024, // 5MB
            max_req_timeout: Duration::from_secs(60 * 60),
            max_channel_consumers: 0,

            tls_required: false,
            deflate_enabled: true,
            max_deflate_level: 6,
            snappy_enabled: true,
        }
    }
}

impl Options {
    /// Reject option combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id > MAX_NODE_ID {
            return Err(invalid(format!(
                "node_id {} must be at most {}",
                self.node_id, MAX_NODE_ID
            )));
        }
        self.tcp_address
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("tcp_address {:?}: {}", self.tcp_address, e)))?;

        if self.max_bytes_per_file == 0 {
            return Err(invalid("max_bytes_per_file cannot be zero"));
        }
        if self.sync_every == 0 {
            return Err(invalid("sync_every cannot be zero"));
        }
        for (name, value) in [
            ("sync_timeout", self.sync_timeout),
            ("queue_scan_interval", self.queue_scan_interval),
            ("queue_scan_refresh_interval", self.queue_scan_refresh_interval),
            ("msg_timeout", self.msg_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{} cannot be zero", name)));
            }
        }

        if self.queue_scan_selection_count == 0 {
            return Err(invalid("queue_scan_selection_count cannot be zero"));
        }
        if self.queue_scan_worker_pool_max == 0 {
            return Err(invalid("queue_scan_worker_pool_max cannot be zero"));
        }
        if !(0.0..=1.0).contains(&self.queue_scan_dirty_percent) {
            return Err(invalid(format!(
                "queue_scan_dirty_percent {} must be within [0, 1]",
                self.queue_scan_dirty_percent
            )));
        }

        if self.msg_timeout > self.max_msg_timeout {
            return Err(invalid(format!(
                "msg_timeout {:?} exceeds max_msg_timeout {:?}",
                self.msg_timeout, self.max_msg_timeout
            )));
        }
        if self.max_msg_size == 0 {
            return Err(invalid("max_msg_size cannot be zero"));
        }
        if self.max_body_size < self.max_msg_size {
            return Err(invalid(format!(
                "max_body_size {} is smaller than max_msg_size {}",
                self.max_body_size, self.max_msg_size
            )));
        }
        if !(1..=9).contains(&self.max_deflate_level) {
            return Err(invalid(format!(
                "max_deflate_level {} must be within [1, 9]",
                self.max_deflate_level
            )));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}
