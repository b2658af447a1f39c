//! Transport configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VmciError};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmciConfig {
    /// Queue pair limits.
    #[serde(default)]
    pub queue_pair: QueuePairConfig,

    /// Doorbell index table settings.
    #[serde(default)]
    pub doorbell: DoorbellConfig,

    /// Datagram limits.
    #[serde(default)]
    pub datagram: DatagramConfig,

    /// Page channel flow control.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Deferred callback worker.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Queue pair configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePairConfig {
    /// Upper bound for produce + consume queue sizes, in bytes.
    #[serde(default = "default_max_qp_memory")]
    pub max_memory: u64,

    /// Whether queue pairs sleep on unmapped memory unless told otherwise.
    #[serde(default = "default_true")]
    pub blocking: bool,
}

impl Default for QueuePairConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_qp_memory(),
            blocking: true,
        }
    }
}

/// Doorbell configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorbellConfig {
    /// Notification bitmap size in bytes (one index per byte).
    #[serde(default = "default_bitmap_size")]
    pub bitmap_size: u32,

    /// Number of hash buckets in the index table.
    #[serde(default = "default_table_size")]
    pub table_size: u32,
}

impl Default for DoorbellConfig {
    fn default() -> Self {
        Self {
            bitmap_size: default_bitmap_size(),
            table_size: default_table_size(),
        }
    }
}

/// Datagram configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramConfig {
    /// Largest payload a single datagram may carry.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
        }
    }
}

/// Page channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Receive buffers posted at connect time, also the growth step.
    #[serde(default = "default_recv_buffers")]
    pub default_recv_buffers: u32,

    /// Ceiling for the receive buffer target.
    #[serde(default = "default_max_recv_buffers")]
    pub max_recv_buffers: u32,

    /// Slack absorbing buffers in flight between the peers.
    #[serde(default = "default_recv_threshold")]
    pub recv_threshold: u32,

    /// Scatter/gather elements per control packet.
    #[serde(default = "default_max_elems")]
    pub max_elems_per_packet: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_recv_buffers: default_recv_buffers(),
            max_recv_buffers: default_max_recv_buffers(),
            recv_threshold: default_recv_threshold(),
            max_elems_per_packet: default_max_elems(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name of the deferred callback thread.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
        }
    }
}

impl VmciConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VmciError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.queue_pair.max_memory == 0 {
            return Err(VmciError::Config("queue_pair.max_memory must be non-zero".into()));
        }
        if self.doorbell.bitmap_size == 0 || self.doorbell.table_size == 0 {
            return Err(VmciError::Config("doorbell sizes must be non-zero".into()));
        }
        if self.channel.default_recv_buffers > self.channel.max_recv_buffers {
            return Err(VmciError::Config(
                "channel.default_recv_buffers exceeds channel.max_recv_buffers".into(),
            ));
        }
        if self.channel.max_elems_per_packet == 0 {
            return Err(VmciError::Config("channel.max_elems_per_packet must be non-zero".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_qp_memory() -> u64 {
    128 * 1024 * 1024
}

fn default_bitmap_size() -> u32 {
    4096
}

fn default_table_size() -> u32 {
    64
}

fn default_max_payload() -> usize {
    // 68 KiB datagram minus its 24 byte header
    69_632 - 24
}

fn default_recv_buffers() -> u32 {
    32
}

fn default_max_recv_buffers() -> u32 {
    128
}

fn default_recv_threshold() -> u32 {
    16
}

fn default_max_elems() -> u32 {
    128
}

fn default_thread_name() -> String {
    "vmci-work".to_string()
}
