//! Environment-driven configuration surface.
//!
//! This module only defines the typed configuration values and their
//! defaults. Parsing a config file or CLI arguments into these structs is
//! the job of a hosting executable, out of scope for this crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Socket-level tuning knobs, shared by participants and the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Accept connections on an OS local-domain (Unix) socket, in addition
    /// to TCP.
    pub enable_domain_sockets: bool,
    /// Set `TCP_NODELAY` on every accepted/dialed TCP stream.
    pub tcp_no_delay: bool,
    /// Set `TCP_QUICKACK` where supported (Linux hint only; ignored
    /// elsewhere).
    pub tcp_quick_ack: bool,
    /// `SO_RCVBUF` override in bytes. `0` keeps the OS default.
    pub tcp_receive_buffer_size: usize,
    /// `SO_SNDBUF` override in bytes. `0` keeps the OS default.
    pub tcp_send_buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            enable_domain_sockets: true,
            tcp_no_delay: true,
            tcp_quick_ack: false,
            tcp_receive_buffer_size: 0,
            tcp_send_buffer_size: 0,
        }
    }
}

/// Message aggregation tuning, see wire §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationOptions {
    pub enable_message_aggregation: bool,
    /// Soft threshold, in bytes, above which the aggregation buffer is
    /// flushed immediately.
    pub aggregation_buffer_threshold: usize,
    /// Maximum delay before an aggregation buffer with pending bytes is
    /// flushed, started on first append.
    pub flush_timeout: Duration,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        AggregationOptions {
            enable_message_aggregation: true,
            aggregation_buffer_threshold: 100 * 1024,
            flush_timeout: Duration::from_millis(50),
        }
    }
}

/// Timeouts governing handshake and connect retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOptions {
    /// Number of times the registry dial is retried before giving up.
    pub connect_attempts: usize,
    /// Spacing between registry dial retries.
    pub registry_retry_interval: Duration,
    /// Per-URI timeout for a direct connect attempt.
    pub direct_connect_timeout: Duration,
    /// Timeout while waiting for a remote-connect fallback to complete.
    pub remote_connect_timeout: Duration,
    /// Fixed budget to receive `KnownParticipants` after announcing to the
    /// registry. Exceeding it is fatal.
    pub known_participants_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        TimeoutOptions {
            connect_attempts: 10,
            registry_retry_interval: Duration::from_millis(100),
            direct_connect_timeout: Duration::from_secs(2),
            remote_connect_timeout: Duration::from_secs(5),
            known_participants_timeout: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration for a participant process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Number of OS threads backing the IO executor.
    pub async_threads: usize,
    pub socket: SocketOptions,
    pub aggregation: AggregationOptions,
    pub timeouts: TimeoutOptions,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        ParticipantConfig {
            async_threads: 1,
            socket: SocketOptions::default(),
            aggregation: AggregationOptions::default(),
            timeouts: TimeoutOptions::default(),
        }
    }
}

/// Top-level configuration for a registry process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub async_threads: usize,
    pub socket: SocketOptions,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            async_threads: 1,
            socket: SocketOptions::default(),
        }
    }
}
