// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Agent configuration.
//
// Stored as JSON.  Every section and field has a default, so a partial file
// only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::TenantId;

/// Zebra Technologies.
pub const VENDOR_ZEBRA: u16 = 0x0A5F;
/// XPrinter.
pub const VENDOR_XPRINTER: u16 = 0x2D37;

/// Persistent agent settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub queue: QueueConfig,
    pub usb: UsbConfig,
    pub stream: StreamConfig,
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of printer queues alive at once.
    pub max_queues: usize,
    /// Capacity of each printer queue.
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queues: 20,
            max_queue_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Interface claimed on every printer.
    pub interface: u8,
    /// Bulk OUT endpoint address.
    pub out_endpoint: u8,
    pub write_timeout_ms: u64,
    /// Vendors listed as printers even when the device class says otherwise.
    pub known_vendors: Vec<u16>,
}

impl UsbConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            interface: 0,
            out_endpoint: 0x01,
            write_timeout_ms: 5_000,
            known_vendors: vec![VENDOR_ZEBRA, VENDOR_XPRINTER],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// WebSocket URL of the STOMP broker.  Empty means the stream is disabled.
    pub server_url: String,
    /// Topic prefix; the tenant id is appended as the last path segment.
    pub topic: String,
    pub reconnect_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Tenant bound automatically at startup.
    pub auto_connect_tenant: Option<TenantId>,
}

impl StreamConfig {
    pub fn is_configured(&self) -> bool {
        !self.server_url.trim().is_empty()
    }

    pub fn topic_for(&self, tenant: TenantId) -> String {
        format!("{}/{}", self.topic.trim_end_matches('/'), tenant)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            topic: "/topic/print".into(),
            reconnect_interval_ms: 5_000,
            handshake_timeout_ms: 5_000,
            auto_connect_tenant: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Endpoint returning `{"printJobs": [...]}`.  `None` disables polling.
    pub backend_url: Option<String>,
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
    pub auto_start: bool,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            interval_ms: 500,
            request_timeout_ms: 200,
            auto_start: false,
        }
    }
}

impl AgentConfig {
    /// Read a config file.  A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_queues == 0 || self.queue.max_queue_size == 0 {
            return Err(BridgeError::Config(
                "queue.max_queues and queue.max_queue_size must be positive".into(),
            ));
        }
        if self.stream.reconnect_interval_ms == 0 {
            return Err(BridgeError::Config(
                "stream.reconnect_interval_ms must be positive".into(),
            ));
        }
        if let Some(tenant) = self.stream.auto_connect_tenant {
            if !tenant.is_valid() {
                return Err(BridgeError::InvalidTenant(tenant));
            }
        }
        Ok(())
    }
}
