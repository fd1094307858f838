// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the LabelBridge agent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Caller-assigned identifier of a logical printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrinterId(pub i32);

impl std::fmt::Display for PrinterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant (warehouse) whose jobs are carried by the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    /// Only strictly positive ids name a tenant.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Print jobs
// ---------------------------------------------------------------------------

/// A unit of printable work addressed to one printer.
///
/// On the wire the payload is a UTF-8 string (ZPL or ESC/POS text); the
/// older field names `id`, `orderId` and `command` are accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJob {
    #[serde(alias = "id")]
    pub target_printer_id: PrinterId,
    #[serde(alias = "orderId")]
    pub job_id: String,
    #[serde(alias = "command", with = "payload_text")]
    pub payload: Vec<u8>,
}

impl PrintJob {
    pub fn new(target_printer_id: PrinterId, job_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target_printer_id,
            job_id: job_id.into(),
            payload: payload.into(),
        }
    }

    /// Decode one JSON document into a job without validating it.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reject jobs that could never print.
    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(BridgeError::InvalidJob("jobId must not be blank".into()));
        }
        if self.payload.is_empty() {
            return Err(BridgeError::InvalidJob(format!(
                "job {} has an empty payload",
                self.job_id
            )));
        }
        if self.target_printer_id.0 <= 0 {
            return Err(BridgeError::InvalidJob(format!(
                "job {} targets invalid printer id {}",
                self.job_id, self.target_printer_id
            )));
        }
        Ok(())
    }
}

mod payload_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// Hardware identity used to find a printer on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: String,
}

impl std::fmt::Display for PrinterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}/{}",
            self.vendor_id, self.product_id, self.serial_number
        )
    }
}

/// Request body for binding a logical printer id to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterConnectRequest {
    pub printer_id: PrinterId,
    #[serde(flatten)]
    pub identity: PrinterIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectOutcome {
    Disconnected,
    NotFound,
}

/// A device as reported by bus enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `None` when the string descriptor could not be read.
    pub serial_number: Option<String>,
    pub product_name: Option<String>,
    pub device_class: u8,
    pub bus_number: u8,
    pub device_address: u8,
}

/// USB base class code for printers.
pub const USB_CLASS_PRINTER: u8 = 0x07;

/// Placeholder reported for unreadable string descriptors.
pub const UNKNOWN_DESCRIPTOR: &str = "UNKNOWN";

/// A printer currently bound to a logical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPrinter {
    pub printer_id: PrinterId,
    #[serde(flatten)]
    pub identity: PrinterIdentity,
    pub connected_at: DateTime<Utc>,
}

/// A printer-like device found on the bus, bound or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluggedPrinter {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: String,
    pub product_name: String,
}

impl From<&UsbDeviceInfo> for PluggedPrinter {
    fn from(info: &UsbDeviceInfo) -> Self {
        Self {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            serial_number: info
                .serial_number
                .clone()
                .unwrap_or_else(|| UNKNOWN_DESCRIPTOR.to_string()),
            product_name: info
                .product_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_DESCRIPTOR.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterInventory {
    pub connected: Vec<ConnectedPrinter>,
    pub plugged: Vec<PluggedPrinter>,
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

/// Aggregate view over every printer queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverview {
    pub total_queues: usize,
    pub total_pending_jobs: usize,
    pub queue_sizes: BTreeMap<PrinterId, usize>,
}

/// Lifetime counters of one printer queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub printed: u64,
    pub failed: u64,
}

/// Event-stream session states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot returned by the session manager's status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub connected: bool,
    pub state: SessionState,
    pub bound_tenant: Option<TenantId>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub server_url: String,
    pub reconnect_attempts: u32,
}

/// State of the optional HTTP job poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingStatus {
    pub polling: bool,
    pub polled_jobs_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_job_accepts_current_field_names() {
        let raw = br#"{"targetPrinterId":3,"jobId":"A-1","payload":"^XA^FDhi^FS^XZ"}"#;
        let job = PrintJob::from_json(raw).unwrap();
        assert_eq!(job.target_printer_id, PrinterId(3));
        assert_eq!(job.job_id, "A-1");
        assert_eq!(job.payload, b"^XA^FDhi^FS^XZ");
        job.validate().unwrap();
    }

    #[test]
    fn print_job_accepts_legacy_field_names() {
        let raw = br#"{"id":7,"orderId":"order-9","command":"^XA^XZ"}"#;
        let job = PrintJob::from_json(raw).unwrap();
        assert_eq!(job.target_printer_id, PrinterId(7));
        assert_eq!(job.job_id, "order-9");
        assert_eq!(job.payload, b"^XA^XZ");
    }

    #[test]
    fn print_job_serializes_payload_as_text() {
        let job = PrintJob::new(PrinterId(1), "j", "^XA^XZ");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["payload"], "^XA^XZ");
        assert_eq!(value["targetPrinterId"], 1);
    }

    #[test]
    fn validation_rejects_unprintable_jobs() {
        assert!(PrintJob::new(PrinterId(1), "  ", "x").validate().is_err());
        assert!(PrintJob::new(PrinterId(1), "j", "").validate().is_err());
        assert!(PrintJob::new(PrinterId(0), "j", "x").validate().is_err());
        assert!(PrintJob::new(PrinterId(-4), "j", "x").validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = PrintJob::from_json(b"{not json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn plugged_printer_fills_unknown_descriptors() {
        let info = UsbDeviceInfo {
            vendor_id: 0x2d37,
            product_id: 0x1,
            serial_number: None,
            product_name: Some("XP-420B".into()),
            device_class: 0,
            bus_number: 1,
            device_address: 4,
        };
        let plugged = PluggedPrinter::from(&info);
        assert_eq!(plugged.serial_number, UNKNOWN_DESCRIPTOR);
        assert_eq!(plugged.product_name, "XP-420B");
    }

    #[test]
    fn tenant_validity() {
        assert!(TenantId(1).is_valid());
        assert!(!TenantId(0).is_valid());
        assert!(!TenantId(-1).is_valid());
    }
}
