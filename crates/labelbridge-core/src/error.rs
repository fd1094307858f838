// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for LabelBridge.
//
// Every variant belongs to exactly one `ErrorKind`.  The kind is what the
// outer API layer uses to choose a response; the variant carries the detail
// that ends up in the log.

use thiserror::Error;

use crate::types::{PrinterId, TenantId};

/// Coarse error classification shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input (blank job id, empty payload, bad tenant id).
    Validation,
    /// Unknown printer or tenant.
    NotFound,
    /// Queue-count or queue-size limit reached.
    Capacity,
    /// Another tenant is already bound to the event stream.
    Conflict,
    /// USB enumeration, open, claim or transfer failure.
    Device,
    /// Event-stream handshake or transport failure.
    Transport,
    /// Required configuration is missing or unreadable.
    Config,
}

/// Top-level error type for all LabelBridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    // -- Validation --
    #[error("invalid print job: {0}")]
    InvalidJob(String),

    #[error("invalid tenant id {0}")]
    InvalidTenant(TenantId),

    // -- Lookup --
    #[error("printer {0} is not connected")]
    PrinterNotConnected(PrinterId),

    #[error("tenant {requested} is not bound to the event stream")]
    TenantMismatch {
        bound: Option<TenantId>,
        requested: TenantId,
    },

    // -- Capacity --
    #[error("cannot create queue for printer {printer_id}: maximum of {max_queues} queues reached")]
    QueueLimitReached {
        printer_id: PrinterId,
        max_queues: usize,
    },

    #[error("queue for printer {printer_id} is full (capacity {capacity})")]
    QueueFull {
        printer_id: PrinterId,
        capacity: usize,
    },

    // -- Conflict --
    #[error("tenant {bound} is bound to the event stream; disconnect it before binding {requested}")]
    TenantConflict {
        bound: TenantId,
        requested: TenantId,
    },

    // -- Device --
    #[error("USB device not found: vendor={vendor_id:#06x} product={product_id:#06x} serial={serial_number}")]
    DeviceNotFound {
        vendor_id: u16,
        product_id: u16,
        serial_number: String,
    },

    #[error("USB device error: {0}")]
    Device(String),

    #[error("print to printer {printer_id} failed: {detail}")]
    PrintFailed {
        printer_id: PrinterId,
        detail: String,
    },

    // -- Transport --
    #[error("event stream connection failed: {0}")]
    ConnectionFailed(String),

    #[error("event stream transport error: {0}")]
    Transport(String),

    #[error("malformed stream frame: {0}")]
    Frame(String),

    // -- Configuration --
    #[error("event stream server URL is not configured")]
    StreamNotConfigured,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Classify this error for the API boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidJob(_) | Self::InvalidTenant(_) | Self::Serialization(_) => {
                ErrorKind::Validation
            }
            Self::PrinterNotConnected(_) | Self::TenantMismatch { .. } => ErrorKind::NotFound,
            Self::QueueLimitReached { .. } | Self::QueueFull { .. } => ErrorKind::Capacity,
            Self::TenantConflict { .. } => ErrorKind::Conflict,
            Self::DeviceNotFound { .. } | Self::Device(_) | Self::PrintFailed { .. } => {
                ErrorKind::Device
            }
            Self::ConnectionFailed(_) | Self::Transport(_) | Self::Frame(_) => {
                ErrorKind::Transport
            }
            Self::StreamNotConfigured | Self::Config(_) | Self::Io(_) => ErrorKind::Config,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BridgeError>;
