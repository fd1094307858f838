// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// LabelBridge Print: printer connection registry, per-printer job queues and
// the ingestion gateway every job producer goes through.  Device access is
// delegated to the transport traits in `labelbridge-usb`.

pub mod gateway;
pub mod queue;
pub mod registry;

pub use gateway::JobGateway;
pub use queue::PrintScheduler;
pub use registry::PrinterRegistry;
