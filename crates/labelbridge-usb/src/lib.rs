// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// LabelBridge USB transport.
//
// `traits` defines the device seam used by the printer registry.  The
// `nusb_transport` module talks to real hardware through the pure-Rust
// `nusb` stack; `mock` is an in-memory bus used by tests and dry runs.

pub mod mock;
pub mod nusb_transport;
pub mod traits;

use std::sync::Arc;

use labelbridge_core::config::UsbConfig;

pub use mock::MockTransport;
pub use nusb_transport::NusbTransport;
pub use traits::{PrinterHandle, PrinterTransport, looks_like_printer};

/// Build the hardware transport for this host.
pub fn system_transport(config: &UsbConfig) -> Arc<dyn PrinterTransport> {
    Arc::new(NusbTransport::new(config.interface, config.out_endpoint))
}
