// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transport-agnostic trait definitions for USB printers.
//
// The registry never touches a USB library directly.  Everything it needs
// (enumeration, opening and claiming, bulk writes, presence probes and
// release) goes through these two traits.

use std::time::Duration;

use async_trait::async_trait;
use labelbridge_core::error::Result;
use labelbridge_core::types::{PrinterIdentity, USB_CLASS_PRINTER, UsbDeviceInfo};

/// Access to the USB bus.
pub trait PrinterTransport: Send + Sync {
    /// List every device currently attached.
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>>;

    /// Open the device whose vendor id, product id and serial number all
    /// match, detach any active kernel driver and claim the print interface.
    ///
    /// Nothing stays acquired when this returns an error.
    fn open(&self, identity: &PrinterIdentity) -> Result<Box<dyn PrinterHandle>>;
}

/// An opened printer with its interface claimed.
///
/// Dropping a handle without calling [`PrinterHandle::release`] still frees
/// the interface.
#[async_trait]
pub trait PrinterHandle: Send + Sync {
    fn identity(&self) -> &PrinterIdentity;

    /// Perform one bulk OUT transfer, giving up after `timeout`.
    /// Returns the number of bytes the device accepted.
    async fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Whether the device is still attached to the bus.
    fn is_present(&self) -> Result<bool>;

    /// Release the interface and close the device.
    fn release(self: Box<Self>) -> Result<()>;
}

/// Printer-class devices plus anything from an allow-listed vendor.
pub fn looks_like_printer(info: &UsbDeviceInfo, known_vendors: &[u16]) -> bool {
    info.device_class == USB_CLASS_PRINTER || known_vendors.contains(&info.vendor_id)
}
