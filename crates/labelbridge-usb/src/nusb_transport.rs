// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Hardware transport built on `nusb`.
//
// Devices are matched by vendor id, product id and the serial number string
// descriptor.  Opening detaches the kernel printer driver where the OS has
// one bound (`usblp` on Linux) and claims the configured interface.  The
// claimed `nusb::Interface` keeps the device open; dropping it releases the
// claim, which covers every error path after `open` succeeds.

use std::time::Duration;

use async_trait::async_trait;
use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{PrinterIdentity, USB_CLASS_PRINTER, UsbDeviceInfo};
use tracing::{debug, warn};

use crate::traits::{PrinterHandle, PrinterTransport};

/// `PrinterTransport` over the host USB stack.
#[derive(Debug, Clone)]
pub struct NusbTransport {
    interface: u8,
    out_endpoint: u8,
}

impl NusbTransport {
    pub fn new(interface: u8, out_endpoint: u8) -> Self {
        Self {
            interface,
            out_endpoint,
        }
    }

    fn find(&self, identity: &PrinterIdentity) -> Result<nusb::DeviceInfo> {
        let devices = nusb::list_devices()
            .map_err(|e| BridgeError::Device(format!("failed to list USB devices: {e}")))?;

        devices
            .into_iter()
            .find(|d| {
                d.vendor_id() == identity.vendor_id
                    && d.product_id() == identity.product_id
                    && d.serial_number() == Some(identity.serial_number.as_str())
            })
            .ok_or_else(|| BridgeError::DeviceNotFound {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
                serial_number: identity.serial_number.clone(),
            })
    }
}

/// Report the device class, falling back to the interface class for
/// composite devices that declare class 0 at device level.
fn effective_class(info: &nusb::DeviceInfo) -> u8 {
    if info.class() == 0
        && info
            .interfaces()
            .any(|i| i.class() == USB_CLASS_PRINTER)
    {
        USB_CLASS_PRINTER
    } else {
        info.class()
    }
}

fn describe(info: &nusb::DeviceInfo) -> UsbDeviceInfo {
    UsbDeviceInfo {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        serial_number: info.serial_number().map(str::to_owned),
        product_name: info.product_string().map(str::to_owned),
        device_class: effective_class(info),
        bus_number: info.bus_number(),
        device_address: info.device_address(),
    }
}

impl PrinterTransport for NusbTransport {
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>> {
        let devices = nusb::list_devices()
            .map_err(|e| BridgeError::Device(format!("failed to list USB devices: {e}")))?;
        Ok(devices.map(|d| describe(&d)).collect())
    }

    fn open(&self, identity: &PrinterIdentity) -> Result<Box<dyn PrinterHandle>> {
        let info = self.find(identity)?;

        let device = info
            .open()
            .map_err(|e| BridgeError::Device(format!("failed to open {identity}: {e}")))?;

        // `device` is dropped (and closed) if the claim fails.
        let interface = device
            .detach_and_claim_interface(self.interface)
            .map_err(|e| {
                BridgeError::Device(format!(
                    "failed to claim interface {} on {identity}: {e}",
                    self.interface
                ))
            })?;

        debug!(
            device = %identity,
            bus = info.bus_number(),
            address = info.device_address(),
            "claimed USB printer interface"
        );

        Ok(Box::new(NusbPrinterHandle {
            identity: identity.clone(),
            bus_number: info.bus_number(),
            device_address: info.device_address(),
            out_endpoint: self.out_endpoint,
            interface,
        }))
    }
}

/// A claimed printer interface.
pub struct NusbPrinterHandle {
    identity: PrinterIdentity,
    bus_number: u8,
    device_address: u8,
    out_endpoint: u8,
    interface: nusb::Interface,
}

#[async_trait]
impl PrinterHandle for NusbPrinterHandle {
    fn identity(&self) -> &PrinterIdentity {
        &self.identity
    }

    async fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let transfer = self.interface.bulk_out(self.out_endpoint, data.to_vec());

        // Dropping the transfer future on timeout cancels the URB.
        let completion = tokio::time::timeout(timeout, transfer)
            .await
            .map_err(|_| {
                BridgeError::Device(format!(
                    "bulk transfer to {} timed out after {timeout:?}",
                    self.identity
                ))
            })?;

        let written = completion
            .into_result()
            .map_err(|e| {
                BridgeError::Device(format!("bulk transfer to {} failed: {e}", self.identity))
            })?
            .actual_length();

        if written < data.len() {
            warn!(
                device = %self.identity,
                written,
                expected = data.len(),
                "short bulk write"
            );
        }
        Ok(written)
    }

    fn is_present(&self) -> Result<bool> {
        let devices = nusb::list_devices()
            .map_err(|e| BridgeError::Device(format!("failed to list USB devices: {e}")))?;
        Ok(devices.into_iter().any(|d| {
            d.bus_number() == self.bus_number
                && d.device_address() == self.device_address
                && d.vendor_id() == self.identity.vendor_id
                && d.product_id() == self.identity.product_id
        }))
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!(device = %self.identity, "releasing USB printer interface");
        drop(self.interface);
        Ok(())
    }
}
