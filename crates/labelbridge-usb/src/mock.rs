// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory USB bus for tests and hardware-less runs.
//
// Devices can be plugged and unplugged at runtime, writes are recorded in
// order, and individual failure modes (open, enumerate, writes containing a
// marker) can be switched on.  A per-device write delay lets tests hold a
// print in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{PrinterIdentity, USB_CLASS_PRINTER, UsbDeviceInfo};

use crate::traits::{PrinterHandle, PrinterTransport};

/// One bulk write seen by the mock bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub serial_number: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct MockBus {
    devices: Vec<UsbDeviceInfo>,
    writes: Vec<RecordedWrite>,
    write_delays: HashMap<String, Duration>,
    fail_marker: Option<Vec<u8>>,
    fail_open: bool,
    fail_enumerate: bool,
    open_handles: usize,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Shared, cloneable mock transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    bus: Arc<Mutex<MockBus>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn bus(&self) -> MutexGuard<'_, MockBus> {
        lock(&self.bus)
    }

    /// Attach a printer-class device with the given identity.
    pub fn plug_printer(&self, vendor_id: u16, product_id: u16, serial_number: &str) {
        let mut bus = self.bus();
        let address = bus.devices.len() as u8 + 1;
        bus.devices.push(UsbDeviceInfo {
            vendor_id,
            product_id,
            serial_number: Some(serial_number.to_string()),
            product_name: Some(format!("Mock printer {serial_number}")),
            device_class: USB_CLASS_PRINTER,
            bus_number: 1,
            device_address: address,
        });
    }

    /// Attach an arbitrary device description.
    pub fn plug(&self, info: UsbDeviceInfo) {
        self.bus().devices.push(info);
    }

    /// Detach every device carrying `serial_number`.
    pub fn unplug(&self, serial_number: &str) {
        self.bus()
            .devices
            .retain(|d| d.serial_number.as_deref() != Some(serial_number));
    }

    pub fn set_write_delay(&self, serial_number: &str, delay: Duration) {
        self.bus()
            .write_delays
            .insert(serial_number.to_string(), delay);
    }

    /// Fail every write whose payload contains `marker`.
    pub fn fail_writes_containing(&self, marker: &[u8]) {
        self.bus().fail_marker = Some(marker.to_vec());
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.bus().fail_open = fail;
    }

    pub fn set_fail_enumerate(&self, fail: bool) {
        self.bus().fail_enumerate = fail;
    }

    /// Every write accepted so far, in completion order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.bus().writes.clone()
    }

    /// Payloads written to one device, in order.
    pub fn payloads_for(&self, serial_number: &str) -> Vec<Vec<u8>> {
        self.bus()
            .writes
            .iter()
            .filter(|w| w.serial_number == serial_number)
            .map(|w| w.payload.clone())
            .collect()
    }

    /// Handles opened and not yet released or dropped.
    pub fn open_handles(&self) -> usize {
        self.bus().open_handles
    }

    /// Highest number of simultaneous writes ever seen on one device.
    pub fn max_concurrent_writes(&self, serial_number: &str) -> usize {
        self.bus()
            .max_in_flight
            .get(serial_number)
            .copied()
            .unwrap_or(0)
    }
}

fn lock(bus: &Mutex<MockBus>) -> MutexGuard<'_, MockBus> {
    bus.lock().unwrap_or_else(|e| e.into_inner())
}

impl PrinterTransport for MockTransport {
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>> {
        let bus = self.bus();
        if bus.fail_enumerate {
            return Err(BridgeError::Device("mock enumeration failure".into()));
        }
        Ok(bus.devices.clone())
    }

    fn open(&self, identity: &PrinterIdentity) -> Result<Box<dyn PrinterHandle>> {
        let mut bus = self.bus();
        let found = bus.devices.iter().any(|d| {
            d.vendor_id == identity.vendor_id
                && d.product_id == identity.product_id
                && d.serial_number.as_deref() == Some(identity.serial_number.as_str())
        });
        if !found {
            return Err(BridgeError::DeviceNotFound {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
                serial_number: identity.serial_number.clone(),
            });
        }
        if bus.fail_open {
            return Err(BridgeError::Device(format!(
                "mock claim failure on {identity}"
            )));
        }
        bus.open_handles += 1;
        Ok(Box::new(MockHandle {
            bus: Arc::clone(&self.bus),
            identity: identity.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

struct MockHandle {
    bus: Arc<Mutex<MockBus>>,
    identity: PrinterIdentity,
    released: AtomicBool,
}

impl MockHandle {
    /// Presence is read off a fresh bus listing, so it fails whenever
    /// enumeration does.
    fn present(&self) -> Result<bool> {
        let bus = lock(&self.bus);
        if bus.fail_enumerate {
            return Err(BridgeError::Device("mock enumeration failure".into()));
        }
        Ok(bus
            .devices
            .iter()
            .any(|d| d.serial_number.as_deref() == Some(self.identity.serial_number.as_str())))
    }

    fn close(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let mut bus = lock(&self.bus);
            bus.open_handles = bus.open_handles.saturating_sub(1);
        }
    }
}

#[async_trait]
impl PrinterHandle for MockHandle {
    fn identity(&self) -> &PrinterIdentity {
        &self.identity
    }

    async fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let serial = self.identity.serial_number.clone();
        let delay = {
            let mut bus = lock(&self.bus);
            let in_flight = bus.in_flight.entry(serial.clone()).or_insert(0);
            *in_flight += 1;
            let current = *in_flight;
            let max = bus.max_in_flight.entry(serial.clone()).or_insert(0);
            *max = (*max).max(current);
            bus.write_delays.get(&serial).copied()
        };

        let outcome = match delay {
            Some(delay) if delay > timeout => {
                tokio::time::sleep(timeout).await;
                Err(BridgeError::Device(format!(
                    "bulk transfer to {} timed out after {timeout:?}",
                    self.identity
                )))
            }
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        };

        let mut bus = lock(&self.bus);
        if let Some(count) = bus.in_flight.get_mut(&serial) {
            *count = count.saturating_sub(1);
        }
        outcome?;

        let attached = bus
            .devices
            .iter()
            .any(|d| d.serial_number.as_deref() == Some(serial.as_str()));
        if !attached {
            return Err(BridgeError::Device(format!("{} is no longer attached", self.identity)));
        }
        if let Some(marker) = &bus.fail_marker {
            if !marker.is_empty() && data.windows(marker.len()).any(|w| w == marker.as_slice()) {
                return Err(BridgeError::Device(format!(
                    "mock write failure on {}",
                    self.identity
                )));
            }
        }
        bus.writes.push(RecordedWrite {
            serial_number: serial,
            payload: data.to_vec(),
        });
        Ok(data.len())
    }

    fn is_present(&self) -> Result<bool> {
        self.present()
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}
