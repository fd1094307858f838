// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer connection registry.
//
// Maps caller-assigned printer ids to claimed USB devices.  Each id owns a
// slot with its own async lock, so connect, disconnect, print and presence
// probes for one printer are serialised while different printers proceed in
// parallel.  The id -> slot map itself is only locked long enough to look a
// slot up.  A slot is dropped once it is empty and no caller holds it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use labelbridge_core::config::UsbConfig;
use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{
    ConnectOutcome, ConnectedPrinter, DisconnectOutcome, PluggedPrinter, PrinterId,
    PrinterIdentity, PrinterInventory,
};
use labelbridge_usb::traits::{PrinterHandle, PrinterTransport, looks_like_printer};
use tracing::{debug, info, instrument, warn};

struct Slot {
    /// Claimed device, if connected.  Held across device I/O.
    handle: tokio::sync::Mutex<Option<Box<dyn PrinterHandle>>>,
    /// Listing record, only written while `handle` is locked.
    record: Mutex<Option<ConnectedPrinter>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            handle: tokio::sync::Mutex::new(None),
            record: Mutex::new(None),
        }
    }

    fn set_record(&self, record: Option<ConnectedPrinter>) {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record;
    }

    fn record(&self) -> Option<ConnectedPrinter> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Registry of connected printers.
pub struct PrinterRegistry {
    transport: Arc<dyn PrinterTransport>,
    write_timeout: Duration,
    known_vendors: Vec<u16>,
    slots: Mutex<HashMap<PrinterId, Arc<Slot>>>,
}

impl PrinterRegistry {
    pub fn new(transport: Arc<dyn PrinterTransport>, usb: &UsbConfig) -> Self {
        Self {
            transport,
            write_timeout: usb.write_timeout(),
            known_vendors: usb.known_vendors.clone(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, printer_id: PrinterId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(printer_id)
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    /// Drop `printer_id`'s slot if it is empty and nobody else holds it.
    /// Slots are only cloned under the map lock, so the count is stable here.
    fn forget_if_unused(&self, printer_id: PrinterId, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = slots
            .get(&printer_id)
            .is_some_and(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(slot) == 2);
        if unused && slot.record().is_none() {
            slots.remove(&printer_id);
        }
    }

    fn existing_slot(&self, printer_id: PrinterId) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&printer_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<(PrinterId, Arc<Slot>)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect()
    }

    /// Bind `printer_id` to the attached device matching `identity`.
    ///
    /// A printer that is already bound reports `AlreadyConnected` without
    /// touching the bus.
    #[instrument(skip(self, identity), fields(printer_id = %printer_id, device = %identity))]
    pub async fn connect(
        &self,
        printer_id: PrinterId,
        identity: PrinterIdentity,
    ) -> Result<ConnectOutcome> {
        let slot = self.slot(printer_id);
        let mut handle = slot.handle.lock().await;

        if handle.is_some() {
            debug!("printer already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let opened = match self.transport.open(&identity) {
            Ok(opened) => opened,
            Err(e) => {
                drop(handle);
                self.forget_if_unused(printer_id, &slot);
                return Err(e);
            }
        };
        *handle = Some(opened);
        slot.set_record(Some(ConnectedPrinter {
            printer_id,
            identity,
            connected_at: Utc::now(),
        }));

        info!("printer connected");
        Ok(ConnectOutcome::Connected)
    }

    /// Release the device bound to `printer_id`.
    #[instrument(skip(self), fields(printer_id = %printer_id))]
    pub async fn disconnect(&self, printer_id: PrinterId) -> Result<DisconnectOutcome> {
        let Some(slot) = self.existing_slot(printer_id) else {
            return Ok(DisconnectOutcome::NotFound);
        };
        let mut handle = slot.handle.lock().await;

        let Some(device) = handle.take() else {
            return Ok(DisconnectOutcome::NotFound);
        };
        slot.set_record(None);
        drop(handle);
        self.forget_if_unused(printer_id, &slot);

        let device_name = device.identity().to_string();
        if let Err(e) = device.release() {
            warn!(device = %device_name, error = %e, "device release reported an error");
        }
        info!(device = %device_name, "printer disconnected");
        Ok(DisconnectOutcome::Disconnected)
    }

    /// Whether `printer_id` is bound to a device that is still attached.
    ///
    /// A bound device that has vanished from the bus is evicted and released.
    #[instrument(skip(self), fields(printer_id = %printer_id))]
    pub async fn is_connected(&self, printer_id: PrinterId) -> bool {
        let Some(slot) = self.existing_slot(printer_id) else {
            return false;
        };
        let mut handle = slot.handle.lock().await;

        let present = match handle.as_ref() {
            None => return false,
            Some(device) => device.is_present(),
        };

        match present {
            Ok(true) => true,
            Ok(false) => {
                if let Some(device) = handle.take() {
                    warn!(device = %device.identity(), "printer no longer on the bus, evicting");
                    if let Err(e) = device.release() {
                        debug!(error = %e, "release of vanished device failed");
                    }
                }
                slot.set_record(None);
                false
            }
            Err(e) => {
                // An unreadable bus says nothing about this device.
                warn!(error = %e, "presence probe failed");
                true
            }
        }
    }

    /// Send `payload` to the printer in a single bulk transfer.
    #[instrument(skip(self, payload), fields(printer_id = %printer_id, bytes = payload.len()))]
    pub async fn print(&self, printer_id: PrinterId, payload: &[u8]) -> Result<()> {
        let slot = self
            .existing_slot(printer_id)
            .ok_or(BridgeError::PrinterNotConnected(printer_id))?;
        let handle = slot.handle.lock().await;
        let device = handle
            .as_ref()
            .ok_or(BridgeError::PrinterNotConnected(printer_id))?;

        let written = device
            .bulk_write(payload, self.write_timeout)
            .await
            .map_err(|e| BridgeError::PrintFailed {
                printer_id,
                detail: e.to_string(),
            })?;

        if written != payload.len() {
            return Err(BridgeError::PrintFailed {
                printer_id,
                detail: format!("device accepted {written} of {} bytes", payload.len()),
            });
        }

        debug!(written, "payload delivered");
        Ok(())
    }

    /// Printers currently bound, ordered by id.
    pub fn connected_printers(&self) -> Vec<ConnectedPrinter> {
        let mut printers: Vec<ConnectedPrinter> = self
            .all_slots()
            .into_iter()
            .filter_map(|(_, slot)| slot.record())
            .collect();
        printers.sort_by_key(|p| p.printer_id);
        printers
    }

    /// Bound printers, plus printer-like devices on the bus that no printer
    /// id is bound to.
    #[instrument(skip(self))]
    pub fn enumerate(&self) -> Result<PrinterInventory> {
        let devices = self.transport.enumerate()?;
        let connected = self.connected_printers();
        let plugged = devices
            .iter()
            .filter(|info| looks_like_printer(info, &self.known_vendors))
            .map(PluggedPrinter::from)
            .filter(|plugged| !connected.iter().any(|c| is_same_device(plugged, &c.identity)))
            .collect::<Vec<_>>();

        debug!(
            connected = connected.len(),
            plugged = plugged.len(),
            "enumerated USB printers"
        );
        Ok(PrinterInventory { connected, plugged })
    }

    /// Release every bound device.  Individual failures are logged and skipped.
    pub async fn shutdown(&self) {
        let mut released = 0usize;
        for (printer_id, slot) in self.all_slots() {
            let mut handle = slot.handle.lock().await;
            if let Some(device) = handle.take() {
                slot.set_record(None);
                let device_name = device.identity().to_string();
                match device.release() {
                    Ok(()) => released += 1,
                    Err(e) => warn!(
                        printer_id = %printer_id,
                        device = %device_name,
                        error = %e,
                        "release failed during shutdown"
                    ),
                }
            }
        }
        info!(released, "printer registry shut down");
    }
}

fn is_same_device(plugged: &PluggedPrinter, identity: &PrinterIdentity) -> bool {
    plugged.vendor_id == identity.vendor_id
        && plugged.product_id == identity.product_id
        && plugged.serial_number == identity.serial_number
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelbridge_core::ErrorKind;
    use labelbridge_core::types::UsbDeviceInfo;
    use labelbridge_usb::MockTransport;

    const ZEBRA: u16 = 0x0A5F;

    fn identity(serial: &str) -> PrinterIdentity {
        PrinterIdentity {
            vendor_id: ZEBRA,
            product_id: 0x0166,
            serial_number: serial.into(),
        }
    }

    fn registry_with(serials: &[&str]) -> (MockTransport, PrinterRegistry) {
        let mock = MockTransport::new();
        for serial in serials {
            mock.plug_printer(ZEBRA, 0x0166, serial);
        }
        let registry = PrinterRegistry::new(Arc::new(mock.clone()), &UsbConfig::default());
        (mock, registry)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (mock, registry) = registry_with(&["ZT-1"]);

        let first = registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();
        let second = registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();

        assert_eq!(first, ConnectOutcome::Connected);
        assert_eq!(second, ConnectOutcome::AlreadyConnected);
        assert_eq!(mock.open_handles(), 1);
    }

    #[tokio::test]
    async fn connect_to_missing_device_leaves_nothing_bound() {
        let (mock, registry) = registry_with(&["ZT-1"]);

        let err = registry
            .connect(PrinterId(1), identity("OTHER"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(mock.open_handles(), 0);
        assert!(!registry.is_connected(PrinterId(1)).await);

        mock.set_fail_open(true);
        assert!(registry.connect(PrinterId(1), identity("ZT-1")).await.is_err());
        assert_eq!(mock.open_handles(), 0);
    }

    #[tokio::test]
    async fn disconnect_unknown_printer_is_not_found() {
        let (_mock, registry) = registry_with(&[]);
        assert_eq!(
            registry.disconnect(PrinterId(99)).await.unwrap(),
            DisconnectOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn disconnect_releases_device() {
        let (mock, registry) = registry_with(&["ZT-1"]);
        registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();

        assert_eq!(
            registry.disconnect(PrinterId(1)).await.unwrap(),
            DisconnectOutcome::Disconnected
        );
        assert_eq!(mock.open_handles(), 0);
        assert_eq!(
            registry.disconnect(PrinterId(1)).await.unwrap(),
            DisconnectOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn print_requires_connection() {
        let (_mock, registry) = registry_with(&["ZT-1"]);
        let err = registry.print(PrinterId(1), b"^XA^XZ").await.unwrap_err();
        assert!(matches!(err, BridgeError::PrinterNotConnected(PrinterId(1))));
    }

    #[tokio::test]
    async fn print_writes_payload_and_maps_failures() {
        let (mock, registry) = registry_with(&["ZT-1"]);
        registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();

        registry.print(PrinterId(1), b"^XA^FDok^FS^XZ").await.unwrap();
        assert_eq!(mock.payloads_for("ZT-1"), vec![b"^XA^FDok^FS^XZ".to_vec()]);

        mock.fail_writes_containing(b"JAM");
        let err = registry.print(PrinterId(1), b"JAM").await.unwrap_err();
        assert!(matches!(err, BridgeError::PrintFailed { printer_id: PrinterId(1), .. }));
    }

    #[tokio::test]
    async fn vanished_printer_is_evicted_on_probe() {
        let (mock, registry) = registry_with(&["ZT-1"]);
        registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();
        assert!(registry.is_connected(PrinterId(1)).await);

        mock.unplug("ZT-1");
        assert!(!registry.is_connected(PrinterId(1)).await);
        assert_eq!(mock.open_handles(), 0);
        assert!(registry.connected_printers().is_empty());
    }

    #[tokio::test]
    async fn enumerate_lists_connected_and_plugged() {
        let (mock, registry) = registry_with(&["ZT-1", "ZT-2"]);
        mock.plug(UsbDeviceInfo {
            vendor_id: 0x046D,
            product_id: 0xC52B,
            serial_number: None,
            product_name: Some("Receiver".into()),
            device_class: 0,
            bus_number: 2,
            device_address: 9,
        });
        mock.plug(UsbDeviceInfo {
            vendor_id: 0x2D37,
            product_id: 0x0001,
            serial_number: None,
            product_name: None,
            device_class: 0xFF,
            bus_number: 2,
            device_address: 10,
        });
        registry.connect(PrinterId(4), identity("ZT-2")).await.unwrap();

        let inventory = registry.enumerate().unwrap();
        assert_eq!(inventory.connected.len(), 1);
        assert_eq!(inventory.connected[0].printer_id, PrinterId(4));
        let mut plugged: Vec<_> = inventory
            .plugged
            .iter()
            .map(|p| p.serial_number.as_str())
            .collect();
        plugged.sort_unstable();
        assert_eq!(plugged, vec!["UNKNOWN", "ZT-1"]);

        registry.disconnect(PrinterId(4)).await.unwrap();
        assert_eq!(registry.enumerate().unwrap().plugged.len(), 3);
    }

    #[tokio::test]
    async fn enumerate_propagates_bus_failure() {
        let (mock, registry) = registry_with(&["ZT-1"]);
        mock.set_fail_enumerate(true);
        let err = registry.enumerate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    #[tokio::test]
    async fn failed_probe_keeps_binding() {
        let (mock, registry) = registry_with(&["ZT-1"]);
        registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();

        mock.set_fail_enumerate(true);
        assert!(registry.is_connected(PrinterId(1)).await);
        assert_eq!(mock.open_handles(), 1);
        assert_eq!(registry.connected_printers().len(), 1);

        mock.set_fail_enumerate(false);
        assert!(registry.is_connected(PrinterId(1)).await);
    }

    #[tokio::test]
    async fn failed_connects_leave_no_slots_behind() {
        let (mock, registry) = registry_with(&["ZT-1"]);
        for id in 1..=50 {
            assert!(registry.connect(PrinterId(id), identity("MISSING")).await.is_err());
        }
        assert_eq!(registry.all_slots().len(), 0);

        registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();
        assert_eq!(registry.all_slots().len(), 1);
        registry.disconnect(PrinterId(1)).await.unwrap();
        assert_eq!(registry.all_slots().len(), 0);
        assert_eq!(mock.open_handles(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_every_handle() {
        let (mock, registry) = registry_with(&["ZT-1", "ZT-2"]);
        registry.connect(PrinterId(1), identity("ZT-1")).await.unwrap();
        registry.connect(PrinterId(2), identity("ZT-2")).await.unwrap();
        assert_eq!(mock.open_handles(), 2);

        registry.shutdown().await;
        assert_eq!(mock.open_handles(), 0);
        assert!(registry.connected_printers().is_empty());
    }
}
