// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer: builds the printer registry, the queue scheduler,
// the ingestion gateway and both remote producers, and exposes the
// operations an HTTP front end calls.
//
// Every field is Arc-wrapped so the facade can be cloned into request
// handlers and background tasks.

use std::path::Path;
use std::sync::Arc;

use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{
    ConnectOutcome, DisconnectOutcome, PollingStatus, PrintJob, PrinterConnectRequest, PrinterId,
    PrinterInventory, QueueOverview, StreamStatus, TenantId,
};
use labelbridge_core::AgentConfig;
use labelbridge_print::{JobGateway, PrintScheduler, PrinterRegistry};
use labelbridge_stream::{JobPoller, StompWsTransport, StreamSessionManager, StreamTransport};
use labelbridge_usb::PrinterTransport;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AgentServices {
    config: Arc<AgentConfig>,
    registry: Arc<PrinterRegistry>,
    scheduler: Arc<PrintScheduler>,
    gateway: JobGateway,
    stream: StreamSessionManager,
    poller: Option<Arc<JobPoller>>,
}

impl AgentServices {
    /// Load configuration from `config_path` and wire the production
    /// transports.  Must be called inside a tokio runtime.
    pub fn init(config_path: &Path) -> Result<Self> {
        info!(path = %config_path.display(), "loading agent configuration");
        let config = AgentConfig::load(config_path)?;
        let printers = labelbridge_usb::system_transport(&config.usb);
        Self::with_transports(config, printers, Arc::new(StompWsTransport::new()))
    }

    pub fn with_transports(
        config: AgentConfig,
        printers: Arc<dyn PrinterTransport>,
        stream: Arc<dyn StreamTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(PrinterRegistry::new(printers, &config.usb));
        let scheduler = Arc::new(PrintScheduler::new(Arc::clone(&registry), &config.queue));
        let gateway = JobGateway::new(Arc::clone(&scheduler));
        let session = StreamSessionManager::new(config.stream.clone(), stream, gateway.clone());
        let poller = JobPoller::from_config(&config.polling, gateway.clone())?.map(Arc::new);

        info!(
            max_queues = config.queue.max_queues,
            max_queue_size = config.queue.max_queue_size,
            stream_configured = config.stream.is_configured(),
            polling_configured = poller.is_some(),
            "agent services initialised"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            scheduler,
            gateway,
            stream: session,
            poller,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    // -- Jobs ----------------------------------------------------------------

    pub fn submit_job(&self, job: PrintJob) -> Result<()> {
        self.gateway.submit(job)
    }

    // -- Printers ------------------------------------------------------------

    pub async fn connect_printer(&self, request: PrinterConnectRequest) -> Result<ConnectOutcome> {
        self.registry
            .connect(request.printer_id, request.identity)
            .await
    }

    /// Drop the printer's queue, then release the device.
    pub async fn disconnect_printer(&self, printer_id: PrinterId) -> Result<DisconnectOutcome> {
        let discarded = self.scheduler.remove_queue(printer_id).await;
        if discarded > 0 {
            warn!(printer_id = %printer_id, discarded, "pending jobs dropped on disconnect");
        }
        self.registry.disconnect(printer_id).await
    }

    pub async fn is_printer_connected(&self, printer_id: PrinterId) -> bool {
        self.registry.is_connected(printer_id).await
    }

    pub fn printers(&self) -> Result<PrinterInventory> {
        self.registry.enumerate()
    }

    // -- Queues --------------------------------------------------------------

    pub fn queue_size(&self, printer_id: PrinterId) -> usize {
        self.scheduler.queue_size(printer_id)
    }

    pub fn pending_jobs(&self, printer_id: PrinterId) -> Vec<PrintJob> {
        self.scheduler.pending_jobs(printer_id)
    }

    pub fn queue_overview(&self) -> QueueOverview {
        self.scheduler.overview()
    }

    pub fn clear_queue(&self, printer_id: PrinterId) -> usize {
        self.scheduler.clear_queue(printer_id)
    }

    pub fn clear_all_queues(&self) -> usize {
        self.scheduler.clear_all_queues()
    }

    // -- Event stream --------------------------------------------------------

    pub async fn connect_stream(&self, tenant: TenantId) -> Result<()> {
        self.stream.connect(tenant).await
    }

    pub async fn disconnect_stream(&self, tenant: TenantId) -> Result<()> {
        self.stream.disconnect(tenant).await
    }

    pub fn stream_status(&self, tenant: TenantId) -> StreamStatus {
        self.stream.get_status(tenant)
    }

    // -- Polling -------------------------------------------------------------

    pub fn start_polling(&self) -> Result<()> {
        let poller = self.poller.as_ref().ok_or_else(|| {
            BridgeError::Config("polling.backend_url is not configured".into())
        })?;
        poller.start();
        Ok(())
    }

    pub async fn stop_polling(&self) {
        if let Some(poller) = &self.poller {
            poller.stop().await;
        }
    }

    pub fn polling_status(&self) -> PollingStatus {
        self.poller
            .as_ref()
            .map(|p| p.status())
            .unwrap_or_default()
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Stop producers first, then workers, then release devices.
    pub async fn shutdown(&self) {
        info!("agent shutting down");
        self.stream.shutdown().await;
        if let Some(poller) = self.poller.as_ref().filter(|p| p.is_polling()) {
            poller.stop().await;
        }
        self.scheduler.shutdown().await;
        self.registry.shutdown().await;
        info!("agent stopped");
    }
}
