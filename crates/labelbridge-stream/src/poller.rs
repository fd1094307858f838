// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP job poller.
//
// Optional fallback producer: asks a backend for pending jobs with a fixed
// delay between polls and feeds whatever comes back through the gateway's
// batch path.  Poll failures are logged and the next poll goes ahead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use labelbridge_core::config::PollingConfig;
use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{PollingStatus, PrintJob};
use labelbridge_print::JobGateway;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where polled jobs come from.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<PrintJob>>;
}

#[derive(Debug, Deserialize)]
struct PrintJobResponse {
    #[serde(rename = "printJobs", default)]
    print_jobs: Option<Vec<PrintJob>>,
}

/// `GET <url>` returning `{"printJobs": [...]}`.
pub struct HttpJobSource {
    client: reqwest::Client,
    url: String,
}

impl HttpJobSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn fetch(&self) -> Result<Vec<PrintJob>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BridgeError::Transport(format!("polling {}: {e}", self.url)))?;

        let body: PrintJobResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Transport(format!("decoding poll response: {e}")))?;
        Ok(body.print_jobs.unwrap_or_default())
    }
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct JobPoller {
    source: Arc<dyn JobSource>,
    gateway: JobGateway,
    interval: Duration,
    task: Mutex<Option<PollTask>>,
    polled: Arc<AtomicU64>,
}

impl JobPoller {
    pub fn new(source: Arc<dyn JobSource>, gateway: JobGateway, interval: Duration) -> Self {
        Self {
            source,
            gateway,
            interval,
            task: Mutex::new(None),
            polled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build a poller for the configured backend, or `None` when polling is
    /// not configured.
    pub fn from_config(config: &PollingConfig, gateway: JobGateway) -> Result<Option<Self>> {
        let Some(url) = config.backend_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let source = HttpJobSource::new(url, config.request_timeout())?;
        Ok(Some(Self::new(Arc::new(source), gateway, config.interval())))
    }

    fn task(&self) -> MutexGuard<'_, Option<PollTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin polling.  Starting an active poller only logs a warning.
    pub fn start(&self) {
        let mut task = self.task();
        if task.is_some() {
            warn!("polling is already active");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            self.gateway.clone(),
            self.interval,
            Arc::clone(&self.polled),
            cancel.clone(),
        ));
        *task = Some(PollTask { cancel, handle });
        info!(interval_ms = self.interval.as_millis() as u64, "job polling started");
    }

    /// Stop polling and wait for an in-progress poll to finish.
    pub async fn stop(&self) {
        let Some(task) = self.task().take() else {
            warn!("polling is not active");
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!(error = %e, "poll task ended abnormally");
        }
        info!("job polling stopped");
    }

    pub fn is_polling(&self) -> bool {
        self.task().is_some()
    }

    /// Jobs accepted into a queue since startup.
    pub fn polled_jobs_count(&self) -> u64 {
        self.polled.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PollingStatus {
        PollingStatus {
            polling: self.is_polling(),
            polled_jobs_count: self.polled_jobs_count(),
        }
    }
}

async fn poll_loop(
    source: Arc<dyn JobSource>,
    gateway: JobGateway,
    interval: Duration,
    polled: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = source.fetch() => fetched,
        };

        match fetched {
            Ok(jobs) if jobs.is_empty() => debug!("no print jobs from backend"),
            Ok(jobs) => {
                let received = jobs.len();
                let accepted = gateway.submit_batch(jobs);
                polled.fetch_add(accepted as u64, Ordering::Relaxed);
                debug!(received, accepted, "polled print jobs");
            }
            Err(e) => error!(error = %e, "polling print jobs failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use labelbridge_core::config::{QueueConfig, UsbConfig};
    use labelbridge_core::types::PrinterId;
    use labelbridge_print::{PrintScheduler, PrinterRegistry};
    use labelbridge_usb::MockTransport;

    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<PrintJob>>>>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl JobSource for ScriptedSource {
        async fn fetch(&self) -> Result<Vec<PrintJob>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn poller(batches: Vec<Result<Vec<PrintJob>>>) -> (Arc<ScriptedSource>, Arc<PrintScheduler>, JobPoller) {
        let registry = Arc::new(PrinterRegistry::new(
            Arc::new(MockTransport::new()),
            &UsbConfig::default(),
        ));
        let scheduler = Arc::new(PrintScheduler::new(registry, &QueueConfig::default()));
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(batches.into()),
            calls: AtomicU64::new(0),
        });
        let poller = JobPoller::new(
            source.clone(),
            JobGateway::new(Arc::clone(&scheduler)),
            Duration::from_millis(500),
        );
        (source, scheduler, poller)
    }

    #[test]
    fn response_accepts_missing_or_null_jobs() {
        let empty: PrintJobResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.print_jobs.is_none());
        let null: PrintJobResponse = serde_json::from_str(r#"{"printJobs":null}"#).unwrap();
        assert!(null.print_jobs.is_none());
        let legacy: PrintJobResponse =
            serde_json::from_str(r#"{"printJobs":[{"id":4,"orderId":"o-1","command":"^XA^XZ"}]}"#)
                .unwrap();
        assert_eq!(legacy.print_jobs.unwrap()[0].target_printer_id, PrinterId(4));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_with_fixed_delay_and_counts_accepted_jobs() {
        let (source, scheduler, poller) = poller(vec![
            Ok(vec![
                PrintJob::new(PrinterId(1), "a", "^XA^XZ"),
                PrintJob::new(PrinterId(1), "", "^XA^XZ"),
            ]),
            Err(BridgeError::Transport("backend down".into())),
            Ok(vec![PrintJob::new(PrinterId(2), "b", "^XA^XZ")]),
        ]);

        poller.start();
        assert!(poller.is_polling());
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(poller.polled_jobs_count(), 2);
        assert_eq!(scheduler.total_queues(), 2);

        poller.stop().await;
        assert!(!poller.is_polling());
        let calls = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_task() {
        let (_source, _scheduler, poller) = poller(Vec::new());
        poller.start();
        poller.start();
        assert!(poller.status().polling);
        poller.stop().await;
        poller.stop().await;
        assert!(!poller.status().polling);
    }

    #[test]
    fn unconfigured_backend_builds_no_poller() {
        let registry = Arc::new(PrinterRegistry::new(
            Arc::new(MockTransport::new()),
            &UsbConfig::default(),
        ));
        let scheduler = Arc::new(PrintScheduler::new(registry, &QueueConfig::default()));
        let gateway = JobGateway::new(scheduler);
        assert!(JobPoller::from_config(&PollingConfig::default(), gateway).unwrap().is_none());
    }
}
