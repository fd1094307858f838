// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer print queues.
//
// Every printer gets its own bounded FIFO and exactly one worker task, which
// is the only thing that ever prints to that printer.  Enqueueing never
// blocks: a full queue or a full queue table is reported back to the caller
// as a capacity error.  Queues live in memory only; nothing survives a
// restart.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use labelbridge_core::config::QueueConfig;
use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{PrintJob, PrinterId, QueueCounters, QueueOverview};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::registry::PrinterRegistry;

/// State shared between a queue's owner and its worker.
struct QueueShared {
    jobs: Mutex<VecDeque<PrintJob>>,
    /// Signalled once per enqueue.
    notify: Notify,
    printed: AtomicU64,
    failed: AtomicU64,
}

impl QueueShared {
    fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            printed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<PrintJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_job(&self) -> PrintJob {
        loop {
            if let Some(job) = self.jobs().pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    fn counters(&self) -> QueueCounters {
        QueueCounters {
            printed: self.printed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct PrinterQueue {
    shared: Arc<QueueShared>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Owner of every printer queue and its worker.
pub struct PrintScheduler {
    registry: Arc<PrinterRegistry>,
    max_queues: usize,
    capacity: usize,
    queues: Mutex<HashMap<PrinterId, PrinterQueue>>,
}

impl PrintScheduler {
    pub fn new(registry: Arc<PrinterRegistry>, config: &QueueConfig) -> Self {
        Self {
            registry,
            max_queues: config.max_queues,
            capacity: config.max_queue_size,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<PrinterId, PrinterQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `job` to its printer's queue, creating the queue and its
    /// worker on first use.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self, job), fields(printer_id = %job.target_printer_id, job_id = %job.job_id))]
    pub fn enqueue(&self, job: PrintJob) -> Result<()> {
        let printer_id = job.target_printer_id;
        let mut queues = self.queues();
        let total_queues = queues.len();

        let queue = match queues.entry(printer_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if total_queues >= self.max_queues {
                    warn!(max_queues = self.max_queues, "queue limit reached");
                    return Err(BridgeError::QueueLimitReached {
                        printer_id,
                        max_queues: self.max_queues,
                    });
                }
                info!(total_queues = total_queues + 1, "created printer queue");
                entry.insert(self.spawn_queue(printer_id))
            }
        };

        let depth = {
            let mut jobs = queue.shared.jobs();
            if jobs.len() >= self.capacity {
                warn!(capacity = self.capacity, "printer queue full");
                return Err(BridgeError::QueueFull {
                    printer_id,
                    capacity: self.capacity,
                });
            }
            jobs.push_back(job);
            jobs.len()
        };
        queue.shared.notify.notify_one();

        debug!(depth, "job enqueued");
        Ok(())
    }

    fn spawn_queue(&self, printer_id: PrinterId) -> PrinterQueue {
        let shared = Arc::new(QueueShared::new(self.capacity));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            printer_id,
            Arc::clone(&shared),
            Arc::clone(&self.registry),
            cancel.clone(),
        ));
        PrinterQueue {
            shared,
            cancel,
            worker,
        }
    }

    /// Stop the worker for `printer_id`, discard its pending jobs and wait
    /// for the worker to finish any in-flight print.  Returns the number of
    /// jobs discarded.
    #[instrument(skip(self), fields(printer_id = %printer_id))]
    pub async fn remove_queue(&self, printer_id: PrinterId) -> usize {
        let Some(queue) = self.queues().remove(&printer_id) else {
            return 0;
        };
        let discarded = stop_queue(printer_id, queue).await;
        info!(discarded, "printer queue removed");
        discarded
    }

    pub fn queue_size(&self, printer_id: PrinterId) -> usize {
        self.queues()
            .get(&printer_id)
            .map(|q| q.shared.jobs().len())
            .unwrap_or(0)
    }

    /// Copy of the jobs still waiting for `printer_id`, oldest first.
    pub fn pending_jobs(&self, printer_id: PrinterId) -> Vec<PrintJob> {
        self.queues()
            .get(&printer_id)
            .map(|q| q.shared.jobs().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_queue_sizes(&self) -> BTreeMap<PrinterId, usize> {
        self.queues()
            .iter()
            .map(|(id, q)| (*id, q.shared.jobs().len()))
            .collect()
    }

    pub fn total_queues(&self) -> usize {
        self.queues().len()
    }

    pub fn overview(&self) -> QueueOverview {
        let queue_sizes = self.all_queue_sizes();
        QueueOverview {
            total_queues: queue_sizes.len(),
            total_pending_jobs: queue_sizes.values().sum(),
            queue_sizes,
        }
    }

    pub fn counters(&self, printer_id: PrinterId) -> Option<QueueCounters> {
        self.queues().get(&printer_id).map(|q| q.shared.counters())
    }

    /// Discard pending jobs for one printer.  The worker stays alive.
    #[instrument(skip(self), fields(printer_id = %printer_id))]
    pub fn clear_queue(&self, printer_id: PrinterId) -> usize {
        let cleared = self
            .queues()
            .get(&printer_id)
            .map(|q| {
                let mut jobs = q.shared.jobs();
                let n = jobs.len();
                jobs.clear();
                n
            })
            .unwrap_or(0);
        info!(cleared, "printer queue cleared");
        cleared
    }

    /// Discard pending jobs on every printer.  Workers stay alive.
    pub fn clear_all_queues(&self) -> usize {
        let cleared = self
            .queues()
            .values()
            .map(|q| {
                let mut jobs = q.shared.jobs();
                let n = jobs.len();
                jobs.clear();
                n
            })
            .sum();
        info!(cleared, "all printer queues cleared");
        cleared
    }

    /// Stop every worker and drop every queue.
    pub async fn shutdown(&self) {
        let drained: Vec<(PrinterId, PrinterQueue)> = self.queues().drain().collect();
        let count = drained.len();
        for (printer_id, queue) in drained {
            stop_queue(printer_id, queue).await;
        }
        info!(queues = count, "print scheduler shut down");
    }
}

async fn stop_queue(printer_id: PrinterId, queue: PrinterQueue) -> usize {
    queue.cancel.cancel();
    let discarded = {
        let mut jobs = queue.shared.jobs();
        let n = jobs.len();
        jobs.clear();
        n
    };
    if let Err(e) = queue.worker.await {
        error!(printer_id = %printer_id, error = %e, "print worker ended abnormally");
    }
    discarded
}

/// Worker loop for one printer.  Print errors are logged and absorbed.
async fn run_worker(
    printer_id: PrinterId,
    shared: Arc<QueueShared>,
    registry: Arc<PrinterRegistry>,
    cancel: CancellationToken,
) {
    debug!(printer_id = %printer_id, "print worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = shared.next_job() => job,
        };

        // Not raced against cancellation: an in-flight print always runs to
        // completion or to the transfer timeout.
        match registry.print(printer_id, &job.payload).await {
            Ok(()) => {
                shared.printed.fetch_add(1, Ordering::Relaxed);
                info!(printer_id = %printer_id, job_id = %job.job_id, "job printed");
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                error!(printer_id = %printer_id, job_id = %job.job_id, error = %e, "job failed");
            }
        }
    }
    debug!(printer_id = %printer_id, "print worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use labelbridge_core::config::UsbConfig;
    use labelbridge_core::types::PrinterIdentity;
    use labelbridge_usb::MockTransport;

    const ZEBRA: u16 = 0x0A5F;

    fn job(printer: i32, id: &str) -> PrintJob {
        PrintJob::new(PrinterId(printer), id, format!("^XA^FD{id}^FS^XZ"))
    }

    async fn setup(serials: &[(i32, &str)]) -> (MockTransport, Arc<PrinterRegistry>, PrintScheduler) {
        let mock = MockTransport::new();
        let registry = Arc::new(PrinterRegistry::new(
            Arc::new(mock.clone()),
            &UsbConfig::default(),
        ));
        for (printer, serial) in serials {
            mock.plug_printer(ZEBRA, 0x0166, serial);
            registry
                .connect(
                    PrinterId(*printer),
                    PrinterIdentity {
                        vendor_id: ZEBRA,
                        product_id: 0x0166,
                        serial_number: serial.to_string(),
                    },
                )
                .await
                .unwrap();
        }
        let scheduler = PrintScheduler::new(Arc::clone(&registry), &QueueConfig::default());
        (mock, registry, scheduler)
    }

    async fn wait_for_writes(mock: &MockTransport, serial: &str, count: usize) {
        for _ in 0..1_000 {
            if mock.payloads_for(serial).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} writes to {serial}");
    }

    #[tokio::test]
    async fn full_queue_rejects_without_dropping() {
        let (_mock, _registry, scheduler) = setup(&[]).await;

        // No await between enqueues, so the worker cannot drain anything.
        for i in 0..20 {
            scheduler.enqueue(job(1, &format!("j{i}"))).unwrap();
        }
        let err = scheduler.enqueue(job(1, "overflow")).unwrap_err();

        assert!(matches!(err, BridgeError::QueueFull { capacity: 20, .. }));
        assert_eq!(scheduler.queue_size(PrinterId(1)), 20);
        assert!(scheduler.pending_jobs(PrinterId(1)).iter().all(|j| j.job_id != "overflow"));
    }

    #[tokio::test]
    async fn twenty_first_queue_is_refused() {
        let (_mock, _registry, scheduler) = setup(&[]).await;

        for printer in 1..=20 {
            scheduler.enqueue(job(printer, "a")).unwrap();
        }
        let err = scheduler.enqueue(job(21, "a")).unwrap_err();

        assert!(matches!(err, BridgeError::QueueLimitReached { max_queues: 20, .. }));
        assert_eq!(scheduler.total_queues(), 20);
        assert_eq!(scheduler.queue_size(PrinterId(21)), 0);
        assert!(!scheduler.all_queue_sizes().contains_key(&PrinterId(21)));
    }

    #[tokio::test]
    async fn jobs_print_in_fifo_order() {
        let (mock, _registry, scheduler) = setup(&[(1, "ZT-1")]).await;

        for i in 0..5 {
            scheduler.enqueue(job(1, &format!("j{i}"))).unwrap();
        }
        wait_for_writes(&mock, "ZT-1", 5).await;

        let expected: Vec<Vec<u8>> = (0..5)
            .map(|i| format!("^XA^FDj{i}^FS^XZ").into_bytes())
            .collect();
        assert_eq!(mock.payloads_for("ZT-1"), expected);
        assert_eq!(mock.max_concurrent_writes("ZT-1"), 1);
        assert_eq!(
            scheduler.counters(PrinterId(1)),
            Some(QueueCounters { printed: 5, failed: 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_printer_does_not_hold_up_others() {
        let (mock, _registry, scheduler) = setup(&[(1, "SLOW"), (2, "FAST")]).await;
        mock.set_write_delay("SLOW", Duration::from_secs(3));

        scheduler.enqueue(job(1, "s1")).unwrap();
        scheduler.enqueue(job(2, "f1")).unwrap();
        scheduler.enqueue(job(2, "f2")).unwrap();

        wait_for_writes(&mock, "FAST", 2).await;
        assert!(mock.payloads_for("SLOW").is_empty());

        wait_for_writes(&mock, "SLOW", 1).await;
    }

    #[tokio::test]
    async fn failed_print_does_not_stop_the_worker() {
        let (mock, _registry, scheduler) = setup(&[(1, "ZT-1")]).await;
        mock.fail_writes_containing(b"bad");

        scheduler.enqueue(job(1, "bad")).unwrap();
        scheduler.enqueue(job(1, "good")).unwrap();
        wait_for_writes(&mock, "ZT-1", 1).await;

        assert_eq!(mock.payloads_for("ZT-1"), vec![b"^XA^FDgood^FS^XZ".to_vec()]);
        assert_eq!(
            scheduler.counters(PrinterId(1)),
            Some(QueueCounters { printed: 1, failed: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queue_keeps_worker_alive() {
        let (mock, _registry, scheduler) = setup(&[(1, "ZT-1")]).await;
        mock.set_write_delay("ZT-1", Duration::from_secs(1));

        for i in 0..4 {
            scheduler.enqueue(job(1, &format!("old{i}"))).unwrap();
        }
        // Let the worker take the first job.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.clear_queue(PrinterId(1)), 3);
        assert_eq!(scheduler.queue_size(PrinterId(1)), 0);

        scheduler.enqueue(job(1, "new")).unwrap();
        wait_for_writes(&mock, "ZT-1", 2).await;
        assert_eq!(
            mock.payloads_for("ZT-1"),
            vec![b"^XA^FDold0^FS^XZ".to_vec(), b"^XA^FDnew^FS^XZ".to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removed_queue_prints_nothing_more() {
        let (mock, _registry, scheduler) = setup(&[(1, "ZT-1")]).await;
        mock.set_write_delay("ZT-1", Duration::from_secs(1));

        for i in 0..5 {
            scheduler.enqueue(job(1, &format!("j{i}"))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = scheduler.remove_queue(PrinterId(1)).await;
        assert_eq!(discarded, 4);
        assert_eq!(scheduler.total_queues(), 0);

        // The in-flight job finished before remove_queue returned.
        assert_eq!(mock.payloads_for("ZT-1").len(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.payloads_for("ZT-1").len(), 1);
    }

    #[tokio::test]
    async fn overview_sums_pending_jobs() {
        let (_mock, _registry, scheduler) = setup(&[]).await;
        scheduler.enqueue(job(1, "a")).unwrap();
        scheduler.enqueue(job(1, "b")).unwrap();
        scheduler.enqueue(job(2, "c")).unwrap();

        let overview = scheduler.overview();
        assert_eq!(overview.total_queues, 2);
        assert_eq!(overview.total_pending_jobs, 3);
        assert_eq!(overview.queue_sizes.get(&PrinterId(1)), Some(&2));

        assert_eq!(scheduler.clear_all_queues(), 3);
        assert_eq!(scheduler.overview().total_pending_jobs, 0);
        assert_eq!(scheduler.total_queues(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_all_workers() {
        let (_mock, _registry, scheduler) = setup(&[]).await;
        scheduler.enqueue(job(1, "a")).unwrap();
        scheduler.enqueue(job(2, "b")).unwrap();

        scheduler.shutdown().await;
        assert_eq!(scheduler.total_queues(), 0);
    }
}
