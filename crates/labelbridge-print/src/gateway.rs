// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job ingestion gateway.
//
// Single entry point for jobs from every producer.  Direct submissions get
// their errors back; streamed and polled jobs have no one to report to, so
// their failures are logged once and dropped.

use std::sync::Arc;

use labelbridge_core::error::Result;
use labelbridge_core::types::PrintJob;
use tracing::{debug, warn};

use crate::queue::PrintScheduler;

#[derive(Clone)]
pub struct JobGateway {
    scheduler: Arc<PrintScheduler>,
}

impl JobGateway {
    pub fn new(scheduler: Arc<PrintScheduler>) -> Self {
        Self { scheduler }
    }

    /// Validate and enqueue a job submitted by a caller that waits for the
    /// answer.
    pub fn submit(&self, job: PrintJob) -> Result<()> {
        job.validate()?;
        self.scheduler.enqueue(job)
    }

    /// Decode one event-stream frame body and enqueue it.  Returns whether
    /// the job was accepted; failures are logged, never propagated.
    pub fn submit_stream_frame(&self, body: &[u8]) -> bool {
        let job = match PrintJob::from_json(body) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, bytes = body.len(), "discarding undecodable stream frame");
                return false;
            }
        };
        self.submit_quietly(job, "stream")
    }

    /// Enqueue every job of a polled batch independently.  Returns how many
    /// were accepted.
    pub fn submit_batch(&self, jobs: Vec<PrintJob>) -> usize {
        jobs.into_iter()
            .map(|job| self.submit_quietly(job, "poll"))
            .filter(|accepted| *accepted)
            .count()
    }

    fn submit_quietly(&self, job: PrintJob, source: &'static str) -> bool {
        let printer_id = job.target_printer_id;
        let job_id = job.job_id.clone();
        match self.submit(job) {
            Ok(()) => {
                debug!(source, printer_id = %printer_id, job_id = %job_id, "job accepted");
                true
            }
            Err(e) => {
                warn!(source, printer_id = %printer_id, job_id = %job_id, error = %e, "job rejected");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PrinterRegistry;
    use labelbridge_core::ErrorKind;
    use labelbridge_core::config::{QueueConfig, UsbConfig};
    use labelbridge_core::types::PrinterId;
    use labelbridge_usb::MockTransport;

    fn gateway(max_queue_size: usize) -> (Arc<PrintScheduler>, JobGateway) {
        let registry = Arc::new(PrinterRegistry::new(
            Arc::new(MockTransport::new()),
            &UsbConfig::default(),
        ));
        let scheduler = Arc::new(PrintScheduler::new(
            registry,
            &QueueConfig {
                max_queues: 20,
                max_queue_size,
            },
        ));
        (Arc::clone(&scheduler), JobGateway::new(scheduler))
    }

    #[tokio::test]
    async fn direct_submission_reports_errors() {
        let (scheduler, gateway) = gateway(1);

        let invalid = PrintJob::new(PrinterId(1), "", "^XA^XZ");
        assert_eq!(gateway.submit(invalid).unwrap_err().kind(), ErrorKind::Validation);

        gateway.submit(PrintJob::new(PrinterId(1), "a", "^XA^XZ")).unwrap();
        let full = gateway.submit(PrintJob::new(PrinterId(1), "b", "^XA^XZ"));
        assert_eq!(full.unwrap_err().kind(), ErrorKind::Capacity);
        assert_eq!(scheduler.queue_size(PrinterId(1)), 1);
    }

    #[tokio::test]
    async fn stream_frames_are_decoded_and_enqueued() {
        let (scheduler, gateway) = gateway(20);

        assert!(gateway.submit_stream_frame(br#"{"targetPrinterId":2,"jobId":"o-1","payload":"^XA^XZ"}"#));
        assert!(!gateway.submit_stream_frame(b"not json"));
        assert!(!gateway.submit_stream_frame(br#"{"targetPrinterId":2,"jobId":"o-2","payload":""}"#));

        let pending = scheduler.pending_jobs(PrinterId(2));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, "o-1");
    }

    #[tokio::test]
    async fn batch_counts_accepted_jobs() {
        let (_scheduler, gateway) = gateway(2);
        let jobs = vec![
            PrintJob::new(PrinterId(1), "a", "x"),
            PrintJob::new(PrinterId(1), "b", "x"),
            PrintJob::new(PrinterId(1), "c", "x"),
            PrintJob::new(PrinterId(0), "d", "x"),
            PrintJob::new(PrinterId(3), "e", "x"),
        ];
        assert_eq!(gateway.submit_batch(jobs), 3);
    }
}
