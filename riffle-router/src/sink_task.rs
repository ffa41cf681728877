//! The per-sink writer task: drains the sink's ingest queue in coalesced
//! batches, applies them, and routes every failed row through the retry
//! controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use riffle_data::fingerprint;
use riffle_errors::WriteErrorKind;
use riffle_sinks::batch::{next_batch, BatchConfig};
use riffle_sinks::{BatchItem, SinkWriter, WriteResult};
use riffle_util::shutdown::ShutdownReceiver;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::retry::{decide, RetryDecision};
use crate::router::{Router, SinkJob};

/// Run one sink's writer loop until shutdown or queue closure.
///
/// `job_tx` must be the sender side of `rx`: retries re-enter the sink
/// through the same ingest queue. On shutdown the current batch is
/// finished, the queue stops being read, and the sink is disconnected;
/// whatever was still queued is unacked and will be re-streamed by the
/// source on the next start.
pub async fn run_sink(
    mut sink: Box<dyn SinkWriter>,
    mut rx: mpsc::Receiver<SinkJob>,
    job_tx: mpsc::Sender<SinkJob>,
    router: Router,
    dead_letters: Arc<dyn DeadLetterStore>,
    flush_interval: Duration,
    mut shutdown: ShutdownReceiver,
) {
    let max_batch = router
        .pipelines()
        .iter()
        .filter(|p| p.sink_name() == sink.name())
        .map(|p| p.batch_size())
        .max()
        .unwrap_or(1);
    let batch_config = BatchConfig {
        max_size: max_batch,
        flush_interval,
    };

    loop {
        let batch = tokio::select! {
            _ = shutdown.recv() => break,
            batch = next_batch(&mut rx, &batch_config) => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        for group in group_by_pipeline(batch) {
            let items: Vec<BatchItem> = group
                .iter()
                .map(|job| BatchItem {
                    change: Arc::clone(&job.change),
                    upsert: job.upsert,
                })
                .collect();
            let results = sink.apply_batch(&items).await;
            debug_assert_eq!(results.len(), group.len());
            for (job, result) in group.into_iter().zip(results) {
                settle(job, result, &job_tx, &router, &dead_letters).await;
            }
        }
    }

    if let Err(err) = sink.disconnect().await {
        warn!(sink = sink.name(), %err, "sink disconnect failed");
    }
    info!(sink = sink.name(), "sink writer stopped");
}

/// Split a drained queue into per-pipeline batches: consecutive jobs for
/// the same pipeline coalesce, chunked at that pipeline's batch size.
/// Arrival order is preserved within and across groups.
fn group_by_pipeline(batch: Vec<SinkJob>) -> Vec<Vec<SinkJob>> {
    let mut groups: Vec<Vec<SinkJob>> = Vec::new();
    for job in batch {
        match groups.last_mut() {
            Some(group)
                if group[0].pipeline.name() == job.pipeline.name()
                    && group.len() < job.pipeline.batch_size() =>
            {
                group.push(job)
            }
            _ => groups.push(vec![job]),
        }
    }
    groups
}

async fn settle(
    job: SinkJob,
    result: WriteResult,
    job_tx: &mpsc::Sender<SinkJob>,
    router: &Router,
    dead_letters: &Arc<dyn DeadLetterStore>,
) {
    let pipeline = Arc::clone(&job.pipeline);
    let stats = pipeline.stats();

    // A not-found delete is a success: the row is as absent as the source
    // wanted it.
    if result.success || result.error_kind == Some(WriteErrorKind::NotFound) {
        stats.record_ok(job.enqueued.elapsed());
        router.complete(&job.source, job.seq);
        return;
    }

    stats.record_failed();
    let kind = result.error_kind.unwrap_or(WriteErrorKind::Transient);
    let detail = result
        .error_detail
        .clone()
        .unwrap_or_else(|| "unclassified write failure".into());

    match decide(pipeline.retry_policy(), pipeline.max_retries(), job.attempt, kind) {
        RetryDecision::RetryAfter(delay) => {
            warn!(
                pipeline = pipeline.name(),
                attempt = job.attempt,
                ?delay,
                %kind,
                %detail,
                "write failed, scheduling retry"
            );
            counter!("riffle_retries_total", "pipeline" => pipeline.name().to_owned())
                .increment(1);
            let retry = SinkJob {
                attempt: job.attempt + 1,
                // Retried records always write upsert semantics.
                upsert: true,
                ..job
            };
            let tx = job_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // A closed queue means the sink stopped; the unacked
                // position is re-streamed on the next start.
                let _ = tx.send(retry).await;
            });
        }
        RetryDecision::DeadLetter => {
            error!(
                pipeline = pipeline.name(),
                attempts = job.attempt,
                %kind,
                %detail,
                table = job.change.table(),
                "exhausted delivery, dead-lettering change"
            );
            counter!("riffle_dead_letters_total", "pipeline" => pipeline.name().to_owned())
                .increment(1);
            let record = DeadLetterRecord {
                fingerprint: hex::encode(fingerprint(&job.change)),
                change: (*job.change).clone(),
                last_error_kind: kind,
                last_error_detail: detail,
                attempts: job.attempt,
                first_seen: job.first_seen,
                last_seen: Utc::now(),
            };
            if let Err(err) = dead_letters.append(pipeline.name(), record).await {
                error!(pipeline = pipeline.name(), %err, "dead-letter append failed");
            }
            stats.record_dead_letter();
            // Dead-letter is terminal: the watermark advances past it.
            router.complete(&job.source, job.seq);
        }
        RetryDecision::Abort => {
            error!(
                pipeline = pipeline.name(),
                %detail,
                "fatal write error, disabling pipeline until operator intervention"
            );
            pipeline.disable();
            router.complete(&job.source, job.seq);
        }
    }
}
