//! Producer engine: a bounded intake channel feeding parallel batcher
//! workers, each coalescing payloads into one multi-row INSERT per tick.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::db::QueueDb;
use crate::error::{QueueError, QueueResult};

/// Hard ceiling on buffered payloads per flush: one placeholder each, and
/// some drivers carry the statement parameter count in a 16-bit field.
pub(crate) const MAX_BATCH_QUERY_SIZE: usize = u16::MAX as usize - 1;

/// First retry delay after a failed flush; doubles until the flush deadline.
const FLUSH_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(10);

/// Options which can be used to tailor producer behaviour.
///
/// All fields are defaulted, so the struct can be embedded in a host
/// application's config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerOptions {
    /// Period each batcher flushes its buffer at, if non-empty (default:
    /// 50ms). This can be tuned to achieve the desired throughput/latency
    /// tradeoff.
    pub push_period_ms: u64,
    /// Flush retry budget, in multiples of `push_period_ms` (default: 1).
    /// When the budget is exhausted the batch is dropped.
    pub max_retry_periods: u32,
    /// Number of parallel batcher workers (default: available parallelism).
    pub concurrency: usize,
    /// Bound of the in-memory intake channel; `push` suspends while it is
    /// full (default: 1024).
    pub intake_capacity: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            push_period_ms: 50,
            max_retry_periods: 1,
            concurrency: default_concurrency(),
            intake_capacity: 1024,
        }
    }
}

pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ProducerOptions {
    pub fn validate(&self) -> QueueResult<()> {
        if self.push_period_ms == 0 {
            return Err(QueueError::InvalidOptions(
                "push_period_ms must be > 0".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(QueueError::InvalidOptions("concurrency must be > 0".into()));
        }
        if self.intake_capacity == 0 {
            return Err(QueueError::InvalidOptions(
                "intake_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn push_period(&self) -> Duration {
        Duration::from_millis(self.push_period_ms)
    }

    /// Wall-clock budget for one flush, retries included.
    fn flush_deadline(&self) -> Duration {
        self.push_period() * self.max_retry_periods
    }
}

/// A message queue producer.
///
/// `push` hands payloads to background batcher workers; delivery is
/// fire-and-forget. Workers stop on the cancellation token passed at
/// construction; payloads still buffered at that point may be lost.
#[derive(Debug)]
pub struct Producer {
    intake: mpsc::Sender<Vec<u8>>,
    workers: Vec<JoinHandle<()>>,
}

impl Producer {
    pub(crate) async fn new(
        cancel: CancellationToken,
        db: QueueDb,
        options: ProducerOptions,
    ) -> QueueResult<Producer> {
        options.validate()?;
        db.ping().await.map_err(QueueError::Unreachable)?;

        let (tx, rx) = mpsc::channel(options.intake_capacity);
        let intake = Arc::new(Mutex::new(rx));
        let workers = (0..options.concurrency)
            .map(|worker_id| {
                let batcher = Batcher {
                    db: db.clone(),
                    buffer: Vec::new(),
                    opts: options.clone(),
                    worker_id,
                };
                tokio::spawn(batcher.run(Arc::clone(&intake), cancel.clone()))
            })
            .collect();
        Ok(Producer {
            intake: tx,
            workers,
        })
    }

    /// Push a message onto the queue.
    ///
    /// Suspends only while the intake channel is full (backpressure on the
    /// caller). There is no completion signal; once the batchers have
    /// stopped the payload is dropped.
    pub async fn push(&self, payload: Vec<u8>) {
        if self.intake.send(payload).await.is_err() {
            debug!("dropping push: batchers already stopped");
            return;
        }
        counter!("sqlmq_messages_pushed_total").increment(1);
    }

    /// Close the intake channel and wait for the batchers to finish.
    ///
    /// Without prior cancellation this drains: each batcher flushes what it
    /// holds before exiting.
    pub async fn join(self) {
        drop(self.intake);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// One batcher worker: buffers intake payloads and flushes on tick, on the
/// placeholder ceiling, or on intake close.
struct Batcher {
    db: QueueDb,
    buffer: Vec<Vec<u8>>,
    opts: ProducerOptions,
    worker_id: usize,
}

impl Batcher {
    async fn run(mut self, intake: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>, cancel: CancellationToken) {
        let period = self.opts.push_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = self.worker_id, "stopping batcher: cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush_with_retry(&cancel).await;
                    }
                }
                msg = recv_shared(&intake) => match msg {
                    Some(payload) => {
                        self.buffer.push(payload);
                        if self.buffer.len() >= MAX_BATCH_QUERY_SIZE {
                            self.flush_with_retry(&cancel).await;
                        }
                    }
                    None => {
                        debug!(worker = self.worker_id, "stopping batcher: intake closed");
                        if !self.buffer.is_empty() {
                            self.flush_with_retry(&cancel).await;
                        }
                        return;
                    }
                },
            }
        }
    }

    /// Flush the buffer under exponential backoff, bounded by
    /// `push_period * max_retry_periods`. The buffer is cleared whether the
    /// flush succeeded or the deadline dropped it.
    async fn flush_with_retry(&mut self, cancel: &CancellationToken) {
        let deadline = Instant::now() + self.opts.flush_deadline();
        let mut delay = FLUSH_RETRY_INITIAL_DELAY;
        loop {
            match self.db.insert_payloads(&self.buffer).await {
                Ok(rows) => {
                    debug!(worker = self.worker_id, rows, "pushed batch");
                    counter!("sqlmq_batches_flushed_total").increment(1);
                    counter!("sqlmq_messages_inserted_total").increment(rows);
                    break;
                }
                Err(e) if Instant::now() + delay < deadline => {
                    warn!(worker = self.worker_id, error = %e, "error pushing batch, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    delay *= 2;
                }
                Err(e) => {
                    error!(
                        worker = self.worker_id,
                        dropped = self.buffer.len(),
                        error = %e,
                        "flush deadline exceeded, dropping batch"
                    );
                    counter!("sqlmq_batches_dropped_total").increment(1);
                    break;
                }
            }
        }
        self.buffer.clear();
    }
}

async fn recv_shared(intake: &Mutex<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    intake.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_values() {
        let opts = ProducerOptions::default();
        assert_eq!(opts.push_period_ms, 50);
        assert_eq!(opts.max_retry_periods, 1);
        assert_eq!(opts.intake_capacity, 1024);
        assert!(opts.concurrency >= 1);
    }

    #[test]
    fn validate_rejects_zero_fields() {
        let opts = ProducerOptions {
            push_period_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(QueueError::InvalidOptions(_))
        ));

        let opts = ProducerOptions {
            concurrency: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = ProducerOptions {
            intake_capacity: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn zero_retry_periods_means_single_attempt() {
        let opts = ProducerOptions {
            max_retry_periods: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
        assert_eq!(opts.flush_deadline(), Duration::ZERO);
    }

    #[test]
    fn flush_deadline_scales_with_push_period() {
        let opts = ProducerOptions {
            push_period_ms: 100,
            max_retry_periods: 3,
            ..Default::default()
        };
        assert_eq!(opts.flush_deadline(), Duration::from_millis(300));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: ProducerOptions = serde_json::from_str(r#"{"push_period_ms": 10}"#).unwrap();
        assert_eq!(opts.push_period_ms, 10);
        assert_eq!(opts.max_retry_periods, 1);
        assert_eq!(opts.intake_capacity, 1024);
    }

    #[test]
    fn batch_ceiling_fits_a_16_bit_parameter_count() {
        assert_eq!(MAX_BATCH_QUERY_SIZE, 65_534);
    }
}
