//! Consumer engine: parallel puller workers, each running the
//! claim-process-finalise cycle inside a short row-locking transaction.

use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta, Utc};
use metrics::counter;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::QueueDb;
use crate::error::{QueueError, QueueResult};
use crate::producer::default_concurrency;

/// Seconds of re-visibility delay per accumulated retry. Linear on purpose:
/// the engine is already coarse-grained at tick resolution, and a
/// predictable schedule beats exponential drift here.
const RETRY_INITIAL_BACKOFF_SECS: i64 = 2;

/// Caller-supplied processing callback.
///
/// Invoked synchronously from a puller worker, so it must be reentrant
/// across workers and idempotent under at-least-once delivery.
pub type ProcessFn = dyn Fn(&[u8]) -> anyhow::Result<()> + Send + Sync;

/// Options which can be used to tailor consumer behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Period each puller attempts a claim transaction at (default: 50ms).
    /// This can be tuned to achieve the desired throughput/latency tradeoff.
    pub pull_period_ms: u64,
    /// `LIMIT` of the claim query (default: 400).
    pub max_batch_size: u32,
    /// Times a message is requeued after failed processing before it is
    /// dropped (default: 3).
    pub max_processing_retries: u32,
    /// Number of parallel puller workers (default: available parallelism).
    /// Callers needing strict ordering must keep this at 1.
    pub concurrency: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            pull_period_ms: 50,
            max_batch_size: 400,
            max_processing_retries: 3,
            concurrency: default_concurrency(),
        }
    }
}

impl ConsumerOptions {
    pub fn validate(&self) -> QueueResult<()> {
        if self.pull_period_ms == 0 {
            return Err(QueueError::InvalidOptions(
                "pull_period_ms must be > 0".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(QueueError::InvalidOptions(
                "max_batch_size must be > 0".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(QueueError::InvalidOptions("concurrency must be > 0".into()));
        }
        Ok(())
    }
}

/// A message queue consumer.
///
/// Workers stop on the cancellation token passed at construction, after
/// their in-flight transaction commits or rolls back.
pub struct Consumer {
    workers: Vec<JoinHandle<()>>,
}

impl Consumer {
    pub(crate) async fn new(
        cancel: CancellationToken,
        db: QueueDb,
        process: Arc<ProcessFn>,
        options: ConsumerOptions,
    ) -> QueueResult<Consumer> {
        options.validate()?;
        db.ping().await.map_err(QueueError::Unreachable)?;

        let workers = (0..options.concurrency)
            .map(|worker_id| {
                let puller = Puller {
                    db: db.clone(),
                    process: Arc::clone(&process),
                    opts: options.clone(),
                    worker_id,
                };
                tokio::spawn(puller.run(cancel.clone()))
            })
            .collect();
        Ok(Consumer { workers })
    }

    /// Wait for the puller workers to finish after cancellation.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Split of a processed batch into its finalising statements: ids to
/// delete (successes plus terminal drops) and `(id, next_retries)` pairs to
/// requeue. Every claimed row lands in exactly one of the two.
struct FinalisePlan {
    delete_ids: Vec<i64>,
    requeues: Vec<(i64, i32)>,
    terminal_drops: usize,
}

fn finalise_batch(results: &[(i64, i32, bool)], max_retries: i32) -> FinalisePlan {
    let mut plan = FinalisePlan {
        delete_ids: Vec::with_capacity(results.len()),
        requeues: Vec::new(),
        terminal_drops: 0,
    };
    for &(id, retries, succeeded) in results {
        if succeeded {
            plan.delete_ids.push(id);
        } else if retries < max_retries {
            plan.requeues.push((id, retries + 1));
        } else {
            // retry budget spent: the failing attempt was the last one
            plan.delete_ids.push(id);
            plan.terminal_drops += 1;
        }
    }
    plan
}

/// Re-visibility delay for a row about to reach `next_retries` failures.
fn retry_backoff(next_retries: i32) -> TimeDelta {
    TimeDelta::seconds(RETRY_INITIAL_BACKOFF_SECS * i64::from(next_retries))
}

/// One puller worker.
struct Puller {
    db: QueueDb,
    process: Arc<ProcessFn>,
    opts: ConsumerOptions,
    worker_id: usize,
}

impl Puller {
    async fn run(self, cancel: CancellationToken) {
        let period = std::time::Duration::from_millis(self.opts.pull_period_ms);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = self.worker_id, "stopping puller: cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.pull_once(Utc::now().naive_utc()).await {
                        // rolled back; rows revert and are re-eligible next tick
                        warn!(worker = self.worker_id, error = %e, "claim cycle failed");
                    }
                }
            }
        }
    }

    /// One claim-process-finalise cycle. `now` is sampled once per tick and
    /// passed in, which also lets tests inject a clock.
    async fn pull_once(&self, now: NaiveDateTime) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        let rows = tx
            .select_ready(now, i64::from(self.opts.max_batch_size))
            .await?;
        if rows.is_empty() {
            return tx.commit().await;
        }
        debug!(worker = self.worker_id, claimed = rows.len(), "pulled batch");

        let results: Vec<(i64, i32, bool)> = rows
            .iter()
            .map(|row| {
                let succeeded = match (self.process)(&row.payload) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(worker = self.worker_id, id = row.id, error = %e, "error processing message");
                        false
                    }
                };
                (row.id, row.retries, succeeded)
            })
            .collect();

        let plan = finalise_batch(&results, self.opts.max_processing_retries as i32);
        for &(id, next_retries) in &plan.requeues {
            tx.requeue(id, next_retries, now + retry_backoff(next_retries))
                .await?;
        }
        if plan.terminal_drops > 0 {
            warn!(
                worker = self.worker_id,
                dropped = plan.terminal_drops,
                "dropping messages past the retry cap"
            );
        }
        tx.delete_ids(&plan.delete_ids).await?;
        tx.commit().await?;

        let processed = results.iter().filter(|(_, _, ok)| *ok).count();
        counter!("sqlmq_messages_processed_total").increment(processed as u64);
        counter!("sqlmq_messages_requeued_total").increment(plan.requeues.len() as u64);
        counter!("sqlmq_messages_dropped_total").increment(plan.terminal_drops as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_values() {
        let opts = ConsumerOptions::default();
        assert_eq!(opts.pull_period_ms, 50);
        assert_eq!(opts.max_batch_size, 400);
        assert_eq!(opts.max_processing_retries, 3);
        assert!(opts.concurrency >= 1);
    }

    #[test]
    fn validate_rejects_zero_fields() {
        for opts in [
            ConsumerOptions {
                pull_period_ms: 0,
                ..Default::default()
            },
            ConsumerOptions {
                max_batch_size: 0,
                ..Default::default()
            },
            ConsumerOptions {
                concurrency: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                opts.validate(),
                Err(QueueError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: ConsumerOptions =
            serde_json::from_str(r#"{"max_batch_size": 10}"#).unwrap();
        assert_eq!(opts.max_batch_size, 10);
        assert_eq!(opts.pull_period_ms, 50);
        assert_eq!(opts.max_processing_retries, 3);
    }

    #[test]
    fn successes_are_deleted() {
        let plan = finalise_batch(&[(1, 0, true), (2, 2, true)], 3);
        assert_eq!(plan.delete_ids, vec![1, 2]);
        assert!(plan.requeues.is_empty());
        assert_eq!(plan.terminal_drops, 0);
    }

    #[test]
    fn failures_below_the_cap_are_requeued_with_incremented_retries() {
        let plan = finalise_batch(&[(7, 0, false), (8, 2, false)], 3);
        assert!(plan.delete_ids.is_empty());
        assert_eq!(plan.requeues, vec![(7, 1), (8, 3)]);
    }

    #[test]
    fn failure_at_the_cap_is_a_terminal_drop() {
        let plan = finalise_batch(&[(9, 3, false)], 3);
        assert_eq!(plan.delete_ids, vec![9]);
        assert!(plan.requeues.is_empty());
        assert_eq!(plan.terminal_drops, 1);
    }

    #[test]
    fn every_claimed_row_is_finalised_exactly_once() {
        let results = [
            (1, 0, true),
            (2, 0, false),
            (3, 3, false),
            (4, 1, false),
            (5, 2, true),
        ];
        let plan = finalise_batch(&results, 3);
        let touched = plan.delete_ids.len() + plan.requeues.len();
        assert_eq!(touched, results.len());
        // no id in both sets
        for (id, _) in &plan.requeues {
            assert!(!plan.delete_ids.contains(id));
        }
    }

    #[test]
    fn backoff_schedule_is_linear() {
        assert_eq!(retry_backoff(1), TimeDelta::seconds(2));
        assert_eq!(retry_backoff(2), TimeDelta::seconds(4));
        assert_eq!(retry_backoff(3), TimeDelta::seconds(6));
    }

    #[test]
    fn ready_at_strictly_increases_across_failed_attempts() {
        let now = Utc::now().naive_utc();
        let mut last = now;
        for attempt in 1..=4 {
            let next = now + retry_backoff(attempt);
            assert!(next > last);
            last = next;
        }
    }
}
