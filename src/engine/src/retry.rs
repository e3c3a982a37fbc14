//! Retry controller for transient processor failures
//!
//! Only processor exceptions are retried; validation, uniqueness, and
//! duplicate-check findings never reach this path. Attempt `a` (1-based)
//! backs off for `retry_delay_ms × 2^(a−1)`, racing the job-wide
//! cancellation token so an abort during backoff returns immediately.

use std::sync::Arc;
use std::time::Duration;

use bulkflow_shared::{EngineEvent, RawRecord};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::ports::{RecordContext, RecordProcessor};

/// Terminal outcome of running one record through the processor
#[derive(Debug)]
pub enum RetryOutcome {
    /// Succeeded after `retry_count` retries
    Processed { retry_count: u32 },
    /// All attempts exhausted
    Failed { error: String, retry_count: u32 },
    /// Abort observed during backoff or between attempts
    Cancelled,
}

/// Per-record attempt accounting and backoff
#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryController {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(retry_delay_ms),
        }
    }

    /// Run the processor with up to `max_retries` retries
    pub async fn execute(
        &self,
        processor: &Arc<dyn RecordProcessor>,
        parsed: &RawRecord,
        ctx: &RecordContext,
        events: &EventBus,
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let mut retries = 0u32;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }

            match processor.process(parsed, ctx).await {
                Ok(()) => return RetryOutcome::Processed {
                    retry_count: retries,
                },
                Err(error) => {
                    let message = format!("{error:#}");
                    if retries >= self.max_retries {
                        warn!(
                            record_index = ctx.record_index,
                            retries, "processor failed terminally: {message}"
                        );
                        return RetryOutcome::Failed {
                            error: message,
                            retry_count: retries,
                        };
                    }

                    let attempt = retries + 1;
                    let delay = self.base_delay * 2u32.saturating_pow(retries);
                    debug!(
                        record_index = ctx.record_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "processor failed, backing off before retry"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    events.emit(EngineEvent::RecordRetried {
                        job_id: ctx.job_id.clone(),
                        timestamp: Utc::now(),
                        record_index: ctx.record_index,
                        attempt,
                        max_retries: self.max_retries,
                        error: message,
                    });
                    retries = attempt;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bulkflow_shared::EventKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProcessor {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RecordProcessor for FlakyProcessor {
        async fn process(&self, _parsed: &RawRecord, _ctx: &RecordContext) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("transient failure {call}")
            }
            Ok(())
        }
    }

    fn ctx(cancel: &CancellationToken) -> RecordContext {
        RecordContext {
            job_id: "job".into(),
            batch_id: "batch".into(),
            batch_index: 0,
            record_index: 1,
            total_records: 3,
            cancellation: cancel.clone(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_retries_with_events() {
        let controller = RetryController::new(3, 0);
        let events = EventBus::new();
        let retried = Arc::new(AtomicU32::new(0));
        let counter = retried.clone();
        events.on(EventKind::RecordRetried, move |event| {
            if let EngineEvent::RecordRetried { attempt, .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(*attempt >= 1);
            }
        });

        let processor: Arc<dyn RecordProcessor> = Arc::new(FlakyProcessor {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let outcome = controller
            .execute(&processor, &RawRecord::new(), &ctx(&cancel), &events, &cancel)
            .await;

        match outcome {
            RetryOutcome::Processed { retry_count } => assert_eq!(retry_count, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(retried.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_max_retries_means_single_attempt() {
        let controller = RetryController::new(0, 0);
        let events = EventBus::new();
        let retried = Arc::new(AtomicU32::new(0));
        let counter = retried.clone();
        events.on(EventKind::RecordRetried, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let processor: Arc<dyn RecordProcessor> = Arc::new(FlakyProcessor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let outcome = controller
            .execute(&processor, &RawRecord::new(), &ctx(&cancel), &events, &cancel)
            .await;

        match outcome {
            RetryOutcome::Failed { retry_count, .. } => assert_eq!(retry_count, 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(retried.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abort_during_backoff_returns_immediately() {
        let controller = RetryController::new(5, 60_000);
        let events = EventBus::new();
        let processor: Arc<dyn RecordProcessor> = Arc::new(FlakyProcessor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let record_ctx = ctx(&cancel);

        let cancel_after = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_after.cancel();
        });

        let start = std::time::Instant::now();
        let outcome = controller
            .execute(&processor, &RawRecord::new(), &record_ctx, &events, &cancel)
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
