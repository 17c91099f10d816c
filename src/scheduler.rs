//! Background scheduler: two independent tickers driving the dispatcher and
//! the sequence runner.
//!
//! `tick_dispatch` and `tick_sequences` are public so tests (and operators)
//! can run one pass on demand instead of waiting for the interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AutomationConfig;
use crate::messaging::{DispatchReport, MessageDispatcher};
use crate::sequences::{EnrollmentTickReport, SequenceRunner};

pub struct AutomationScheduler {
    dispatcher: Arc<MessageDispatcher>,
    runner: Arc<SequenceRunner>,
    dispatch_interval: Duration,
    sequence_interval: Duration,
    dispatch_batch: usize,
    enrollment_batch: usize,
}

impl AutomationScheduler {
    pub fn new(
        dispatcher: Arc<MessageDispatcher>,
        runner: Arc<SequenceRunner>,
        config: &AutomationConfig,
    ) -> Self {
        Self {
            dispatcher,
            runner,
            dispatch_interval: config.dispatch_interval,
            sequence_interval: config.sequence_interval,
            dispatch_batch: config.dispatch_batch,
            enrollment_batch: config.enrollment_batch,
        }
    }

    /// One dispatcher pass: fail stalled sends, re-queue retryable failures,
    /// then send what is due.
    pub async fn tick_dispatch(&self) -> DispatchReport {
        if let Err(e) = self.dispatcher.fail_stalled_sends().await {
            error!("Failed to sweep stalled sends: {e}");
        }
        if let Err(e) = self.dispatcher.requeue_failed(self.dispatch_batch).await {
            error!("Failed to re-queue failed messages: {e}");
        }
        match self
            .dispatcher
            .process_pending_outbound(self.dispatch_batch, None)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                error!("Dispatcher tick failed: {e}");
                DispatchReport::default()
            }
        }
    }

    /// One sequence pass over due enrollments.
    pub async fn tick_sequences(&self) -> EnrollmentTickReport {
        match self.runner.process_due_enrollments(self.enrollment_batch).await {
            Ok(report) => report,
            Err(e) => {
                error!("Sequence tick failed: {e}");
                EnrollmentTickReport::default()
            }
        }
    }

    /// Start both tickers. They run until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> SchedulerHandle {
        info!(
            dispatch_secs = self.dispatch_interval.as_secs(),
            sequence_secs = self.sequence_interval.as_secs(),
            "Automation scheduler started"
        );

        let dispatch = {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            spawn_ticker("dispatch", self.dispatch_interval, cancel, move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    scheduler.tick_dispatch().await;
                }
            })
        };

        let sequences = {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            spawn_ticker("sequences", self.sequence_interval, cancel, move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    scheduler.tick_sequences().await;
                }
            })
        };

        SchedulerHandle {
            cancel,
            tasks: vec![dispatch, sequences],
        }
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(ticker = name, "Ticker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    tick().await;
                }
            }
        }
    })
}

/// Handle to the running tickers.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Cancel both tickers and wait for them to finish their current pass.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Channel, MessageStatus, NewMessage};
    use crate::testing::Harness;

    fn fast_config() -> AutomationConfig {
        AutomationConfig {
            dispatch_interval: Duration::from_millis(20),
            sequence_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tick_now_hooks_run_one_pass() {
        let h = Harness::new().await;
        h.sequence(None, &[(0, Channel::Sms, "step one")]).await;
        let lead = h.lead(None, Some("15551230003")).await;
        h.runner.start_for_lead(&lead).await;

        let scheduler = AutomationScheduler::new(
            Arc::clone(&h.dispatcher),
            Arc::clone(&h.runner),
            &AutomationConfig::default(),
        );

        let seq = scheduler.tick_sequences().await;
        assert_eq!(seq.completed, 1);
        let dispatch = scheduler.tick_dispatch().await;
        assert_eq!(dispatch.sent, 1);
        assert_eq!(h.sms.sent()[0].body, "step one");
    }

    #[tokio::test]
    async fn spawned_tickers_deliver_and_shut_down() {
        let h = Harness::new().await;
        let lead = h.lead(None, Some("15551230003")).await;
        h.dispatcher
            .create_message(NewMessage::outbound(
                lead.tenant_id,
                lead.id,
                Channel::Sms,
                "hello",
                MessageStatus::Pending,
                None,
            ))
            .await
            .unwrap();

        let scheduler = Arc::new(AutomationScheduler::new(
            Arc::clone(&h.dispatcher),
            Arc::clone(&h.runner),
            &fast_config(),
        ));
        let handle = scheduler.spawn(CancellationToken::new());

        let mut delivered = false;
        for _ in 0..100 {
            if !h.sms.sent().is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert!(delivered, "ticker never dispatched the pending message");
    }
}
