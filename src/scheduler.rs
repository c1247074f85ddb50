use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::domain::{MetricsSink, PriceFetcher};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Drives the fetcher on a fixed interval and publishes into the sink until shut down.
pub(crate) struct PollScheduler<F, S> {
    fetcher: F,
    sink: S,
    interval: Duration,
    shutdown: Shutdown,
    state: SchedulerState,
}

impl<F, S> PollScheduler<F, S>
where
    F: PriceFetcher,
    S: MetricsSink,
{
    pub(crate) fn new(fetcher: F, sink: S, interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            fetcher,
            sink,
            interval,
            shutdown,
            state: SchedulerState::Idle,
        }
    }

    /// Runs until the shutdown token is cancelled. Cancellation is only observed between
    /// cycles, so a fetch in flight always completes or times out on its own.
    pub(crate) async fn run(mut self) -> SchedulerState {
        self.transition(SchedulerState::Running);

        if !self.shutdown.is_cancelled() {
            self.cycle().await;
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.cycle().await,
            }
        }

        self.transition(SchedulerState::Stopping);
        self.transition(SchedulerState::Stopped);
        self.state
    }

    async fn cycle(&self) {
        match self.fetcher.fetch_latest().await {
            Ok(sample) => {
                info!(
                    provider = self.fetcher.name(),
                    observed_at = %sample.observed_at,
                    price = sample.cents_per_kwh,
                    "fetched price"
                );
                self.sink.set_price(sample.cents_per_kwh);
            }
            Err(err) => {
                self.sink.increment_failures(err.kind());
                error!(provider = self.fetcher.name(), err = %err, "error querying api");
            }
        }
    }

    fn transition(&mut self, next: SchedulerState) {
        debug!(from = ?self.state, to = ?next, "scheduler state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::async_trait;

    use super::*;
    use crate::domain::{FetchError, PriceSample};
    use crate::shutdown;

    /// Replays scripted outcomes, then keeps succeeding with the last price.
    #[derive(Clone, Default)]
    struct StubFetcher {
        script: Arc<Mutex<VecDeque<Option<f64>>>>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl StubFetcher {
        fn succeeding() -> Self {
            Self::scripted(vec![Some(1.0)])
        }

        fn scripted(script: Vec<Option<f64>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                ..Default::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceFetcher for StubFetcher {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn fetch_latest(&self) -> Result<PriceSample, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().flatten()
                } else {
                    script.front().copied().flatten()
                }
            };

            match next {
                Some(price) => Ok(PriceSample::from_epoch_millis(1_000, price).unwrap()),
                None => Err(FetchError::EmptyFeed {
                    body: "[]".to_string(),
                }),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        price: Arc<Mutex<Option<f64>>>,
        failures: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        fn price(&self) -> Option<f64> {
            *self.price.lock().unwrap()
        }

        fn failures(&self) -> Vec<String> {
            self.failures.lock().unwrap().clone()
        }
    }

    impl MetricsSink for RecordingSink {
        fn set_price(&self, cents_per_kwh: f64) {
            *self.price.lock().unwrap() = Some(cents_per_kwh);
        }

        fn increment_failures(&self, kind: &str) {
            self.failures.lock().unwrap().push(kind.to_string());
        }
    }

    const INTERVAL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn fetches_immediately_on_start() {
        let fetcher = StubFetcher::succeeding();
        let sink = RecordingSink::default();
        let (trigger, shutdown) = shutdown::channel();

        let scheduler = PollScheduler::new(fetcher.clone(), sink.clone(), INTERVAL, shutdown);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(sink.price(), Some(1.0));

        trigger.trigger();
        assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_once_per_interval() {
        let fetcher = StubFetcher::succeeding();
        let (trigger, shutdown) = shutdown::channel();

        let scheduler =
            PollScheduler::new(fetcher.clone(), RecordingSink::default(), INTERVAL, shutdown);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(fetcher.calls(), 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 5);

        trigger.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycles_never_overlap_or_burst() {
        let fetcher = StubFetcher::succeeding().with_delay(Duration::from_millis(250));
        let (trigger, shutdown) = shutdown::channel();

        let scheduler =
            PollScheduler::new(fetcher.clone(), RecordingSink::default(), INTERVAL, shutdown);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        trigger.trigger();
        handle.await.unwrap();

        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
        // Cycles start at 0, 350, 600 and 850 ms; missed ticks are not replayed.
        assert_eq!(fetcher.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn no_cycle_starts_after_cancellation() {
        let fetcher = StubFetcher::succeeding();
        let (trigger, shutdown) = shutdown::channel();

        let scheduler =
            PollScheduler::new(fetcher.clone(), RecordingSink::default(), INTERVAL, shutdown);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.trigger();
        handle.await.unwrap();
        let calls = fetcher.calls();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls, 2);
        assert_eq!(fetcher.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_cycle_completes_after_cancellation() {
        let fetcher = StubFetcher::scripted(vec![Some(7.5)]).with_delay(Duration::from_millis(200));
        let sink = RecordingSink::default();
        let (trigger, shutdown) = shutdown::channel();

        let scheduler = PollScheduler::new(fetcher.clone(), sink.clone(), INTERVAL, shutdown);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
        assert!(!handle.is_finished());

        assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(sink.price(), Some(7.5));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_start_when_already_cancelled() {
        let fetcher = StubFetcher::succeeding();
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();

        let scheduler =
            PollScheduler::new(fetcher.clone(), RecordingSink::default(), INTERVAL, shutdown);
        let state = scheduler.run().await;

        assert_eq!(state, SchedulerState::Stopped);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_the_last_price_and_counts_once() {
        let fetcher = StubFetcher::scripted(vec![Some(3.3), None, Some(4.4)]);
        let sink = RecordingSink::default();
        let (trigger, shutdown) = shutdown::channel();

        let scheduler = PollScheduler::new(fetcher.clone(), sink.clone(), INTERVAL, shutdown);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.price(), Some(3.3));
        assert!(sink.failures().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(sink.price(), Some(3.3));
        assert_eq!(sink.failures(), vec!["empty_feed".to_string()]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.price(), Some(4.4));
        assert_eq!(sink.failures().len(), 1);

        trigger.trigger();
        handle.await.unwrap();
    }
}
