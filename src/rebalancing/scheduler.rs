//! When rebalance rounds start.
//!
//! With a zero delay (or a forced call) a plan is processed right away. With a
//! positive delay the scheduler arms a single timer; when it fires, and once the
//! last exchange has finished, it asks the exchange manager for a preload
//! exchange, which comes back as a forced plan. Without a delay rebalancing
//! only starts through [`RebalanceScheduler::force_preload`].

use crate::error::{Error, Result};
use crate::rebalancing::exchange::{ExchangeHandle, ExchangeManager};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// How a new plan should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Process the plan now.
    Immediate,
    /// Arm the delay timer.
    Delayed(Duration),
    /// Do nothing until forced.
    Manual,
}

/// A pending delay timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    fn is_pending(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Decides when rounds start and owns the delay timer.
pub struct RebalanceScheduler {
    delay: Option<Duration>,
    exchange_manager: Arc<dyn ExchangeManager>,
    last_exchange: Mutex<Option<ExchangeHandle>>,
    timer: Mutex<Option<TimerHandle>>,
}

impl RebalanceScheduler {
    pub fn new(delay: Option<Duration>, exchange_manager: Arc<dyn ExchangeManager>) -> Self {
        Self {
            delay,
            exchange_manager,
            last_exchange: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// How a plan is handled given `force`.
    pub fn start_mode(&self, force: bool) -> StartMode {
        match self.delay {
            _ if force => StartMode::Immediate,
            Some(delay) if delay.is_zero() => StartMode::Immediate,
            Some(delay) => StartMode::Delayed(delay),
            None => StartMode::Manual,
        }
    }

    /// Remember the most recent exchange.
    pub fn update_last_exchange(&self, exchange: ExchangeHandle) {
        *self.last_exchange.lock() = Some(exchange);
    }

    /// The most recent exchange, if any.
    pub fn last_exchange(&self) -> Option<ExchangeHandle> {
        self.last_exchange.lock().clone()
    }

    /// Arm the delay timer, replacing any pending one.
    ///
    /// Fails if no exchange has been recorded yet: a delayed round is always
    /// the consequence of a topology event.
    pub fn schedule_delayed(&self, delay: Duration) -> Result<()> {
        let exchange = self.last_exchange().ok_or_else(|| {
            Error::Invariant("delaying rebalance process without topology event".to_string())
        })?;

        let manager = self.exchange_manager.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(
                topology = %exchange.topology_version(),
                "Rebalance delay elapsed"
            );
            let fired = exchange.clone();
            exchange.on_done(move |_| manager.force_preload_exchange(&fired));
        });

        self.install(TimerHandle { task });
        Ok(())
    }

    /// Cancel the timer and force a preload exchange once the last exchange
    /// is done.
    pub fn force_preload(&self) {
        self.cancel_timer();

        match self.last_exchange() {
            Some(exchange) => {
                debug!(
                    topology = %exchange.topology_version(),
                    "Forcing rebalance event for exchange"
                );
                let manager = self.exchange_manager.clone();
                let fired = exchange.clone();
                exchange.on_done(move |_| manager.force_preload_exchange(&fired));
            }
            None => {
                debug!("Ignoring force rebalance request (no topology event happened yet)");
            }
        }
    }

    /// Cancel the pending timer. Returns whether one was armed.
    pub fn cancel_timer(&self) -> bool {
        self.timer.lock().take().is_some()
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn has_pending_timer(&self) -> bool {
        self.timer.lock().as_ref().map_or(false, TimerHandle::is_pending)
    }

    /// Forget the last exchange and cancel the timer.
    pub fn stop(&self) {
        self.last_exchange.lock().take();
        self.cancel_timer();
    }

    fn install(&self, handle: TimerHandle) {
        // The previous handle is dropped, and thereby aborted, under the lock.
        *self.timer.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancing::exchange::{DiscoveryEvent, DiscoveryEventKind};
    use crate::types::TopologyVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingManager {
        preload: AtomicUsize,
    }

    impl ExchangeManager for CountingManager {
        fn force_preload_exchange(&self, _exchange: &ExchangeHandle) {
            self.preload.fetch_add(1, Ordering::SeqCst);
        }

        fn force_dummy_exchange(&self, _reassign: bool, _exchange: &ExchangeHandle) {}
    }

    fn exchange(done: bool) -> ExchangeHandle {
        let event = DiscoveryEvent::new(2, DiscoveryEventKind::NodeJoined);
        if done {
            ExchangeHandle::completed(TopologyVersion::new(2, 0), event)
        } else {
            ExchangeHandle::new(TopologyVersion::new(2, 0), event)
        }
    }

    #[test]
    fn test_start_mode() {
        let manager = Arc::new(CountingManager::default());

        let immediate = RebalanceScheduler::new(Some(Duration::ZERO), manager.clone());
        assert_eq!(immediate.start_mode(false), StartMode::Immediate);

        let delayed = RebalanceScheduler::new(Some(Duration::from_secs(1)), manager.clone());
        assert_eq!(
            delayed.start_mode(false),
            StartMode::Delayed(Duration::from_secs(1))
        );
        assert_eq!(delayed.start_mode(true), StartMode::Immediate);

        let manual = RebalanceScheduler::new(None, manager);
        assert_eq!(manual.start_mode(false), StartMode::Manual);
        assert_eq!(manual.start_mode(true), StartMode::Immediate);
    }

    #[tokio::test]
    async fn test_delay_without_exchange_is_invariant_violation() {
        let scheduler = RebalanceScheduler::new(
            Some(Duration::from_secs(1)),
            Arc::new(CountingManager::default()),
        );
        let err = scheduler
            .schedule_delayed(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_timer_cancels_previous() {
        let manager = Arc::new(CountingManager::default());
        let scheduler = RebalanceScheduler::new(Some(Duration::from_secs(5)), manager.clone());
        scheduler.update_last_exchange(exchange(true));

        scheduler.schedule_delayed(Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.schedule_delayed(Duration::from_secs(5)).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.preload.load(Ordering::SeqCst), 0);
        assert!(scheduler.has_pending_timer());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.preload.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_waits_for_exchange() {
        let manager = Arc::new(CountingManager::default());
        let scheduler = RebalanceScheduler::new(Some(Duration::from_secs(1)), manager.clone());
        let pending = exchange(false);
        scheduler.update_last_exchange(pending.clone());

        scheduler.schedule_delayed(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.preload.load(Ordering::SeqCst), 0);

        pending.complete();
        assert_eq!(manager.preload.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let manager = Arc::new(CountingManager::default());
        let scheduler = RebalanceScheduler::new(Some(Duration::from_secs(1)), manager.clone());
        scheduler.update_last_exchange(exchange(true));
        scheduler.schedule_delayed(Duration::from_secs(1)).unwrap();

        scheduler.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(manager.preload.load(Ordering::SeqCst), 0);
        assert!(scheduler.last_exchange().is_none());
    }

    #[tokio::test]
    async fn test_force_preload() {
        let manager = Arc::new(CountingManager::default());
        let scheduler = RebalanceScheduler::new(None, manager.clone());

        scheduler.force_preload();
        assert_eq!(manager.preload.load(Ordering::SeqCst), 0);

        scheduler.update_last_exchange(exchange(true));
        scheduler.force_preload();
        assert_eq!(manager.preload.load(Ordering::SeqCst), 1);
    }
}
