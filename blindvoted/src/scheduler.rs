//! Fires the engines on a fixed schedule and makes sure only one run is ever in flight.

use crate::engine::{BatchEngine, RunReport};
use crate::records::{Authorization, PendingRecord, Registration};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Non-reentrant run flag
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

/// Held for the duration of a run. Dropping it clears the flag.
#[derive(Debug)]
pub struct FlightPermit<'a> {
    flight: &'a SingleFlight,
}

impl SingleFlight {
    /// `None` if a run is already in flight
    pub fn try_acquire(&self) -> Option<FlightPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit { flight: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

/// Reports of one scheduled tick. `None` for an engine whose run errored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub authorizations: Option<RunReport>,
    pub registrations: Option<RunReport>,
}

pub struct Scheduler {
    authorizations: BatchEngine<Authorization>,
    registrations: BatchEngine<Registration>,
    flight: SingleFlight,
    post_run_delay: Duration,
}

impl Scheduler {
    pub fn new(
        authorizations: BatchEngine<Authorization>,
        registrations: BatchEngine<Registration>,
        post_run_delay: Duration,
    ) -> Self {
        Scheduler {
            authorizations,
            registrations,
            flight: SingleFlight::default(),
            post_run_delay,
        }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Run both engines once, authorizations first, unless a run is already in flight
    pub async fn trigger(&self) -> Option<TickReport> {
        let Some(permit) = self.flight.try_acquire() else {
            tracing::debug!("previous run still in flight, skipping tick");
            return None;
        };

        let report = TickReport {
            authorizations: log_run::<Authorization>(self.authorizations.run().await),
            registrations: log_run::<Registration>(self.registrations.run().await),
        };

        drop(permit);
        tokio::time::sleep(self.post_run_delay).await;
        Some(report)
    }

    /// Trigger a run on every tick until `shutdown` resolves, then wait for every run still in
    /// flight.
    pub async fn run_until(
        self: Arc<Self>,
        interval: Duration,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut runs = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    while let Some(finished) = runs.try_join_next() {
                        log_join(finished);
                    }
                    let scheduler = Arc::clone(&self);
                    runs.spawn(async move { scheduler.trigger().await });
                }
                _ = &mut shutdown => break,
            }
        }

        if self.is_running() {
            tracing::info!("waiting for the run in flight to finish");
        }
        while let Some(finished) = runs.join_next().await {
            log_join(finished);
        }
    }
}

fn log_join(result: Result<Option<TickReport>, tokio::task::JoinError>) {
    if let Err(err) = result {
        tracing::error!("run task failed: {err}");
    }
}

fn log_run<R: PendingRecord>(result: eyre::Result<RunReport>) -> Option<RunReport> {
    match result {
        Ok(report) => Some(report),
        Err(err) => {
            tracing::error!("{} run failed: {err:?}", R::KIND.name());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{Outcome, ScriptedChain};
    use crate::engine::{EngineSettings, RunOutcome};
    use crate::fee::{FeePolicy, GWEI};
    use crate::indexer::tests::ScriptedIndexer;
    use crate::records::tests::{authorization, registration};
    use crate::records::RecordStatus;
    use crate::store::MemStore;
    use alloy::primitives::{Address, U256};

    fn engine<R: PendingRecord>(
        store: Arc<MemStore<R>>,
        chain: Arc<ScriptedChain>,
    ) -> BatchEngine<R> {
        BatchEngine::new(
            store,
            chain,
            Arc::new(ScriptedIndexer::default()),
            FeePolicy {
                max_fee_pct: 100,
                priority_fee_pct: 100,
                max_fee_ceiling: 200 * GWEI,
                max_priority_fee_ceiling: 10 * GWEI,
                gas_buffer_pct: 100,
            },
            EngineSettings {
                contract: Address::repeat_byte(0xC0),
                batch_size: 10,
                min_balance: U256::ZERO,
                low_balance: U256::ZERO,
                inter_batch_delay: Duration::from_secs(1),
                recovery_delay: Duration::from_secs(1),
                confirmation_timeout: Duration::from_secs(60),
                indexer_lookback: 10,
            },
            10,
        )
        .unwrap()
    }

    struct Fixture {
        authorizations: Arc<MemStore<Authorization>>,
        registrations: Arc<MemStore<Registration>>,
        chain: Arc<ScriptedChain>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture() -> Fixture {
        let authorizations = Arc::new(MemStore::new(vec![authorization(1, 1)]));
        let registrations = Arc::new(MemStore::new(vec![registration(1, 1)]));
        let chain = Arc::new(ScriptedChain::new());
        let scheduler = Arc::new(Scheduler::new(
            engine(authorizations.clone(), chain.clone()),
            engine(registrations.clone(), chain.clone()),
            Duration::from_secs(1),
        ));
        Fixture {
            authorizations,
            registrations,
            chain,
            scheduler,
        }
    }

    #[test]
    fn test_single_flight() {
        let flight = SingleFlight::default();
        let permit = flight.try_acquire().unwrap();
        assert!(flight.is_running());
        assert!(flight.try_acquire().is_none());
        drop(permit);
        assert!(!flight.is_running());
        assert!(flight.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_runs_both_engines() {
        let f = fixture();
        let report = f.scheduler.trigger().await.unwrap();
        assert_eq!(
            report.authorizations.unwrap().outcome,
            RunOutcome::Completed
        );
        assert_eq!(report.registrations.unwrap().batches_confirmed, 1);
        assert_eq!(f.chain.sent_count(), 2);
        assert!(!f.scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_is_a_noop() {
        let f = fixture();
        // the first run parks on its confirmation
        f.chain.script([Outcome::Hang]);

        let (first, second) = tokio::join!(f.scheduler.trigger(), f.scheduler.trigger());
        assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
        assert_eq!(f.chain.sent_count(), 2);

        assert_eq!(
            f.authorizations.get(1).unwrap().status(),
            RecordStatus::Failed
        );
        assert_eq!(
            f.registrations.get(1).unwrap().status(),
            RecordStatus::Confirmed
        );
        assert!(f.scheduler.trigger().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let f = fixture();
        let shutdown = tokio::time::sleep(Duration::from_secs(150));
        f.scheduler
            .clone()
            .run_until(Duration::from_secs(60), shutdown)
            .await;

        // the first tick did the work, later ticks found nothing pending
        assert_eq!(f.chain.sent_count(), 2);
        assert!(!f.scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_the_run_in_flight() {
        let f = fixture();
        // the authorization batch outlives several ticks and the shutdown
        f.chain.script([Outcome::Hang]);
        let shutdown = tokio::time::sleep(Duration::from_secs(30));
        f.scheduler
            .clone()
            .run_until(Duration::from_secs(10), shutdown)
            .await;

        assert!(!f.scheduler.is_running());
        assert_eq!(
            f.authorizations.get(1).unwrap().status(),
            RecordStatus::Failed
        );
        assert_eq!(
            f.registrations.get(1).unwrap().status(),
            RecordStatus::Confirmed
        );
        assert_eq!(f.chain.sent_count(), 2);
    }
}
