//! The batch engine: drains the pending backlog of one record kind into contract calls.
//!
//! One engine exists per record kind. Each run is strictly sequential, election by election and
//! batch by batch, so a single signer never races its own nonces.

use crate::cache::ProcessedCache;
use crate::chain::{fee_suggestion, BatchCall, ChainService, PendingSubmission};
use crate::config::ConfigError;
use crate::fee::{FeePolicy, FeePolicyError, Fees};
use crate::indexer::{IndexerService, OnChainEvent};
use crate::records::{PendingRecord, RecordStatus};
use crate::store::PendingStoreService;
use alloy::primitives::{Address, B256, U256};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{instrument, Instrument as _};

/// Per-engine knobs, derived from the daemon config
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Contract every batch call goes to
    pub contract: Address,
    pub batch_size: usize,
    pub min_balance: U256,
    pub low_balance: U256,
    pub inter_batch_delay: Duration,
    pub recovery_delay: Duration,
    pub confirmation_timeout: Duration,
    /// How many recent on-chain events to cross-check per election
    pub indexer_lookback: usize,
}

/// Why a batch was not sent. Only this batch is dropped; the election carries on.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    FeePolicy(#[from] FeePolicyError),
    #[error("could not read fee data: {0:#}")]
    FeeData(eyre::Report),
    #[error("gas estimation failed: {0:#}")]
    GasEstimate(eyre::Report),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The backlog was processed
    Completed,
    /// Nothing was pending
    Idle,
    /// The signer balance is below the minimum; nothing was sent
    InsufficientBalance,
}

/// What one run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub batches_submitted: usize,
    pub batches_confirmed: usize,
    pub batches_failed: usize,
    pub batches_skipped: usize,
    /// Pending records dropped because the cache or the indexer showed them as already submitted
    pub records_filtered: usize,
    pub elections_failed: usize,
}

impl RunReport {
    fn new(outcome: RunOutcome) -> Self {
        RunReport {
            outcome,
            batches_submitted: 0,
            batches_confirmed: 0,
            batches_failed: 0,
            batches_skipped: 0,
            records_filtered: 0,
            elections_failed: 0,
        }
    }
}

struct PreparedBatch {
    call: BatchCall,
    gas_limit: u64,
    fees: Fees,
}

pub struct BatchEngine<R: PendingRecord> {
    store: PendingStoreService<R>,
    chain: ChainService,
    indexer: IndexerService,
    cache: Mutex<ProcessedCache>,
    fee_policy: FeePolicy,
    settings: EngineSettings,
}

impl<R: PendingRecord> BatchEngine<R> {
    /// Fails if `settings.batch_size` is not greater than 1
    pub fn new(
        store: PendingStoreService<R>,
        chain: ChainService,
        indexer: IndexerService,
        fee_policy: FeePolicy,
        settings: EngineSettings,
        max_cache_entries: usize,
    ) -> Result<Self, ConfigError> {
        if settings.batch_size <= 1 {
            return Err(ConfigError::BatchSize(settings.batch_size));
        }
        Ok(BatchEngine {
            store,
            chain,
            indexer,
            cache: Mutex::new(ProcessedCache::new(max_cache_entries)),
            fee_policy,
            settings,
        })
    }

    /// Process the whole backlog once.
    ///
    /// Only a failing balance or backlog read ends the run with an error. Failures inside an
    /// election are logged and counted in the report.
    #[instrument(level = "info", skip_all, fields(kind = R::KIND.name()))]
    pub async fn run(&self) -> eyre::Result<RunReport> {
        let signer = self.chain.signer();
        let balance = self.chain.get_balance(signer).await?;
        if balance < self.settings.min_balance {
            tracing::error!(
                "signer {signer} balance {balance} wei is below the minimum of {} wei, skipping run",
                self.settings.min_balance
            );
            return Ok(RunReport::new(RunOutcome::InsufficientBalance));
        }
        if balance < self.settings.low_balance {
            tracing::warn!("signer {signer} balance is low: {balance} wei");
        }

        let backlog = self.store.get_pending().await?;
        if backlog.is_empty() {
            tracing::debug!("no pending records");
            return Ok(RunReport::new(RunOutcome::Idle));
        }

        let mut report = RunReport::new(RunOutcome::Completed);

        self.cache.lock().evict_oldest();
        let total = backlog.len();
        let records = self.prefilter(backlog);
        if records.len() != total {
            tracing::warn!(
                "{} of {total} pending records were already submitted by this process",
                total - records.len()
            );
            report.records_filtered += total - records.len();
        }

        for (election_id, records) in group_by_election(records) {
            let span = tracing::info_span!("election", election_id);
            let result = self
                .process_election(election_id, records, &mut report)
                .instrument(span)
                .await;
            if let Err(err) = result {
                tracing::error!("election {election_id} failed: {err:?}");
                report.elections_failed += 1;
                tokio::time::sleep(self.settings.recovery_delay).await;
            }
        }

        tracing::info!(
            "run complete: {} submitted, {} confirmed, {} failed, {} skipped",
            report.batches_submitted,
            report.batches_confirmed,
            report.batches_failed,
            report.batches_skipped
        );
        Ok(report)
    }

    /// Drop records this process already submitted. Repeated calls with an unchanged cache agree.
    pub(crate) fn prefilter(&self, records: Vec<R>) -> Vec<R> {
        let cache = self.cache.lock();
        records.into_iter().filter(|r| !cache.contains(r)).collect()
    }

    async fn process_election(
        &self,
        election_id: u64,
        records: Vec<R>,
        report: &mut RunReport,
    ) -> eyre::Result<()> {
        let events = match self
            .indexer
            .fetch_recent(R::KIND, election_id, self.settings.indexer_lookback)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!("indexer unavailable, continuing without on-chain check: {err:#}");
                Vec::new()
            }
        };

        let total = records.len();
        let records = cross_filter(records, &events);
        report.records_filtered += total - records.len();
        if records.is_empty() {
            tracing::debug!("nothing left to submit");
            return Ok(());
        }

        for (index, batch) in records.chunks(self.settings.batch_size).enumerate() {
            match self.prepare_batch(election_id, batch).await {
                Ok(prepared) => {
                    let batch_id = batch_id(election_id, index);
                    self.broadcast(&batch_id, election_id, batch, &prepared, report)
                        .await?;
                }
                Err(err) => {
                    tracing::warn!("skipping batch {index} of {} records: {err}", batch.len());
                    report.batches_skipped += 1;
                }
            }
            tokio::time::sleep(self.settings.inter_batch_delay).await;
        }
        Ok(())
    }

    /// Price the batch call. An error drops only this batch.
    async fn prepare_batch(
        &self,
        election_id: u64,
        batch: &[R],
    ) -> Result<PreparedBatch, BatchError> {
        let suggestion = fee_suggestion(self.chain.as_ref())
            .await
            .map_err(BatchError::FeeData)?;
        let fees = self.fee_policy.adjust(&suggestion)?;

        let call = BatchCall {
            to: self.settings.contract,
            data: R::encode_batch(election_id, batch),
        };
        let estimate = self
            .chain
            .estimate_gas(&call)
            .await
            .map_err(BatchError::GasEstimate)?;

        Ok(PreparedBatch {
            gas_limit: self.fee_policy.gas_limit(estimate),
            call,
            fees,
        })
    }

    /// Send one batch and follow it to a terminal status.
    ///
    /// Chain failures end up as record statuses. Store failures are returned, but only after
    /// every record of a broadcast batch had its terminal status attempted.
    async fn broadcast(
        &self,
        batch_id: &str,
        election_id: u64,
        batch: &[R],
        prepared: &PreparedBatch,
        report: &mut RunReport,
    ) -> eyre::Result<()> {
        let sent = self
            .chain
            .send_transaction(&prepared.call, prepared.gas_limit, &prepared.fees)
            .await;
        let pending = match sent {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!("broadcast of batch {batch_id} failed: {err:#}");
                report.batches_failed += 1;
                let stuck = self
                    .mark(batch, RecordStatus::Failed, None, Some(batch_id))
                    .await;
                return unmarked::<R>(stuck, RecordStatus::Failed);
            }
        };

        let tx_hash = pending.tx_hash();
        // cached before the outcome is known so a slow receipt never leads to a resend
        self.cache.lock().insert(batch_id, election_id, batch);
        let unsubmitted: HashSet<i64> = self
            .mark(batch, RecordStatus::Submitted, Some(tx_hash), Some(batch_id))
            .await
            .into_iter()
            .collect();
        report.batches_submitted += 1;
        tracing::info!(
            "batch {batch_id} of {} records sent in {tx_hash}",
            batch.len()
        );

        let status = if self.confirm(batch_id, pending).await {
            report.batches_confirmed += 1;
            RecordStatus::Confirmed
        } else {
            report.batches_failed += 1;
            RecordStatus::Failed
        };

        let mut stuck = Vec::new();
        for record in batch {
            let id = record.id();
            if unsubmitted.contains(&id) {
                // pending may go straight to failed but never to confirmed
                let retried = self
                    .store
                    .update_status(id, RecordStatus::Submitted, Some(tx_hash), Some(batch_id))
                    .await;
                if retried.is_err() && status == RecordStatus::Confirmed {
                    tracing::error!("{} {id} is confirmed on chain but stays pending", R::KIND.name());
                    stuck.push(id);
                    continue;
                }
            }
            let result = self
                .store
                .update_status(id, status, Some(tx_hash), Some(batch_id))
                .await;
            if let Err(err) = result {
                tracing::error!("could not mark {} {id} {status}: {err:#}", R::KIND.name());
                stuck.push(id);
            }
        }
        unmarked::<R>(stuck, status)
    }

    /// `true` iff the receipt arrived in time and reports success
    async fn confirm(&self, batch_id: &str, pending: Box<dyn PendingSubmission>) -> bool {
        let timeout = self.settings.confirmation_timeout;
        match tokio::time::timeout(timeout, pending.confirm()).await {
            Ok(Ok(true)) => {
                tracing::info!("batch {batch_id} confirmed");
                true
            }
            Ok(Ok(false)) => {
                tracing::error!("batch {batch_id} reverted");
                false
            }
            Ok(Err(err)) => {
                tracing::error!("batch {batch_id} could not be confirmed: {err:#}");
                false
            }
            Err(_) => {
                tracing::error!(
                    "batch {batch_id} not confirmed within {}",
                    humantime::format_duration(timeout)
                );
                false
            }
        }
    }

    /// Update every record of the batch, returning the ids whose update failed
    async fn mark(
        &self,
        batch: &[R],
        status: RecordStatus,
        tx_hash: Option<B256>,
        batch_id: Option<&str>,
    ) -> Vec<i64> {
        let mut failed = Vec::new();
        for record in batch {
            let id = record.id();
            let result = self
                .store
                .update_status(id, status, tx_hash, batch_id)
                .await;
            if let Err(err) = result {
                tracing::error!("could not mark {} {id} {status}: {err:#}", R::KIND.name());
                failed.push(id);
            }
        }
        failed
    }
}

fn unmarked<R: PendingRecord>(ids: Vec<i64>, status: RecordStatus) -> eyre::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    eyre::bail!(
        "{} records {ids:?} could not be marked {status}",
        R::KIND.name()
    )
}

/// `<unix seconds>-<election>-<batch index>`
fn batch_id(election_id: u64, index: usize) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{secs}-{election_id}-{index}")
}

/// Group by election, keeping first-seen election order and record order within each
fn group_by_election<R: PendingRecord>(records: Vec<R>) -> IndexMap<u64, Vec<R>> {
    let mut groups: IndexMap<u64, Vec<R>> = IndexMap::new();
    for record in records {
        groups.entry(record.election_id()).or_default().push(record);
    }
    groups
}

/// Drop records the indexer already reports on chain
fn cross_filter<R: PendingRecord>(records: Vec<R>, events: &[OnChainEvent]) -> Vec<R> {
    if events.is_empty() {
        return records;
    }
    let voters: HashSet<&str> = events
        .iter()
        .flat_map(|e| e.voter_ids.iter().map(String::as_str))
        .collect();
    let fingerprints: HashSet<&str> = events
        .iter()
        .flat_map(|e| e.fingerprints.iter().map(String::as_str))
        .collect();

    records
        .into_iter()
        .filter(|record| {
            let on_chain = voters.contains(record.voter_id().as_str())
                || record
                    .fingerprints()
                    .iter()
                    .any(|f| fingerprints.contains(f.as_str()));
            if on_chain {
                // left as is; an operator decides whether to close it
                tracing::warn!(
                    "{} {} is already on chain but still pending locally",
                    R::KIND.name(),
                    record.id()
                );
            }
            !on_chain
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{Outcome, ScriptedChain};
    use crate::fee::GWEI;
    use crate::indexer::tests::ScriptedIndexer;
    use crate::records::tests::{authorization, registration};
    use crate::records::{authorizeVotersCall, Authorization, Registration};
    use crate::store::{MemStore, PendingStore};
    use alloy::sol_types::SolCall as _;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn settings(batch_size: usize) -> EngineSettings {
        EngineSettings {
            contract: Address::repeat_byte(0xC0),
            batch_size,
            min_balance: U256::from(10u64.pow(16)),
            low_balance: U256::from(10u64.pow(17)),
            inter_batch_delay: Duration::from_secs(1),
            recovery_delay: Duration::from_secs(5),
            confirmation_timeout: Duration::from_secs(120),
            indexer_lookback: 100,
        }
    }

    fn policy() -> FeePolicy {
        FeePolicy {
            max_fee_pct: 120,
            priority_fee_pct: 120,
            max_fee_ceiling: 200 * GWEI,
            max_priority_fee_ceiling: 10 * GWEI,
            gas_buffer_pct: 120,
        }
    }

    struct Harness<R: PendingRecord> {
        store: Arc<MemStore<R>>,
        chain: Arc<ScriptedChain>,
        indexer: Arc<ScriptedIndexer>,
        engine: BatchEngine<R>,
    }

    fn harness<R: PendingRecord>(records: Vec<R>, batch_size: usize) -> Harness<R> {
        let store = Arc::new(MemStore::new(records));
        let chain = Arc::new(ScriptedChain::new());
        let indexer = Arc::new(ScriptedIndexer::default());
        let engine = BatchEngine::new(
            store.clone(),
            chain.clone(),
            indexer.clone(),
            policy(),
            settings(batch_size),
            100,
        )
        .unwrap();
        Harness {
            store,
            chain,
            indexer,
            engine,
        }
    }

    fn statuses<R: PendingRecord>(store: &MemStore<R>, ids: &[i64]) -> Vec<RecordStatus> {
        ids.iter()
            .map(|id| store.get(*id).unwrap().status())
            .collect()
    }

    fn sent_voters(chain: &ScriptedChain) -> Vec<Vec<Address>> {
        chain
            .sent
            .lock()
            .iter()
            .map(|(call, _, _)| authorizeVotersCall::abi_decode(&call.data).unwrap().voters)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_confirmed() {
        let h = harness((1..=3).map(|i| authorization(i, 1)).collect(), 3);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.batches_submitted, 1);
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(statuses(&h.store, &[1, 2, 3]), vec![RecordStatus::Confirmed; 3]);

        let first = h.store.get(1).unwrap();
        assert!(first.state.tx_hash.is_some());
        for id in 2..=3 {
            let other = h.store.get(id).unwrap();
            assert_eq!(other.state.tx_hash, first.state.tx_hash);
            assert_eq!(other.state.batch_id, first.state.batch_id);
        }

        let sent = h.chain.sent.lock();
        let (call, gas_limit, fees) = &sent[0];
        assert_eq!(call.to, Address::repeat_byte(0xC0));
        assert_eq!(*gas_limit, 120_000);
        assert_eq!(fees.max_fee_per_gas, 36 * GWEI);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_batch_fails_every_record() {
        let h = harness((1..=3).map(|i| authorization(i, 1)).collect(), 3);
        h.chain.script([Outcome::Reverted]);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.batches_failed, 1);
        assert_eq!(statuses(&h.store, &[1, 2, 3]), vec![RecordStatus::Failed; 3]);
        // the hash of the reverted transaction is kept for the operator
        assert!(h.store.get(1).unwrap().state.tx_hash.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_and_receipt_error() {
        let h = harness((1..=4).map(|i| authorization(i, 1)).collect(), 2);
        h.chain.script([Outcome::Hang, Outcome::ReceiptError]);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.batches_submitted, 2);
        assert_eq!(report.batches_failed, 2);
        assert_eq!(
            statuses(&h.store, &[1, 2, 3, 4]),
            vec![RecordStatus::Failed; 4]
        );

        // failed records are not retried by the next run
        let report = h.engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Idle);
        assert_eq!(h.chain.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_error() {
        let h = harness((1..=2).map(|i| authorization(i, 1)).collect(), 2);
        h.chain.script([Outcome::BroadcastError]);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.batches_submitted, 0);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(statuses(&h.store, &[1, 2]), vec![RecordStatus::Failed; 2]);
        assert_eq!(h.store.get(1).unwrap().state.tx_hash, None);

        // nothing reached the chain, so a re-queued record goes out again
        h.store.requeue(1).unwrap();
        let report = h.engine.run().await.unwrap();
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(h.store.get(1).unwrap().status(), RecordStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_split_preserves_order() {
        let records: Vec<_> = (1..=7).map(|i| authorization(i, 1)).collect();
        let addresses: Vec<_> = records.iter().map(|r| r.voter_address).collect();
        let h = harness(records, 3);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.batches_confirmed, 3);

        let batches = sent_voters(&h.chain);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches.concat(), addresses);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elections_batched_separately() {
        let records = vec![
            authorization(1, 1),
            authorization(2, 2),
            authorization(3, 1),
        ];
        let h = harness(records, 10);

        h.engine.run().await.unwrap();
        let sent = h.chain.sent.lock();
        assert_eq!(sent.len(), 2);
        let first = authorizeVotersCall::abi_decode(&sent[0].0.data).unwrap();
        assert_eq!(first.electionId, U256::from(1u64));
        assert_eq!(first.voters.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefilter() {
        let h = harness((1..=3).map(|i| authorization(i, 1)).collect(), 3);
        h.engine.run().await.unwrap();

        // a record that found its way back to pending is caught by the cache
        h.store.requeue(2).unwrap();
        h.store.insert(authorization(4, 1));
        let backlog = h.store.get_pending().await.unwrap();
        let once = h.engine.prefilter(backlog.clone());
        let twice = h.engine.prefilter(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4]);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.records_filtered, 1);
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(h.store.get(2).unwrap().status(), RecordStatus::Pending);
        assert_eq!(sent_voters(&h.chain)[1], vec![authorization(4, 1).voter_address]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_fingerprint_dedup() {
        let submitted = registration(1, 3);
        let h = harness(vec![submitted.clone()], 2);
        h.engine.run().await.unwrap();

        let mut replay = registration(2, 3);
        replay.blind_signature = submitted.blind_signature.clone();
        h.store.insert(replay);

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.records_filtered, 1);
        assert_eq!(h.chain.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_miss_indexer_hit() {
        // a fresh engine has an empty cache, as after a restart
        let records: Vec<_> = (1..=3).map(|i| authorization(i, 1)).collect();
        let h = harness(records.clone(), 5);
        h.indexer.events.lock().push(OnChainEvent {
            voter_ids: vec![records[1].voter_id()],
            fingerprints: Vec::new(),
        });

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.records_filtered, 1);
        assert_eq!(
            sent_voters(&h.chain),
            vec![vec![records[0].voter_address, records[2].voter_address]]
        );
        assert_eq!(h.store.get(2).unwrap().status(), RecordStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indexer_failure_is_not_fatal() {
        let h = harness(vec![authorization(1, 1)], 2);
        *h.indexer.fail.lock() = true;

        let report = h.engine.run().await.unwrap();
        assert_eq!(*h.indexer.calls.lock(), 1);
        assert_eq!(report.elections_failed, 0);
        assert_eq!(report.batches_confirmed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fee_ceiling_skips_batch() {
        let h = harness((1..=2).map(|i| authorization(i, 1)).collect(), 2);
        *h.chain.fee_data.lock() = (Some(500 * GWEI), Some(GWEI));

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.batches_skipped, 1);
        assert_eq!(h.chain.sent_count(), 0);
        assert_eq!(statuses(&h.store, &[1, 2]), vec![RecordStatus::Pending; 2]);

        // missing fee data and a failing estimate skip the same way
        *h.chain.fee_data.lock() = (None, None);
        assert_eq!(h.engine.run().await.unwrap().batches_skipped, 1);
        *h.chain.fee_data.lock() = (Some(30 * GWEI), Some(GWEI));
        *h.chain.gas_estimate.lock() = Err(eyre::eyre!("execution reverted"));
        assert_eq!(h.engine.run().await.unwrap().batches_skipped, 1);
        assert_eq!(h.chain.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_gate() {
        let h = harness(vec![authorization(1, 1)], 2);
        *h.chain.balance.lock() = U256::from(10u64.pow(15));

        let report = h.engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::InsufficientBalance);
        assert_eq!(h.chain.sent_count(), 0);

        // low but above the minimum only warns
        *h.chain.balance.lock() = U256::from(5 * 10u64.pow(16));
        let report = h.engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.batches_confirmed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle() {
        let h = harness(Vec::<Authorization>::new(), 2);
        let report = h.engine.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Idle);
        assert_eq!(*h.indexer.calls.lock(), 0);
    }

    #[test]
    fn test_batch_size_must_exceed_one() {
        for batch_size in [0, 1] {
            let built = BatchEngine::<Authorization>::new(
                Arc::new(MemStore::default()),
                Arc::new(ScriptedChain::new()),
                Arc::new(ScriptedIndexer::default()),
                policy(),
                settings(batch_size),
                100,
            );
            assert!(matches!(built, Err(ConfigError::BatchSize(n)) if n == batch_size));
        }
    }

    /// Store whose updates fail for chosen records, always or just once
    #[derive(Default)]
    struct FlakyStore {
        inner: MemStore<Registration>,
        broken: HashSet<i64>,
        fail_once: Mutex<HashSet<i64>>,
    }

    impl FlakyStore {
        fn engine(
            self: &Arc<Self>,
            chain: &Arc<ScriptedChain>,
            batch_size: usize,
        ) -> BatchEngine<Registration> {
            BatchEngine::new(
                self.clone(),
                chain.clone(),
                Arc::new(ScriptedIndexer::default()),
                policy(),
                settings(batch_size),
                100,
            )
            .unwrap()
        }
    }

    #[async_trait]
    impl PendingStore<Registration> for FlakyStore {
        async fn get_pending(&self) -> eyre::Result<Vec<Registration>> {
            self.inner.get_pending().await
        }

        async fn update_status(
            &self,
            id: i64,
            status: RecordStatus,
            tx_hash: Option<B256>,
            batch_id: Option<&str>,
        ) -> eyre::Result<()> {
            if self.broken.contains(&id) || self.fail_once.lock().remove(&id) {
                eyre::bail!("database is locked");
            }
            self.inner.update_status(id, status, tx_hash, batch_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_failure_is_contained() {
        let store = Arc::new(FlakyStore {
            inner: MemStore::new(vec![registration(1, 1), registration(2, 2)]),
            broken: HashSet::from([1]),
            ..Default::default()
        });
        let chain = Arc::new(ScriptedChain::new());
        let engine = store.engine(&chain, 2);

        let report = engine.run().await.unwrap();
        assert_eq!(report.elections_failed, 1);
        // both transactions landed; only the bookkeeping of the first failed
        assert_eq!(report.batches_confirmed, 2);
        assert_eq!(
            store.inner.get(2).unwrap().status(),
            RecordStatus::Confirmed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_mid_batch_still_settles_the_batch() {
        let store = Arc::new(FlakyStore {
            inner: MemStore::new((1..=3).map(|i| registration(i, 1))),
            broken: HashSet::from([2]),
            ..Default::default()
        });
        let chain = Arc::new(ScriptedChain::new());
        let engine = store.engine(&chain, 3);

        let report = engine.run().await.unwrap();
        assert_eq!(chain.sent_count(), 1);
        assert_eq!(report.batches_submitted, 1);
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(report.elections_failed, 1);
        assert_eq!(
            statuses(&store.inner, &[1, 2, 3]),
            vec![
                RecordStatus::Confirmed,
                RecordStatus::Pending,
                RecordStatus::Confirmed
            ]
        );

        // the batch is cached, so the record that could not be marked is not sent again
        let report = engine.run().await.unwrap();
        assert_eq!(report.records_filtered, 1);
        assert_eq!(chain.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_batch_with_store_failure_leaves_nothing_submitted() {
        let store = Arc::new(FlakyStore {
            inner: MemStore::new((1..=3).map(|i| registration(i, 1))),
            broken: HashSet::from([2]),
            ..Default::default()
        });
        let chain = Arc::new(ScriptedChain::new());
        chain.script([Outcome::Reverted]);
        let engine = store.engine(&chain, 3);

        let report = engine.run().await.unwrap();
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.elections_failed, 1);
        assert_eq!(
            statuses(&store.inner, &[1, 2, 3]),
            vec![
                RecordStatus::Failed,
                RecordStatus::Pending,
                RecordStatus::Failed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_failure_is_recovered() {
        let store = Arc::new(FlakyStore {
            inner: MemStore::new((1..=3).map(|i| registration(i, 1))),
            fail_once: Mutex::new(HashSet::from([2])),
            ..Default::default()
        });
        let chain = Arc::new(ScriptedChain::new());
        let engine = store.engine(&chain, 3);

        let report = engine.run().await.unwrap();
        assert_eq!(report.elections_failed, 0);
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(
            statuses(&store.inner, &[1, 2, 3]),
            vec![RecordStatus::Confirmed; 3]
        );
        assert!(store.inner.get(2).unwrap().state.tx_hash.is_some());
    }
}
