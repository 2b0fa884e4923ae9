//! blindvoted
//!
//! Periodically batches pending voter authorizations and registrations onto the chain.
//! One [`engine::BatchEngine`] runs per record kind, both driven by a single-flight
//! [`scheduler::Scheduler`].

use std::sync::Arc;

use crate::chain::{AlloyChain, ChainService};
use crate::config::Config;
use crate::db::SqlStore;
use crate::engine::BatchEngine;
use crate::indexer::{IndexerService, SubgraphIndexer};
use crate::scheduler::Scheduler;

pub mod cache;
pub mod chain;
pub mod config;
pub mod db;
pub mod engine;
pub mod fee;
pub mod indexer;
pub mod records;
pub mod scheduler;
pub mod store;

/// Connect the collaborators, check the signer can pay, and run until `shutdown` resolves
pub async fn start(
    config: Config,
    shutdown: impl std::future::Future<Output = ()>,
) -> eyre::Result<()> {
    tracing::info!("starting with config: {config:#?}");

    let store = Arc::new(SqlStore::connect(&config.database_url).await?);
    let chain: ChainService = Arc::new(AlloyChain::connect(&config.rpc_url, &config.signer_key)?);
    let indexer: IndexerService = Arc::new(SubgraphIndexer::new(
        &config.indexer_url,
        config.indexer_timeout,
    )?);

    let signer = chain.signer();
    let balance = chain.get_balance(signer).await?;
    tracing::info!("signer {signer} holds {balance} wei");
    if balance < config.min_balance_wei {
        eyre::bail!(
            "signer balance {balance} wei is below the minimum of {} wei",
            config.min_balance_wei
        );
    }

    let authorizations = BatchEngine::new(
        store.clone(),
        Arc::clone(&chain),
        Arc::clone(&indexer),
        config.fee_policy(),
        config.engine_settings(config.authorization_contract),
        config.max_cache_entries,
    )?;
    let registrations = BatchEngine::new(
        store,
        chain,
        indexer,
        config.fee_policy(),
        config.engine_settings(config.registration_contract),
        config.max_cache_entries,
    )?;

    let scheduler = Arc::new(Scheduler::new(
        authorizations,
        registrations,
        config.post_run_delay,
    ));
    tracing::info!(
        "running every {}",
        humantime::format_duration(config.job_interval)
    );
    scheduler.run_until(config.job_interval, shutdown).await;
    Ok(())
}

/// Resolves on ctrl-c
pub async fn default_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
