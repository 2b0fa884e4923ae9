//! Daemon configuration, from command line arguments or `BLINDVOTED_*` environment variables.

use crate::engine::EngineSettings;
use crate::fee::{FeePolicy, GWEI};
use alloy::primitives::{Address, U256};
use clap::Parser;
use secrecy::SecretString;
use std::time::Duration;

/// Largest fee ceiling accepted, in gwei. Anything above is a typo.
pub const FEE_CEILING_SANITY_CAP_GWEI: u64 = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch size must be greater than 1, got {0}")]
    BatchSize(usize),
    #[error("{name} of {value} gwei exceeds the sanity cap of {FEE_CEILING_SANITY_CAP_GWEI} gwei")]
    FeeCeiling { name: &'static str, value: u64 },
    #[error("{0} must be greater than 0")]
    Zero(&'static str),
    #[error("gas buffer must be at least 100%, got {0}%")]
    GasBuffer(u64),
    #[error("low balance threshold must not be below the minimum balance")]
    BalanceThresholds,
}

#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Config {
    /// HTTP rpc url of the chain
    #[clap(
        long,
        env = "BLINDVOTED_RPC_URL",
        default_value = "http://127.0.0.1:8545"
    )]
    pub rpc_url: SecretString,

    /// Private key of the account that sends batch transactions
    #[clap(long, env = "BLINDVOTED_SIGNER_KEY")]
    pub signer_key: SecretString,

    /// Contract receiving `authorizeVoters` batches
    #[clap(long, env = "BLINDVOTED_AUTHORIZATION_CONTRACT")]
    pub authorization_contract: Address,

    /// Contract receiving `registerVoters` batches
    #[clap(long, env = "BLINDVOTED_REGISTRATION_CONTRACT")]
    pub registration_contract: Address,

    /// GraphQL endpoint of the subgraph indexing both contracts
    #[clap(long, env = "BLINDVOTED_INDEXER_URL")]
    pub indexer_url: String,

    /// Timeout of a single indexer query
    #[clap(
        long,
        env = "BLINDVOTED_INDEXER_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub indexer_timeout: Duration,

    /// How many recent on-chain events to cross-check per election
    #[clap(long, env = "BLINDVOTED_INDEXER_LOOKBACK", default_value = "100")]
    pub indexer_lookback: usize,

    /// Pending-record database
    #[clap(
        long,
        env = "BLINDVOTED_DATABASE_URL",
        default_value = "sqlite://blindvoted.db"
    )]
    pub database_url: String,

    /// Records per batch transaction
    #[clap(long, env = "BLINDVOTED_BATCH_SIZE", default_value = "50")]
    pub batch_size: usize,

    /// Ceiling for the adjusted max fee per gas
    #[clap(long, env = "BLINDVOTED_MAX_FEE_GWEI", default_value = "200")]
    pub max_fee_gwei: u64,

    /// Ceiling for the adjusted priority fee per gas
    #[clap(long, env = "BLINDVOTED_MAX_PRIORITY_FEE_GWEI", default_value = "10")]
    pub max_priority_fee_gwei: u64,

    /// Percentage applied to the node's max fee suggestion
    #[clap(long, env = "BLINDVOTED_MAX_FEE_PCT", default_value = "120")]
    pub max_fee_pct: u64,

    /// Percentage applied to the node's priority fee suggestion
    #[clap(long, env = "BLINDVOTED_PRIORITY_FEE_PCT", default_value = "120")]
    pub priority_fee_pct: u64,

    /// Percentage applied to gas estimates
    #[clap(long, env = "BLINDVOTED_GAS_BUFFER_PCT", default_value = "120")]
    pub gas_buffer_pct: u64,

    /// Submitted batches remembered per engine
    #[clap(long, env = "BLINDVOTED_MAX_CACHE_ENTRIES", default_value = "1000")]
    pub max_cache_entries: usize,

    /// Time between runs
    #[clap(
        long,
        env = "BLINDVOTED_JOB_INTERVAL",
        default_value = "1min",
        value_parser = humantime::parse_duration
    )]
    pub job_interval: Duration,

    /// Below this signer balance (wei) nothing is sent
    #[clap(
        long,
        env = "BLINDVOTED_MIN_BALANCE_WEI",
        default_value = "10000000000000000"
    )]
    pub min_balance_wei: U256,

    /// Below this signer balance (wei) every run warns
    #[clap(
        long,
        env = "BLINDVOTED_LOW_BALANCE_WEI",
        default_value = "100000000000000000"
    )]
    pub low_balance_wei: U256,

    /// Pause after every batch
    #[clap(
        long,
        env = "BLINDVOTED_INTER_BATCH_DELAY",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub inter_batch_delay: Duration,

    /// Pause after an election failed
    #[clap(
        long,
        env = "BLINDVOTED_RECOVERY_DELAY",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub recovery_delay: Duration,

    /// Pause at the end of every run
    #[clap(
        long,
        env = "BLINDVOTED_POST_RUN_DELAY",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub post_run_delay: Duration,

    /// How long to wait for a receipt before a batch counts as failed
    #[clap(
        long,
        env = "BLINDVOTED_CONFIRMATION_TIMEOUT",
        default_value = "2min",
        value_parser = humantime::parse_duration
    )]
    pub confirmation_timeout: Duration,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size <= 1 {
            return Err(ConfigError::BatchSize(self.batch_size));
        }
        for (name, value) in [
            ("max fee", self.max_fee_gwei),
            ("max priority fee", self.max_priority_fee_gwei),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
            if value > FEE_CEILING_SANITY_CAP_GWEI {
                return Err(ConfigError::FeeCeiling { name, value });
            }
        }
        if self.max_fee_pct == 0 {
            return Err(ConfigError::Zero("max fee percentage"));
        }
        if self.priority_fee_pct == 0 {
            return Err(ConfigError::Zero("priority fee percentage"));
        }
        if self.max_cache_entries == 0 {
            return Err(ConfigError::Zero("max cache entries"));
        }
        if self.indexer_lookback == 0 {
            return Err(ConfigError::Zero("indexer lookback"));
        }
        if self.job_interval.is_zero() {
            return Err(ConfigError::Zero("job interval"));
        }
        if self.gas_buffer_pct < 100 {
            return Err(ConfigError::GasBuffer(self.gas_buffer_pct));
        }
        if self.low_balance_wei < self.min_balance_wei {
            return Err(ConfigError::BalanceThresholds);
        }
        Ok(())
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            max_fee_pct: u128::from(self.max_fee_pct),
            priority_fee_pct: u128::from(self.priority_fee_pct),
            max_fee_ceiling: u128::from(self.max_fee_gwei) * GWEI,
            max_priority_fee_ceiling: u128::from(self.max_priority_fee_gwei) * GWEI,
            gas_buffer_pct: self.gas_buffer_pct,
        }
    }

    /// Settings of the engine sending to `contract`
    pub fn engine_settings(&self, contract: Address) -> EngineSettings {
        EngineSettings {
            contract,
            batch_size: self.batch_size,
            min_balance: self.min_balance_wei,
            low_balance: self.low_balance_wei,
            inter_batch_delay: self.inter_batch_delay,
            recovery_delay: self.recovery_delay,
            confirmation_timeout: self.confirmation_timeout,
            indexer_lookback: self.indexer_lookback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "blindvoted",
            "--signer-key",
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
            "--authorization-contract",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "--registration-contract",
            "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512",
            "--indexer-url",
            "http://127.0.0.1:8000/subgraphs/name/ballot",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.job_interval, Duration::from_secs(60));
        assert_eq!(config.fee_policy().max_fee_ceiling, 200 * GWEI);
        let settings = config.engine_settings(config.registration_contract);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.confirmation_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(
            parse(&["--batch-size", "1"]).validate(),
            Err(ConfigError::BatchSize(1))
        );
        parse(&["--batch-size", "2"]).validate().unwrap();
    }

    #[test]
    fn test_fee_sanity_cap() {
        assert!(matches!(
            parse(&["--max-fee-gwei", "10001"]).validate(),
            Err(ConfigError::FeeCeiling { .. })
        ));
        assert!(matches!(
            parse(&["--max-priority-fee-gwei", "0"]).validate(),
            Err(ConfigError::Zero(_))
        ));
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(
            parse(&["--low-balance-wei", "1"]).validate(),
            Err(ConfigError::BalanceThresholds)
        );
        assert_eq!(
            parse(&["--gas-buffer-pct", "90"]).validate(),
            Err(ConfigError::GasBuffer(90))
        );
    }

    #[test]
    fn test_durations() {
        let config = parse(&["--confirmation-timeout", "90s", "--recovery-delay", "250ms"]);
        assert_eq!(config.confirmation_timeout, Duration::from_secs(90));
        assert_eq!(config.recovery_delay, Duration::from_millis(250));
    }
}
