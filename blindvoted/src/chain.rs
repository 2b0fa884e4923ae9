//! The chain the engine submits batches to.
//!
//! Current implementations:
//! - alloy (HTTP provider with a local signer)
//! - scripted (in tests)

use crate::fee::{FeeSuggestion, Fees};
use alloy::eips::BlockNumberOrTag;
use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder as _};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider as _, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::Context as _;
use secrecy::{ExposeSecret as _, SecretString};
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

pub type ChainService = Arc<dyn ChainClient>;

/// A contract call carrying one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCall {
    pub to: Address,
    pub data: Bytes,
}

/// A broadcast transaction whose outcome is not known yet
#[async_trait]
pub trait PendingSubmission: Send {
    fn tx_hash(&self) -> B256;

    /// Wait for the receipt. `true` iff the transaction succeeded.
    async fn confirm(self: Box<Self>) -> eyre::Result<bool>;
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address batches are sent from
    fn signer(&self) -> Address;

    async fn get_balance(&self, address: Address) -> eyre::Result<U256>;

    /// Suggested `(max_fee_per_gas, max_priority_fee_per_gas)`, if the node offers them
    async fn get_fee_data(&self) -> eyre::Result<(Option<u128>, Option<u128>)>;

    /// Base fee of the latest block, on chains that have one
    async fn get_base_fee(&self) -> eyre::Result<Option<u128>>;

    async fn estimate_gas(&self, call: &BatchCall) -> eyre::Result<u64>;

    async fn send_transaction(
        &self,
        call: &BatchCall,
        gas_limit: u64,
        fees: &Fees,
    ) -> eyre::Result<Box<dyn PendingSubmission>>;
}

/// Everything the fee policy needs, from two calls
pub async fn fee_suggestion(chain: &dyn ChainClient) -> eyre::Result<FeeSuggestion> {
    let (max_fee_per_gas, max_priority_fee_per_gas) = chain.get_fee_data().await?;
    let base_fee_per_gas = chain.get_base_fee().await?;
    Ok(FeeSuggestion {
        max_fee_per_gas,
        max_priority_fee_per_gas,
        base_fee_per_gas,
    })
}

pub struct AlloyChain {
    provider: DynProvider,
    signer: Address,
}

impl AlloyChain {
    #[instrument(level = "info", skip_all)]
    pub fn connect(rpc_url: &SecretString, signer_key: &SecretString) -> eyre::Result<Self> {
        let signer = PrivateKeySigner::from_str(signer_key.expose_secret())
            .context("while parsing signer key")?;
        let address = signer.address();
        tracing::info!("signer address: {address}");
        let wallet = EthereumWallet::from(signer);

        let url = rpc_url
            .expose_secret()
            .parse()
            .context("while parsing rpc url")?;
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url)
            .erased();

        Ok(AlloyChain {
            provider,
            signer: address,
        })
    }
}

struct AlloyPending {
    inner: PendingTransactionBuilder<Ethereum>,
}

#[async_trait]
impl PendingSubmission for AlloyPending {
    fn tx_hash(&self) -> B256 {
        *self.inner.tx_hash()
    }

    async fn confirm(self: Box<Self>) -> eyre::Result<bool> {
        let receipt = self
            .inner
            .get_receipt()
            .await
            .context("while waiting for receipt")?;
        Ok(receipt.status())
    }
}

#[async_trait]
impl ChainClient for AlloyChain {
    fn signer(&self) -> Address {
        self.signer
    }

    async fn get_balance(&self, address: Address) -> eyre::Result<U256> {
        Ok(self.provider.get_balance(address).await?)
    }

    async fn get_fee_data(&self) -> eyre::Result<(Option<u128>, Option<u128>)> {
        match self.provider.estimate_eip1559_fees().await {
            Ok(estimate) => Ok((
                Some(estimate.max_fee_per_gas),
                Some(estimate.max_priority_fee_per_gas),
            )),
            Err(err) => {
                tracing::warn!("node gave no fee data: {err}");
                Ok((None, None))
            }
        }
    }

    async fn get_base_fee(&self) -> eyre::Result<Option<u128>> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await?;
        Ok(block.and_then(|b| b.header.base_fee_per_gas.map(u128::from)))
    }

    async fn estimate_gas(&self, call: &BatchCall) -> eyre::Result<u64> {
        let tx = TransactionRequest::default()
            .with_from(self.signer)
            .with_to(call.to)
            .with_input(call.data.clone());
        Ok(self.provider.estimate_gas(tx).await?)
    }

    async fn send_transaction(
        &self,
        call: &BatchCall,
        gas_limit: u64,
        fees: &Fees,
    ) -> eyre::Result<Box<dyn PendingSubmission>> {
        let tx = TransactionRequest::default()
            .with_from(self.signer)
            .with_to(call.to)
            .with_input(call.data.clone())
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas);

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .context("while broadcasting to network")?;
        Ok(Box::new(AlloyPending { inner: pending }))
    }
}
