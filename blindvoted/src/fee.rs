//! EIP-1559 fee adjustment and gas limit padding for batch transactions.

pub const GWEI: u128 = 1_000_000_000;

/// Floor for the priority fee, whatever the node suggests
pub const MIN_PRIORITY_FEE: u128 = GWEI;

/// What the node suggests. Any of it may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeSuggestion {
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub base_fee_per_gas: Option<u128>,
}

/// Fees a batch transaction is sent with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fees {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FeePolicyError {
    #[error("node returned no fee data")]
    MissingFeeData,
    #[error("max fee {fee} wei exceeds ceiling {ceiling} wei")]
    MaxFeeAboveCeiling { fee: u128, ceiling: u128 },
    #[error("priority fee {fee} wei exceeds ceiling {ceiling} wei")]
    PriorityFeeAboveCeiling { fee: u128, ceiling: u128 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    /// Percentage applied to the suggested max fee
    pub max_fee_pct: u128,
    /// Percentage applied to the suggested priority fee
    pub priority_fee_pct: u128,
    /// Operator ceilings, in wei
    pub max_fee_ceiling: u128,
    pub max_priority_fee_ceiling: u128,
    /// Percentage applied to gas estimates
    pub gas_buffer_pct: u64,
}

impl FeePolicy {
    /// Adjust the node's suggestion and check it against the ceilings.
    ///
    /// When the block base fee is known, the max fee is raised to at least
    /// `2 * base_fee + priority` so a stale suggestion still gets included.
    pub fn adjust(&self, suggestion: &FeeSuggestion) -> Result<Fees, FeePolicyError> {
        let (network_max, network_priority) = match (
            suggestion.max_fee_per_gas,
            suggestion.max_priority_fee_per_gas,
        ) {
            (Some(max), Some(priority)) => (max, priority),
            _ => return Err(FeePolicyError::MissingFeeData),
        };

        let priority = (network_priority.saturating_mul(self.priority_fee_pct) / 100)
            .max(MIN_PRIORITY_FEE);

        let mut max = network_max.saturating_mul(self.max_fee_pct) / 100;
        if let Some(base_fee) = suggestion.base_fee_per_gas {
            let floor = base_fee.saturating_mul(2).saturating_add(priority);
            if max < floor {
                tracing::debug!(max, floor, "raising max fee to base fee floor");
                max = floor;
            }
        }
        // A max fee below the tip is rejected by nodes
        let max = max.max(priority);

        if priority > self.max_priority_fee_ceiling {
            return Err(FeePolicyError::PriorityFeeAboveCeiling {
                fee: priority,
                ceiling: self.max_priority_fee_ceiling,
            });
        }
        if max > self.max_fee_ceiling {
            return Err(FeePolicyError::MaxFeeAboveCeiling {
                fee: max,
                ceiling: self.max_fee_ceiling,
            });
        }

        Ok(Fees {
            max_fee_per_gas: max,
            max_priority_fee_per_gas: priority,
        })
    }

    pub fn gas_limit(&self, estimate: u64) -> u64 {
        estimate.saturating_mul(self.gas_buffer_pct) / 100
    }
}
