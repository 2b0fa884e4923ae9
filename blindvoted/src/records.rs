//! Pending authorization and registration records, and how a batch of them becomes one contract call.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall as _;
use blindvote::{normalize_hex, Signature, Token};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

sol! {
    function authorizeVoters(uint256 electionId, address[] voters);

    function registerVoters(
        uint256 electionId,
        address[] voters,
        bytes[] blindedSignatures,
        bytes[] blindedTokens
    );
}

/// On-chain lifecycle of a pending record
///
/// `Pending -> Submitted -> Confirmed | Failed`. A broadcast that never reached the chain goes
/// straight from `Pending` to `Failed`. `Confirmed` and `Failed` are terminal.
#[derive(
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending = 0,
    Submitted = 1,
    Confirmed = 2,
    Failed = 3,
}

impl RecordStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Submitted => "submitted",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Confirmed | RecordStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Pending, RecordStatus::Submitted)
                | (RecordStatus::Pending, RecordStatus::Failed)
                | (RecordStatus::Submitted, RecordStatus::Confirmed)
                | (RecordStatus::Submitted, RecordStatus::Failed)
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Authorization,
    Registration,
}

impl RecordKind {
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Authorization => "authorization",
            RecordKind::Registration => "registration",
        }
    }
}

/// What every batched record exposes to the engine.
///
/// One engine runs per record kind; the kind decides the contract call and which payload values
/// take part in de-duplication besides the voter.
pub trait PendingRecord: Clone + Send + Sync + std::fmt::Debug + 'static {
    const KIND: RecordKind;

    fn id(&self) -> i64;

    fn election_id(&self) -> u64;

    fn voter_address(&self) -> Address;

    fn state(&self) -> &SubmissionState;

    fn state_mut(&mut self) -> &mut SubmissionState;

    fn status(&self) -> RecordStatus {
        self.state().status
    }

    /// Voters are identified on chain by address, compared in normalized form
    fn voter_id(&self) -> String {
        normalize_hex(&self.voter_address().to_string())
    }

    /// Normalized payload values that must never be submitted twice. Empty for authorizations.
    fn fingerprints(&self) -> Vec<String>;

    /// Contract call data for one batch; every record belongs to `election_id`
    fn encode_batch(election_id: u64, records: &[Self]) -> Bytes;
}

/// Bookkeeping common to both record kinds
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubmissionState {
    pub status: RecordStatus,
    pub tx_hash: Option<B256>,
    pub batch_id: Option<String>,
}

impl SubmissionState {
    pub fn pending() -> Self {
        SubmissionState {
            status: RecordStatus::Pending,
            tx_hash: None,
            batch_id: None,
        }
    }
}

/// An authority's decision that a voter may register for an election
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Authorization {
    pub id: i64,
    pub election_id: u64,
    pub voter_address: Address,
    pub state: SubmissionState,
}

/// A completed blind-signature issuance, published so the token cannot be issued twice
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: i64,
    pub election_id: u64,
    pub voter_address: Address,
    pub blinded_token: Token,
    pub blind_signature: Signature,
    pub state: SubmissionState,
}

impl PendingRecord for Authorization {
    const KIND: RecordKind = RecordKind::Authorization;

    fn id(&self) -> i64 {
        self.id
    }

    fn election_id(&self) -> u64 {
        self.election_id
    }

    fn voter_address(&self) -> Address {
        self.voter_address
    }

    fn state(&self) -> &SubmissionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SubmissionState {
        &mut self.state
    }

    fn fingerprints(&self) -> Vec<String> {
        Vec::new()
    }

    fn encode_batch(election_id: u64, records: &[Self]) -> Bytes {
        let call = authorizeVotersCall {
            electionId: U256::from(election_id),
            voters: records.iter().map(|r| r.voter_address).collect(),
        };
        Bytes::from(call.abi_encode())
    }
}

impl PendingRecord for Registration {
    const KIND: RecordKind = RecordKind::Registration;

    fn id(&self) -> i64 {
        self.id
    }

    fn election_id(&self) -> u64 {
        self.election_id
    }

    fn voter_address(&self) -> Address {
        self.voter_address
    }

    fn state(&self) -> &SubmissionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SubmissionState {
        &mut self.state
    }

    fn fingerprints(&self) -> Vec<String> {
        vec![
            hex::encode(self.blind_signature.to_bytes()),
            hex::encode(self.blinded_token.to_bytes()),
        ]
    }

    fn encode_batch(election_id: u64, records: &[Self]) -> Bytes {
        let call = registerVotersCall {
            electionId: U256::from(election_id),
            voters: records.iter().map(|r| r.voter_address).collect(),
            blindedSignatures: records
                .iter()
                .map(|r| Bytes::from(r.blind_signature.to_bytes()))
                .collect(),
            blindedTokens: records
                .iter()
                .map(|r| Bytes::from(r.blinded_token.to_bytes()))
                .collect(),
        };
        Bytes::from(call.abi_encode())
    }
}
