//! Meta-transaction assembly for the relaying service.
//!
//! Voters never pay gas: a vote is ABI-encoded as a ballot contract call, wrapped in an EIP-712
//! `ForwardRequest` signed by the voter's election key, and broadcast by a relayer through a
//! trusted forwarder. The relayer bounds how many requests it forwards per voter.

use crate::*;
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, Eip712Domain, SolCall, SolStruct};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;

sol! {
    #[sol(all_derives)]
    #[derive(Debug, PartialEq, Eq, Hash)]
    struct ForwardRequest {
        address from;
        address to;
        uint256 value;
        uint256 gas;
        uint256 nonce;
        uint256 deadline;
        bytes data;
    }

    function castVote(
        uint256 electionId,
        bytes encryptedVoteRSA,
        bytes encryptedVoteAES,
        bytes token,
        bytes signature,
        bytes svsSignature
    );

    function recastVote(uint256 electionId, bytes encryptedVoteRSA, bytes encryptedVoteAES);
}

/// Where and how forward requests are signed
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RelayConfig {
    pub domain_name: String,
    pub domain_version: String,
    pub chain_id: u64,
    pub forwarder: Address,
    pub ballot_contract: Address,
    pub gas: u64,
}

impl RelayConfig {
    pub fn domain(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some(Cow::Owned(self.domain_name.clone())),
            Some(Cow::Owned(self.domain_version.clone())),
            Some(U256::from(self.chain_id)),
            Some(self.forwarder),
            None,
        )
    }
}

/// A forward request together with the voter's signature over its EIP-712 hash
#[derive(Clone, Debug)]
pub struct SignedForwardRequest {
    pub request: ForwardRequest,
    pub signature: EthSignature,
}

impl SignedForwardRequest {
    pub fn signing_hash(&self, config: &RelayConfig) -> B256 {
        self.request.eip712_signing_hash(&config.domain())
    }

    /// The request was signed by the address it claims to come from
    pub fn verify(&self, config: &RelayConfig) -> Result<(), ValidationError> {
        let signer = recover_address(&self.signing_hash(config), &self.signature)?;
        if signer != self.request.from {
            return Err(ValidationError::SignatureVerificationFailed);
        }
        Ok(())
    }
}

fn payload(encrypted: &EncryptedVotes) -> Result<Bytes, ValidationError> {
    Ok(Bytes::from(encrypted.payload_bytes()?))
}

/// ABI-encoded `castVote` call. The transaction must already be co-signed.
pub fn encode_cast_vote(transaction: &VotingTransaction) -> Result<Bytes, ValidationError> {
    let svs_signature = transaction
        .svs_signature()
        .ok_or(ValidationError::NotCoSigned)?;

    let call = castVoteCall {
        electionId: U256::from(transaction.election_id()),
        encryptedVoteRSA: payload(transaction.encrypted_vote_rsa())?,
        encryptedVoteAES: payload(transaction.encrypted_vote_aes())?,
        token: Bytes::from(transaction.token().to_bytes()),
        signature: Bytes::from(transaction.signature().to_bytes()),
        svsSignature: Bytes::from(svs_signature.to_bytes()),
    };
    Ok(Bytes::from(call.abi_encode()))
}

/// ABI-encoded `recastVote` call
pub fn encode_recast_vote(transaction: &RecastTransaction) -> Result<Bytes, ValidationError> {
    let call = recastVoteCall {
        electionId: U256::from(transaction.election_id),
        encryptedVoteRSA: payload(&transaction.encrypted_vote_rsa)?,
        encryptedVoteAES: payload(&transaction.encrypted_vote_aes)?,
    };
    Ok(Bytes::from(call.abi_encode()))
}

/// Wrap call data in a forward request and sign it with the voter's election key
pub fn sign_forward_request(
    voter_key: &VoterKey,
    data: Bytes,
    nonce: U256,
    deadline: u64,
    config: &RelayConfig,
) -> Result<SignedForwardRequest, Error> {
    let request = ForwardRequest {
        from: voter_key.address(),
        to: config.ballot_contract,
        value: U256::ZERO,
        gas: U256::from(config.gas),
        nonce,
        deadline: U256::from(deadline),
        data,
    };
    let signature = voter_key.sign_hash(&request.eip712_signing_hash(&config.domain()))?;

    Ok(SignedForwardRequest { request, signature })
}

/// Build the signed forward request for a co-signed vote
pub fn relay_vote(
    credentials: &ElectionCredentials,
    transaction: &VotingTransaction,
    nonce: U256,
    deadline: u64,
    config: &RelayConfig,
) -> Result<SignedForwardRequest, Error> {
    if transaction.voter_address() != credentials.voter_address() {
        return Err(ValidationError::AddressKeyMismatch.into());
    }
    let data = encode_cast_vote(transaction)?;
    sign_forward_request(credentials.voter_key(), data, nonce, deadline, config)
}

/// Build the signed forward request for a vote update
pub fn relay_recast(
    credentials: &ElectionCredentials,
    transaction: &RecastTransaction,
    nonce: U256,
    deadline: u64,
    config: &RelayConfig,
) -> Result<SignedForwardRequest, Error> {
    if transaction.voter_address != credentials.voter_address() {
        return Err(ValidationError::AddressKeyMismatch.into());
    }
    let data = encode_recast_vote(transaction)?;
    sign_forward_request(credentials.voter_key(), data, nonce, deadline, config)
}

/// Per-key count of forwarded requests, bounded by a limit
///
/// Implementations must make the read, the increment and the limit check one atomic step, and
/// leave the count unchanged when the limit would be exceeded.
pub trait ForwardCounter: Send + Sync {
    /// Count one more forward for `key`. Returns the new count.
    fn increment_within_limit(&self, key: &str, limit: u32) -> Result<u32, Error>;

    fn current(&self, key: &str) -> Result<u32, Error>;
}

/// Key under which forwards are counted: one budget per voter address and election
pub fn forward_counter_key(election_id: u64, voter_address: &Address) -> String {
    format!("{}:{}", election_id, normalize_hex(&voter_address.to_string()))
}

/// In-process [`ForwardCounter`]
#[derive(Default)]
pub struct MemForwardCounter {
    counts: Mutex<HashMap<String, u32>>,
}

impl MemForwardCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ForwardCounter for MemForwardCounter {
    fn increment_within_limit(&self, key: &str, limit: u32) -> Result<u32, Error> {
        let mut counts = self.counts.lock();
        let previous = counts.get(key).copied().unwrap_or(0);
        let next = previous.saturating_add(1);

        if next > limit {
            tracing::debug!(key, limit, "forward limit reached");
            return Err(Error::ForwardLimitReached { limit });
        }

        counts.insert(key.to_string(), next);
        Ok(next)
    }

    fn current(&self, key: &str) -> Result<u32, Error> {
        Ok(self.counts.lock().get(key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{authority_params, issue_credentials, other_authority_params};
    use std::sync::Arc;

    fn config() -> RelayConfig {
        RelayConfig {
            domain_name: "BallotForwarder".to_string(),
            domain_version: "1".to_string(),
            chain_id: 31337,
            forwarder: Address::repeat_byte(0x11),
            ballot_contract: Address::repeat_byte(0x22),
            gas: 1_000_000,
        }
    }

    #[test]
    fn test_relay_vote() {
        let (register, _) = authority_params();
        let (svs, election_key) = other_authority_params();
        let credentials = issue_credentials(4, register);
        let ballot = encrypt_votes(
            &[3],
            credentials.vote_key(),
            &election_key.to_public_key(),
            2048,
        )
        .unwrap();

        let tx = create_voting_transaction_without_svs_signature(
            &credentials,
            ballot.rsa.clone(),
            ballot.aes.clone(),
        )
        .unwrap();

        // Not co-signed yet
        assert!(relay_vote(&credentials, &tx, U256::ZERO, 1_000, &config()).is_err());

        let tx = add_svs_signature_to_voting_transaction(
            &tx,
            sign_voting_transaction(&tx, svs).unwrap(),
        )
        .unwrap();
        let signed = relay_vote(&credentials, &tx, U256::from(7u64), 1_000, &config()).unwrap();
        assert_eq!(signed.request.from, credentials.voter_address());
        assert_eq!(signed.request.to, config().ballot_contract);
        assert_eq!(signed.request.nonce, U256::from(7u64));
        signed.verify(&config()).unwrap();

        let decoded = castVoteCall::abi_decode(&signed.request.data).unwrap();
        assert_eq!(decoded.electionId, U256::from(4u64));
        assert_eq!(decoded.token.as_ref(), credentials.token().to_bytes().as_slice());

        // Another chain id gives another hash
        let mut other = config();
        other.chain_id = 1;
        assert!(signed.verify(&other).is_err());

        // Tampered call data
        let mut tampered = signed.clone();
        tampered.request.nonce = U256::from(8u64);
        assert!(tampered.verify(&config()).is_err());
    }

    #[test]
    fn test_relay_recast() {
        let (register, election_key) = authority_params();
        let credentials = issue_credentials(4, register);
        let ballot = encrypt_votes(
            &[1],
            credentials.vote_key(),
            &election_key.to_public_key(),
            2048,
        )
        .unwrap();
        let recast = create_recast_transaction(&credentials, ballot.rsa, ballot.aes).unwrap();

        let signed = relay_recast(&credentials, &recast, U256::ZERO, 1_000, &config()).unwrap();
        signed.verify(&config()).unwrap();
        assert!(recastVoteCall::abi_decode(&signed.request.data).is_ok());
    }

    #[test]
    fn test_forward_counter() {
        let counter = MemForwardCounter::new();
        let key = forward_counter_key(1, &Address::repeat_byte(0xAB));

        assert_eq!(counter.increment_within_limit(&key, 2).unwrap(), 1);
        assert_eq!(counter.increment_within_limit(&key, 2).unwrap(), 2);
        assert!(matches!(
            counter.increment_within_limit(&key, 2),
            Err(Error::ForwardLimitReached { limit: 2 })
        ));
        // Rolled back
        assert_eq!(counter.current(&key).unwrap(), 2);

        // Independent keys
        let other = forward_counter_key(2, &Address::repeat_byte(0xAB));
        assert_eq!(counter.increment_within_limit(&other, 2).unwrap(), 1);
    }

    #[test]
    fn test_forward_counter_concurrent() {
        let counter = Arc::new(MemForwardCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| counter.increment_within_limit("voter", 25).is_ok())
                        .count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 25);
        assert_eq!(counter.current("voter").unwrap(), 25);
    }
}
